// fleet-protocol: Agent/Master bus protocol types and serialization.
//
// All bus payloads use a top-level `kind` field for discriminated
// deserialization.  The enum variants map 1:1 to the message kinds.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// Bidirectional registration topic: `register_req` up, ack/nak down.
pub const TOPIC_REGISTER: &str = "system/register";

/// Agent -> Master heartbeat topic, shared by the whole fleet.
pub const TOPIC_HEARTBEAT: &str = "system/heartbeat";

/// Single-level wildcard the Master subscribes to for all node logs.
pub const TOPIC_LOG_WILDCARD: &str = "log/+";

/// Per-node command topic (Master -> one Agent).
pub fn topic_cmd(node_id: &str) -> String {
    format!("cmd/{node_id}")
}

/// Per-node log topic (Agent -> Master).
pub fn topic_log(node_id: &str) -> String {
    format!("log/{node_id}")
}

/// Current wall-clock time as fractional UNIX seconds, the wire timestamp
/// format used by every message kind.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ---------------------------------------------------------------------------
// Shared enums
// ---------------------------------------------------------------------------

/// Node liveness/activity state as persisted by the Master and reported in
/// heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Offline,
    Online,
    Idle,
    Busy,
}

impl NodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Offline => "offline",
            NodeStatus::Online => "online",
            NodeStatus::Idle => "idle",
            NodeStatus::Busy => "busy",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "offline" => Ok(NodeStatus::Offline),
            "online" => Ok(NodeStatus::Online),
            "idle" => Ok(NodeStatus::Idle),
            "busy" => Ok(NodeStatus::Busy),
            other => Err(format!("unknown node status: {other}")),
        }
    }
}

/// Which subprocess pipe a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }
}

impl fmt::Display for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution lifecycle state.  `Success` iff the exit code was zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecStatus {
    Running,
    Success,
    Failed,
}

impl ExecStatus {
    /// Terminal status for a finished command.
    pub fn from_exit_code(exit_code: i32) -> Self {
        if exit_code == 0 {
            ExecStatus::Success
        } else {
            ExecStatus::Failed
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecStatus::Running => "running",
            ExecStatus::Success => "success",
            ExecStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ExecStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Agent -> Master messages
// ---------------------------------------------------------------------------

/// Registration request, published on `system/register` at Agent startup.
///
/// Carries the configured `node_name`, never a cached node id — identity is
/// always authoritative from the Master, which reuses the existing row when
/// the name is already known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterReq {
    pub node_name: String,
    pub secret_key: String,
    pub ip: String,
    pub timestamp: f64,
}

/// Periodic liveness report.  `cpu_percent` / `mem_percent` are best-effort
/// and zero when the Agent cannot sample them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_id: String,
    pub status: NodeStatus,
    pub cpu_percent: f64,
    pub mem_percent: f64,
    pub timestamp: f64,
}

/// One line of subprocess output, trailing newline stripped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub exec_id: String,
    pub node_id: String,
    pub stream: LogStream,
    pub line: String,
    pub timestamp: f64,
}

/// Command completion notice.  Exit code -1 means the subprocess could not
/// be spawned or was terminated by a signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CmdDone {
    pub exec_id: String,
    pub node_id: String,
    pub exit_code: i32,
    pub timestamp: f64,
}

// ---------------------------------------------------------------------------
// Master -> Agent messages
// ---------------------------------------------------------------------------

/// Successful registration: the assigned (or reused) node identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterAck {
    pub node_id: String,
    pub message: String,
}

/// Registration denial.  The Agent terminates on receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterNak {
    pub reason: String,
}

/// Command dispatch, published on `cmd/<node_id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cmd {
    pub exec_id: String,
    pub command: String,
    pub timestamp: f64,
}

// ---------------------------------------------------------------------------
// Top-level discriminated union
// ---------------------------------------------------------------------------

/// All bus message kinds.
///
/// Serializes/deserializes using the `kind` field as a tag:
///
/// ```json
/// { "kind": "register_req", ... }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum BusMessage {
    RegisterReq(RegisterReq),
    RegisterAck(RegisterAck),
    RegisterNak(RegisterNak),
    Heartbeat(Heartbeat),
    Cmd(Cmd),
    LogLine(LogLine),
    CmdDone(CmdDone),
}
