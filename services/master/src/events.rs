use fleet_protocol::{ExecStatus, LogStream, NodeStatus};
use serde::Serialize;

/// Events pushed to connected viewers.
///
/// `node_update` and `heartbeat` go to the global set; `log_line` and
/// `cmd_done` go to the per-node log sets.  One JSON object per WS frame,
/// tagged by `type`.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewerEvent {
    NodeUpdate {
        node_id: String,
        status: NodeStatus,
    },
    Heartbeat {
        node_id: String,
        status: NodeStatus,
        cpu_percent: f64,
        mem_percent: f64,
    },
    LogLine {
        exec_id: String,
        node_id: String,
        stream: LogStream,
        line: String,
        timestamp: f64,
    },
    CmdDone {
        exec_id: String,
        node_id: String,
        exit_code: i32,
        status: ExecStatus,
    },
}

impl ViewerEvent {
    pub fn node_update(node_id: &str, status: NodeStatus) -> Self {
        ViewerEvent::NodeUpdate {
            node_id: node_id.to_owned(),
            status,
        }
    }
}
