//! Shell subprocess executor.
//!
//! Spawns `sh -c <command>` with piped stdout/stderr, pumps both pipes
//! concurrently line-by-line onto the node's log topic, then waits for the
//! child and publishes one `cmd_done` with the exit code.  Publish
//! failures are logged and never leave the child orphaned: both pipes are
//! drained and the child is awaited on every path.

use fleet_bus::BusPublisher;
use fleet_protocol::{topic_log, unix_now, BusMessage, CmdDone, LogLine, LogStream};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{error, warn};

/// Reported when the shell cannot be spawned or the child was terminated
/// by a signal.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = -1;

/// Run `command` under the default shell, streaming output as it appears.
/// Returns the exit code that was published in the `cmd_done`.
pub async fn execute<P: BusPublisher>(
    bus: &P,
    command: &str,
    exec_id: &str,
    node_id: &str,
) -> i32 {
    execute_with_shell("sh", bus, command, exec_id, node_id).await
}

pub(crate) async fn execute_with_shell<P: BusPublisher>(
    shell: &str,
    bus: &P,
    command: &str,
    exec_id: &str,
    node_id: &str,
) -> i32 {
    let log_topic = topic_log(node_id);

    let mut child = match Command::new(shell)
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            error!(exec_id, error = %e, "failed to spawn shell");
            publish_line(
                bus,
                &log_topic,
                exec_id,
                node_id,
                LogStream::Stderr,
                &format!("failed to start command: {e}"),
            )
            .await;
            publish_done(bus, &log_topic, exec_id, node_id, SPAWN_FAILURE_EXIT_CODE).await;
            return SPAWN_FAILURE_EXIT_CODE;
        }
    };

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    tokio::join!(
        pump_lines(stdout, LogStream::Stdout, bus, &log_topic, exec_id, node_id),
        pump_lines(stderr, LogStream::Stderr, bus, &log_topic, exec_id, node_id),
    );

    let exit_code = match child.wait().await {
        // `code()` is None when the child was killed by a signal.
        Ok(status) => status.code().unwrap_or(SPAWN_FAILURE_EXIT_CODE),
        Err(e) => {
            error!(exec_id, error = %e, "failed to reap child");
            SPAWN_FAILURE_EXIT_CODE
        }
    };
    publish_done(bus, &log_topic, exec_id, node_id, exit_code).await;
    exit_code
}

/// Read one pipe to EOF, publishing each line as it arrives.
async fn pump_lines<R, P>(
    reader: Option<R>,
    stream: LogStream,
    bus: &P,
    log_topic: &str,
    exec_id: &str,
    node_id: &str,
) where
    R: AsyncRead + Unpin,
    P: BusPublisher,
{
    let Some(reader) = reader else { return };
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = decode_line(&buf);
                publish_line(bus, log_topic, exec_id, node_id, stream, &line).await;
            }
            Err(e) => {
                warn!(exec_id, stream = %stream, error = %e, "pipe read failed");
                break;
            }
        }
    }
}

/// Lossy UTF-8 decode with a single trailing `\n` or `\r\n` stripped.
fn decode_line(raw: &[u8]) -> String {
    let mut end = raw.len();
    if end > 0 && raw[end - 1] == b'\n' {
        end -= 1;
        if end > 0 && raw[end - 1] == b'\r' {
            end -= 1;
        }
    }
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

async fn publish_line<P: BusPublisher>(
    bus: &P,
    log_topic: &str,
    exec_id: &str,
    node_id: &str,
    stream: LogStream,
    line: &str,
) {
    let msg = BusMessage::LogLine(LogLine {
        exec_id: exec_id.to_owned(),
        node_id: node_id.to_owned(),
        stream,
        line: line.to_owned(),
        timestamp: unix_now(),
    });
    if let Err(e) = bus.publish(log_topic, &msg).await {
        warn!(exec_id, error = %e, "log line publish failed");
    }
}

async fn publish_done<P: BusPublisher>(
    bus: &P,
    log_topic: &str,
    exec_id: &str,
    node_id: &str,
    exit_code: i32,
) {
    let msg = BusMessage::CmdDone(CmdDone {
        exec_id: exec_id.to_owned(),
        node_id: node_id.to_owned(),
        exit_code,
        timestamp: unix_now(),
    });
    if let Err(e) = bus.publish(log_topic, &msg).await {
        warn!(exec_id, error = %e, "cmd_done publish failed");
    }
}
