//! Node identity cache.
//!
//! The file holds exactly the Master-assigned 12-hex node id.  It is read
//! at startup for logging and continuity, and overwritten on every
//! registration ack — the Master stays authoritative.

use std::fs;
use std::path::Path;

pub fn load(path: &Path) -> Option<String> {
    let contents = fs::read_to_string(path).ok()?;
    let node_id = contents.trim();
    if node_id.is_empty() {
        None
    } else {
        Some(node_id.to_owned())
    }
}

pub fn save(path: &Path, node_id: &str) -> std::io::Result<()> {
    fs::write(path, node_id)
}
