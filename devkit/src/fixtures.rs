/*!
Fixtures for the node table and sockets
*/

use anyhow::Result;
use serde_json::{json, Value};
use std::path::Path;

/// A TCP port that was free a moment ago on 127.0.0.1
pub fn free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Row for the control-plane host itself
pub fn local_node(id: i64) -> Value {
    json!({
        "id": id,
        "name": format!("local-{id}"),
        "ip": "127.0.0.1",
        "is_local": true,
        "status": "offline",
        "cpu_usage": 0.0,
        "ram_usage": 0.0,
        "disk_usage": 0.0,
        "uptime": 0.0
    })
}

/// Row for a remote machine without credentials; add `ssh_user`/`ssh_password` as needed
pub fn remote_node(id: i64, ip: &str, ssh_port: u16) -> Value {
    json!({
        "id": id,
        "name": format!("remote-{id}"),
        "ip": ip,
        "is_local": false,
        "ssh_port": ssh_port,
        "status": "active",
        "cpu_usage": 11.0,
        "ram_usage": 22.0,
        "disk_usage": 33.0,
        "uptime": 44.0
    })
}

/// Write rows in the JSON layout read by the kernel's node store
pub fn write_nodes_file(path: &Path, nodes: &[Value]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(nodes)?)?;
    Ok(())
}
