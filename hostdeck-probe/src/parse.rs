//! Heartbeat line emitted by the remote composite command
//!
//! Format: `idle|total used|disk|uptime`, e.g. `5|2048 1024|42|123456.78`.

use crate::metrics::NodeMetrics;

/// Single round trip: CPU idle %, memory total/used (MB), root disk use %, uptime seconds.
pub const HEARTBEAT_COMMAND: &str = concat!(
    "echo \"",
    "$(top -bn1 | grep 'Cpu(s)' | sed 's/.*, *\\([0-9.]*\\)%* id.*/\\1/')|",
    "$(free -m | awk '/Mem:/ {print $2\" \"$3}')|",
    "$(df -P / | awk 'NR==2 {print $5}' | tr -d '%')|",
    "$(awk '{print $1}' /proc/uptime)",
    "\"",
);

/// Parse one heartbeat line into node metrics.
///
/// Missing or non-numeric fields become 0 instead of failing the whole line.
pub fn parse_heartbeat_line(line: &str) -> NodeMetrics {
    let mut fields = line.trim().split('|');
    let idle = fields.next().and_then(number);
    let memory = fields.next().unwrap_or_default();
    let disk = fields.next().and_then(number);
    let uptime = fields.next().and_then(number);

    let mut mem = memory.split_whitespace();
    let total = mem.next().and_then(number);
    let used = mem.next().and_then(number);

    let ram_usage = match (total, used) {
        (Some(total), Some(used)) if total > 0.0 => used / total * 100.0,
        _ => 0.0,
    };

    NodeMetrics {
        cpu_usage: idle.map(|idle| 100.0 - idle).unwrap_or(0.0),
        ram_usage,
        disk_usage: disk.unwrap_or(0.0),
        uptime: uptime.unwrap_or(0.0),
    }
}

fn number(field: &str) -> Option<f64> {
    field
        .trim()
        .trim_end_matches('%')
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}
