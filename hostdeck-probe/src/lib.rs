//! Hostdeck Probe - health and resource checks for fleet nodes
//!
//! One probe invocation checks one machine and yields a [`HeartbeatResult`]:
//! - [`LocalProbe`]: in-process metrics for the control-plane host (sysinfo)
//! - [`RemoteSshProbe`]: one composite shell command over SSH
//! - [`TcpPingProbe`]: raw TCP reachability of the node's SSH port
//! - [`FallbackProbe`]: decorator running a second probe when the first one fails

pub mod execution;
pub mod metrics;
pub mod parse;
pub mod probe;

pub use execution::{SshCredentials, SshRunner};
pub use metrics::NodeMetrics;
pub use parse::{parse_heartbeat_line, HEARTBEAT_COMMAND};
pub use probe::{
    FallbackProbe, HeartbeatResult, LocalProbe, NodeProbe, ProbeError, ProbeTarget,
    RemoteSshProbe, TcpPingProbe, DEFAULT_SSH_PORT,
};
