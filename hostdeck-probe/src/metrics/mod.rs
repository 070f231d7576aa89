//! Resource metrics for the local node
//!
//! Collects the four figures persisted on a node row:
//! - CPU usage over a short sampling window
//! - Memory usage (total minus available)
//! - Disk usage of the primary volume
//! - System uptime in seconds

use std::path::Path;
use std::time::Duration;
use sysinfo::{Disks, System};
use tracing::debug;

use crate::probe::ProbeError;

/// Gap between the two CPU samples; sysinfo needs a delta to compute usage
const CPU_SAMPLE_WINDOW: Duration = Duration::from_millis(200);

/// Resource figures written into a node row (percentages in 0..=100, uptime in seconds)
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NodeMetrics {
    pub cpu_usage: f64,
    pub ram_usage: f64,
    pub disk_usage: f64,
    pub uptime: f64,
}

impl NodeMetrics {
    /// Collect metrics for the host this process runs on.
    ///
    /// Blocks for the CPU sampling window, so callers on the async runtime
    /// should go through [`crate::LocalProbe`], which moves it to a blocking thread.
    pub fn collect_local() -> Result<Self, ProbeError> {
        debug!("Collecting local node metrics...");

        let mut sys = System::new();
        sys.refresh_cpu_usage();
        std::thread::sleep(CPU_SAMPLE_WINDOW.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL));
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let cpu_usage = sys.global_cpu_info().cpu_usage() as f64;

        let total = sys.total_memory();
        if total == 0 {
            return Err(ProbeError::Metrics("memory totals unavailable".to_string()));
        }
        let used = total.saturating_sub(sys.available_memory());
        let ram_usage = used as f64 / total as f64 * 100.0;

        let disk_usage = primary_disk_usage();
        let uptime = System::uptime() as f64;

        Ok(NodeMetrics {
            cpu_usage,
            ram_usage,
            disk_usage,
            uptime,
        })
    }
}

/// Usage of the volume mounted at `/`, or of the first listed disk when there is none
fn primary_disk_usage() -> f64 {
    let disks = Disks::new_with_refreshed_list();
    let primary = disks
        .list()
        .iter()
        .find(|d| d.mount_point() == Path::new("/"))
        .or_else(|| disks.list().first());

    match primary {
        Some(disk) if disk.total_space() > 0 => {
            let used = disk.total_space().saturating_sub(disk.available_space());
            used as f64 / disk.total_space() as f64 * 100.0
        }
        _ => 0.0,
    }
}
