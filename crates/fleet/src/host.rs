//! Host-level CPU and memory metrics.

use {anyhow::Result, async_trait::async_trait, sysinfo::System};

#[async_trait]
pub trait HostMetrics: Send + Sync {
    /// Host-wide CPU usage, 0-100.
    async fn host_cpu_percent(&self) -> Result<f64>;

    /// Host memory usage, 0-100.
    async fn host_ram_percent(&self) -> Result<f64>;
}

/// Reads metrics through the `sysinfo` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoHostMetrics;

#[async_trait]
impl HostMetrics for SysinfoHostMetrics {
    async fn host_cpu_percent(&self) -> Result<f64> {
        // CPU usage is a delta between two refreshes.
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
        sys.refresh_cpu_usage();
        Ok(f64::from(sys.global_cpu_usage()))
    }

    async fn host_ram_percent(&self) -> Result<f64> {
        let mut sys = System::new();
        sys.refresh_memory();
        Ok(memory_percent(sys.used_memory(), sys.total_memory()))
    }
}

#[allow(clippy::cast_precision_loss)]
fn memory_percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (used as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}
