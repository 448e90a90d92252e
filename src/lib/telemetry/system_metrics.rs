use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use serde::Serialize;
use sysinfo::{CpuExt, System, SystemExt};
use tokio::task::JoinHandle;
use tracing::*;

/// Host-level metrics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetrics {
    pub cpu_pct: f64,
    pub load_1m: f64,
    pub mem_used_pct: f64,
}

/// Refresh `system` and read one snapshot. CPU usage is a delta against the
/// previous refresh, so the first call after `System::new` reads 0.
pub fn snapshot(system: &mut System) -> SystemMetrics {
    system.refresh_cpu();
    system.refresh_memory();

    let total_memory = system.total_memory();
    let mem_used_pct = if total_memory > 0 {
        (system.used_memory() as f64 / total_memory as f64) * 100.0
    } else {
        0.0
    };

    let cpu_pct = system.global_cpu_info().cpu_usage() as f64;

    SystemMetrics {
        cpu_pct: if cpu_pct.is_finite() { cpu_pct } else { 0.0 },
        load_1m: system.load_average().one,
        mem_used_pct,
    }
}

/// Read side of a [`CpuSampler`], cheap to clone into other tasks.
#[derive(Clone, Debug, Default)]
pub struct SystemMetricsReader {
    latest: Arc<Mutex<Option<SystemMetrics>>>,
}

impl SystemMetricsReader {
    /// The most recent sample, if one was taken already.
    pub fn latest(&self) -> Option<SystemMetrics> {
        self.latest.lock().ok().and_then(|latest| latest.clone())
    }
}

/// Periodically samples host metrics while at least one engine subscriber
/// exists. The task is aborted when the sampler is dropped.
pub struct CpuSampler {
    latest: Arc<Mutex<Option<SystemMetrics>>>,
    task: JoinHandle<()>,
}

impl CpuSampler {
    /// Must be called from within a tokio runtime.
    #[instrument(level = "debug")]
    pub fn start(interval: Duration) -> Self {
        let latest = Arc::new(Mutex::new(None));

        let task = tokio::spawn({
            let latest = latest.clone();
            async move {
                let mut interval = tokio::time::interval(interval);
                let mut system = System::new();
                // Prime the CPU counters, the first delta is meaningless
                system.refresh_cpu();

                interval.tick().await;
                loop {
                    interval.tick().await;

                    let metrics = snapshot(&mut system);
                    trace!("System metrics: {metrics:?}");

                    match latest.lock() {
                        Ok(mut latest) => *latest = Some(metrics),
                        Err(error) => {
                            error!("System metrics lock is poisoned: {error:?}");
                            break;
                        }
                    }
                }
            }
        });

        debug!("CPU sampler started");

        Self { latest, task }
    }

    pub fn reader(&self) -> SystemMetricsReader {
        SystemMetricsReader {
            latest: self.latest.clone(),
        }
    }

    pub fn latest(&self) -> Option<SystemMetrics> {
        self.reader().latest()
    }
}

impl Drop for CpuSampler {
    fn drop(&mut self) {
        self.task.abort();
        debug!("CPU sampler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reports_percentages() {
        let mut system = System::new();
        snapshot(&mut system);
        let metrics = snapshot(&mut system);

        assert!((0.0..=100.0).contains(&metrics.mem_used_pct));
        assert!(metrics.cpu_pct.is_finite());
    }

    #[tokio::test(start_paused = true)]
    async fn sampler_publishes_after_the_priming_interval() {
        let sampler = CpuSampler::start(Duration::from_millis(1000));
        let reader = sampler.reader();
        assert!(sampler.latest().is_none());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(reader.latest().is_some());

        drop(sampler);
        assert!(reader.latest().is_some());
    }
}
