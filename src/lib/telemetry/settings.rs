use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables of the telemetry engine.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Period of the polling timer.
    pub poll_interval_ms: u64,
    /// Polls closer than this to the previous one re-deliver the last result.
    pub min_poll_spacing_ms: u64,
    /// A connection whose stats are not ready within this window counts as a
    /// failed fetch for the tick.
    pub fetch_timeout_ms: u64,
    pub cpu_sampler: bool,
    pub cpu_sample_interval_ms: u64,
    pub cpu_pressure_threshold_pct: f64,
    /// Rolling loss samples kept per outbound stream.
    pub packet_loss_history: usize,
    /// View receiving records that cannot be attributed to a client.
    pub default_view_id: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            min_poll_spacing_ms: 400,
            fetch_timeout_ms: 2000,
            cpu_sampler: true,
            cpu_sample_interval_ms: 1000,
            cpu_pressure_threshold_pct: 80.0,
            packet_loss_history: 10,
            default_view_id: "unknown".to_string(),
        }
    }
}

impl EngineSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn min_poll_spacing(&self) -> Duration {
        Duration::from_millis(self.min_poll_spacing_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms.max(1))
    }

    pub fn cpu_sample_interval(&self) -> Duration {
        Duration::from_millis(self.cpu_sample_interval_ms.max(1))
    }
}
