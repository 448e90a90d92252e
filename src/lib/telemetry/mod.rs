//! Media-quality telemetry: polls transport statistics, derives per-stream
//! metrics, tracks quality issues per participant and publishes the result to
//! subscribers.

pub mod aggregator;
pub mod bus;
pub mod collaborators;
pub mod collector;
pub mod detectors;
pub mod error;
pub mod extractor;
pub mod issues;
pub mod settings;
pub mod system_metrics;
pub mod types;

pub use bus::{Engine, IssueObserver, Subscription, TickReport};
pub use collaborators::{
    ClientInfo, ClientProvider, ConnectionHandle, ConnectionRegistry, InMemoryRegistry,
    StatsSource,
};
pub use error::{Result, TelemetryError};
pub use settings::EngineSettings;
