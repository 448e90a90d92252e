use super::collaborators::ConnectionHandle;

pub type Result<T> = std::result::Result<T, TelemetryError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TelemetryError {
    #[error("Failed fetching stats for connection {connection}: {reason}")]
    Fetch {
        connection: ConnectionHandle,
        reason: String,
    },

    #[error("Malformed stats record {id:?}: {reason}")]
    MalformedRecord { id: String, reason: String },

    #[error("No async runtime available to drive the engine")]
    NoRuntime,
}
