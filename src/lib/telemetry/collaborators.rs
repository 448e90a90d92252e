//! Interfaces of the collaborators the engine polls: the connection registry,
//! the per-connection statistics source and the client list.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::*;

use super::{
    error::Result,
    types::{MediaKind, StatsReport},
};

/// Opaque identity of one transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionHandle(pub uuid::Uuid);

impl ConnectionHandle {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ConnectionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport-level connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

pub trait ConnectionRegistry: Send + Sync {
    /// Connections currently known to the transport layer.
    fn list(&self) -> Vec<ConnectionHandle>;

    /// Stable ordinal of the connection, if it is still registered.
    fn index_of(&self, handle: &ConnectionHandle) -> Option<usize>;

    fn state(&self, handle: &ConnectionHandle) -> ConnectionStatus;

    /// Called once the engine has observed the connection as closed.
    fn on_closed(&self, handle: &ConnectionHandle);
}

#[async_trait]
pub trait StatsSource: Send + Sync {
    /// Fetch the current snapshot for a connection. Only transport-level
    /// failures are reported as errors.
    async fn fetch(&self, handle: &ConnectionHandle) -> Result<StatsReport>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackReadyState {
    Live,
    Ended,
}

/// A media track bound to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub id: String,
    pub ready_state: TrackReadyState,
}

impl TrackInfo {
    pub fn live(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ready_state: TrackReadyState::Live,
        }
    }

    pub fn is_live(&self) -> bool {
        self.ready_state == TrackReadyState::Live
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackByKind {
    pub audio: Option<TrackInfo>,
    pub video: Option<TrackInfo>,
}

impl TrackByKind {
    pub fn get(&self, kind: MediaKind) -> Option<&TrackInfo> {
        match kind {
            MediaKind::Audio => self.audio.as_ref(),
            MediaKind::Video => self.video.as_ref(),
        }
    }
}

/// One logical participant ("view") as seen by the application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: String,
    pub track_by_kind: TrackByKind,
    pub is_local_client: bool,
    pub is_presentation: bool,
    pub is_audio_only_mode_enabled: bool,
}

impl ClientInfo {
    pub fn owns_track(&self, track_id: &str) -> bool {
        MediaKind::ALL
            .iter()
            .filter_map(|kind| self.track_by_kind.get(*kind))
            .any(|track| track.id == track_id)
    }
}

pub trait ClientProvider: Send + Sync {
    fn clients(&self) -> Vec<ClientInfo>;
}

impl<F> ClientProvider for F
where
    F: Fn() -> Vec<ClientInfo> + Send + Sync,
{
    fn clients(&self) -> Vec<ClientInfo> {
        self()
    }
}

#[derive(Debug)]
struct RegisteredConnection {
    handle: ConnectionHandle,
    status: ConnectionStatus,
}

/// Registry for callers that hand connections to the engine explicitly.
///
/// Ordinals are assigned in registration order and never reused.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    connections: Mutex<Vec<(usize, RegisteredConnection)>>,
    next_index: Mutex<usize>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[instrument(level = "debug", skip(self))]
    pub fn register(&self, handle: ConnectionHandle) -> usize {
        let index = {
            let Ok(mut next_index) = self.next_index.lock() else {
                error!("Connection registry index lock is poisoned");
                return 0;
            };
            let index = *next_index;
            *next_index += 1;
            index
        };

        if let Ok(mut connections) = self.connections.lock() {
            connections.push((
                index,
                RegisteredConnection {
                    handle,
                    status: ConnectionStatus::New,
                },
            ));
        }

        debug!("Connection {handle} registered with index {index}");
        index
    }

    pub fn set_state(&self, handle: &ConnectionHandle, status: ConnectionStatus) {
        if let Ok(mut connections) = self.connections.lock() {
            if let Some((_, connection)) = connections
                .iter_mut()
                .find(|(_, connection)| &connection.handle == handle)
            {
                connection.status = status;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.connections
            .lock()
            .map(|connections| connections.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ConnectionRegistry for InMemoryRegistry {
    fn list(&self) -> Vec<ConnectionHandle> {
        self.connections
            .lock()
            .map(|connections| {
                connections
                    .iter()
                    .map(|(_, connection)| connection.handle)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn index_of(&self, handle: &ConnectionHandle) -> Option<usize> {
        let connections = self.connections.lock().ok()?;
        connections
            .iter()
            .find(|(_, connection)| &connection.handle == handle)
            .map(|(index, _)| *index)
    }

    fn state(&self, handle: &ConnectionHandle) -> ConnectionStatus {
        self.connections
            .lock()
            .ok()
            .and_then(|connections| {
                connections
                    .iter()
                    .find(|(_, connection)| &connection.handle == handle)
                    .map(|(_, connection)| connection.status)
            })
            .unwrap_or(ConnectionStatus::Closed)
    }

    #[instrument(level = "debug", skip(self))]
    fn on_closed(&self, handle: &ConnectionHandle) {
        if let Ok(mut connections) = self.connections.lock() {
            connections.retain(|(_, connection)| &connection.handle != handle);
        }
        debug!("Connection {handle} removed from registry");
    }
}
