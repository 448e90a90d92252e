//! In-memory collaborators and record builders, used by the demo binary and
//! by tests to drive the engine without a real transport.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tracing::*;

use crate::telemetry::{
    collaborators::{
        ClientInfo, ClientProvider, ConnectionHandle, ConnectionRegistry, InMemoryRegistry,
        StatsSource, TrackByKind, TrackInfo,
    },
    error::{Result, TelemetryError},
    types::{
        CandidatePairStats, InboundRtpStats, MediaKind, MediaSourceStats, OutboundRtpStats,
        RemoteInboundRtpStats, StatRecord, StatsReport, TransportStats,
    },
};

/// Build a snapshot from `(id, record)` pairs.
pub fn report<const N: usize>(records: [(&str, StatRecord); N]) -> StatsReport {
    records
        .into_iter()
        .map(|(id, record)| (id.to_string(), record))
        .collect()
}

pub fn inbound_rtp(
    ssrc: u32,
    kind: MediaKind,
    track_identifier: Option<&str>,
    timestamp: f64,
    bytes_received: u64,
) -> StatRecord {
    StatRecord::InboundRtp(InboundRtpStats {
        timestamp,
        ssrc,
        kind: Some(kind),
        track_identifier: track_identifier.map(str::to_string),
        bytes_received,
        ..Default::default()
    })
}

pub fn outbound_rtp(
    ssrc: u32,
    kind: MediaKind,
    media_source_id: &str,
    timestamp: f64,
    bytes_sent: u64,
) -> StatRecord {
    StatRecord::OutboundRtp(OutboundRtpStats {
        timestamp,
        ssrc,
        kind: Some(kind),
        media_source_id: Some(media_source_id.to_string()),
        bytes_sent,
        ..Default::default()
    })
}

pub fn media_source(kind: MediaKind, track_identifier: &str, timestamp: f64) -> StatRecord {
    StatRecord::MediaSource(MediaSourceStats {
        timestamp,
        kind: Some(kind),
        track_identifier: Some(track_identifier.to_string()),
        ..Default::default()
    })
}

pub fn remote_inbound(
    ssrc: u32,
    kind: MediaKind,
    timestamp: f64,
    fraction_lost: f64,
    round_trip_time: f64,
) -> StatRecord {
    StatRecord::RemoteInboundRtp(RemoteInboundRtpStats {
        timestamp,
        ssrc,
        kind: Some(kind),
        fraction_lost,
        round_trip_time: Some(round_trip_time),
        ..Default::default()
    })
}

/// Stats source answering with whatever was scripted per connection.
/// Unknown connections answer with an empty snapshot.
#[derive(Debug, Default)]
pub struct ScriptedStatsSource {
    reports: Mutex<HashMap<ConnectionHandle, std::result::Result<StatsReport, String>>>,
    delay: Mutex<Option<Duration>>,
    fetches: AtomicU64,
}

impl ScriptedStatsSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_report(&self, handle: ConnectionHandle, report: StatsReport) {
        if let Ok(mut reports) = self.reports.lock() {
            reports.insert(handle, Ok(report));
        }
    }

    pub fn fail(&self, handle: ConnectionHandle, reason: &str) {
        if let Ok(mut reports) = self.reports.lock() {
            reports.insert(handle, Err(reason.to_string()));
        }
    }

    /// Make every following fetch take `delay` before answering.
    pub fn set_delay(&self, delay: Option<Duration>) {
        if let Ok(mut current) = self.delay.lock() {
            *current = delay;
        }
    }

    /// Number of fetches served so far.
    pub fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl StatsSource for ScriptedStatsSource {
    async fn fetch(&self, handle: &ConnectionHandle) -> Result<StatsReport> {
        self.fetches.fetch_add(1, Ordering::Relaxed);

        let delay = self.delay.lock().ok().and_then(|delay| *delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self
            .reports
            .lock()
            .ok()
            .and_then(|reports| reports.get(handle).cloned());

        match scripted {
            Some(Ok(report)) => Ok(report),
            Some(Err(reason)) => Err(TelemetryError::Fetch {
                connection: *handle,
                reason,
            }),
            None => Ok(StatsReport::new()),
        }
    }
}

/// Client list that only changes when told to.
#[derive(Debug, Default)]
pub struct StaticClients {
    clients: Mutex<Vec<ClientInfo>>,
}

impl StaticClients {
    pub fn new(clients: Vec<ClientInfo>) -> Self {
        Self {
            clients: Mutex::new(clients),
        }
    }

    pub fn set(&self, clients: Vec<ClientInfo>) {
        if let Ok(mut current) = self.clients.lock() {
            *current = clients;
        }
    }
}

impl ClientProvider for StaticClients {
    fn clients(&self) -> Vec<ClientInfo> {
        self.clients
            .lock()
            .map(|clients| clients.clone())
            .unwrap_or_default()
    }
}

const AUDIO_BITRATE: f64 = 32_000.0;
const VIDEO_BITRATE: f64 = 600_000.0;
const VIDEO_FPS: f64 = 30.0;

#[derive(Debug)]
struct SimulatedPeer {
    handle: ConnectionHandle,
    client_id: String,
    /// Stops receiving video from this peer.
    dry: bool,
    sent_audio: u64,
    sent_video: u64,
    received_audio: u64,
    received_video: u64,
    frames_decoded: u64,
    samples_received: u64,
}

/// A mesh call: the local client holds one connection per remote client,
/// sending its own tracks on each and receiving the remote's tracks.
pub struct SimulatedCall {
    pub registry: Arc<InMemoryRegistry>,
    pub source: Arc<ScriptedStatsSource>,
    pub clients: Arc<StaticClients>,
    peers: Vec<SimulatedPeer>,
    now_ms: f64,
}

impl SimulatedCall {
    pub const LOCAL_ID: &'static str = "local";

    /// `remote_clients` peers are created; with `dry_last` the last one stops
    /// sending video.
    #[instrument(level = "debug")]
    pub fn new(remote_clients: usize, dry_last: bool) -> Self {
        let registry = Arc::new(InMemoryRegistry::new());
        let source = Arc::new(ScriptedStatsSource::new());

        let mut clients = vec![Self::client(Self::LOCAL_ID, true)];
        let mut peers = Vec::with_capacity(remote_clients);
        for index in 0..remote_clients {
            let client_id = format!("remote{}", index + 1);
            let handle = ConnectionHandle::new();
            registry.register(handle);
            clients.push(Self::client(&client_id, false));
            peers.push(SimulatedPeer {
                handle,
                client_id,
                dry: dry_last && index + 1 == remote_clients,
                sent_audio: 0,
                sent_video: 0,
                received_audio: 0,
                received_video: 0,
                frames_decoded: 0,
                samples_received: 0,
            });
        }

        let call = Self {
            registry,
            source,
            clients: Arc::new(StaticClients::new(clients)),
            peers,
            now_ms: 0.0,
        };
        call.publish();
        call
    }

    fn client(id: &str, is_local_client: bool) -> ClientInfo {
        ClientInfo {
            id: id.to_string(),
            track_by_kind: TrackByKind {
                audio: Some(TrackInfo::live(format!("{id}-mic"))),
                video: Some(TrackInfo::live(format!("{id}-cam"))),
            },
            is_local_client,
            ..Default::default()
        }
    }

    pub fn handles(&self) -> Vec<ConnectionHandle> {
        self.registry.list()
    }

    /// Move the simulated clock forward and publish fresh snapshots.
    pub fn advance(&mut self, step: Duration) {
        let step_ms = step.as_secs_f64() * 1000.0;
        self.now_ms += step_ms;

        let audio_bytes = (AUDIO_BITRATE * step_ms / 8000.0) as u64;
        let video_bytes = (VIDEO_BITRATE * step_ms / 8000.0) as u64;
        let frames = (VIDEO_FPS * step_ms / 1000.0) as u64;
        let samples = (48.0 * step_ms) as u64;

        for peer in &mut self.peers {
            peer.sent_audio += audio_bytes;
            peer.sent_video += video_bytes;
            peer.received_audio += audio_bytes;
            peer.samples_received += samples;
            if !peer.dry {
                peer.received_video += video_bytes;
                peer.frames_decoded += frames;
            }
        }

        self.publish();
    }

    fn publish(&self) {
        let now = self.now_ms;
        let local_audio = format!("{}-mic", Self::LOCAL_ID);
        let local_video = format!("{}-cam", Self::LOCAL_ID);

        for (index, peer) in self.peers.iter().enumerate() {
            let base = 1000 * (index as u32 + 1);
            let remote_audio = format!("{}-mic", peer.client_id);
            let remote_video = format!("{}-cam", peer.client_id);
            let total_bytes = peer.sent_audio + peer.sent_video;
            let received_bytes = peer.received_audio + peer.received_video;

            let mut inbound_audio = inbound_rtp(
                base + 1,
                MediaKind::Audio,
                Some(&remote_audio),
                now,
                peer.received_audio,
            );
            if let StatRecord::InboundRtp(stats) = &mut inbound_audio {
                stats.packets_received = peer.received_audio / 160;
                stats.total_samples_received = peer.samples_received;
            }

            let mut inbound_video = inbound_rtp(
                base + 2,
                MediaKind::Video,
                Some(&remote_video),
                now,
                peer.received_video,
            );
            if let StatRecord::InboundRtp(stats) = &mut inbound_video {
                stats.packets_received = peer.received_video / 1200;
                stats.frames_decoded = peer.frames_decoded;
                stats.qp_sum = peer.frames_decoded * 28;
                stats.frame_width = Some(640);
                stats.frame_height = Some(360);
            }

            let mut outbound_video =
                outbound_rtp(base + 4, MediaKind::Video, "SV", now, peer.sent_video);
            if let StatRecord::OutboundRtp(stats) = &mut outbound_video {
                stats.frames_encoded = (now / 1000.0 * VIDEO_FPS) as u64;
                stats.qp_sum = stats.frames_encoded * 30;
                stats.frame_width = Some(640);
                stats.frame_height = Some(360);
                stats.quality_limitation_reason = Some("none".to_string());
            }

            self.source.set_report(
                peer.handle,
                report([
                    ("IA", inbound_audio),
                    ("IV", inbound_video),
                    (
                        "OA",
                        outbound_rtp(base + 3, MediaKind::Audio, "SA", now, peer.sent_audio),
                    ),
                    ("OV", outbound_video),
                    ("SA", media_source(MediaKind::Audio, &local_audio, now)),
                    ("SV", media_source(MediaKind::Video, &local_video, now)),
                    (
                        "RA",
                        remote_inbound(base + 3, MediaKind::Audio, now, 0.0, 0.04),
                    ),
                    (
                        "RV",
                        remote_inbound(base + 4, MediaKind::Video, now, 0.0, 0.04),
                    ),
                    (
                        "CP",
                        StatRecord::CandidatePair(CandidatePairStats {
                            timestamp: now,
                            state: Some("succeeded".to_string()),
                            nominated: true,
                            bytes_sent: total_bytes,
                            bytes_received: received_bytes,
                            current_round_trip_time: Some(0.04),
                            available_outgoing_bitrate: Some(2_500_000.0),
                        }),
                    ),
                    (
                        "T",
                        StatRecord::Transport(TransportStats {
                            timestamp: now,
                            selected_candidate_pair_id: Some("CP".to_string()),
                            dtls_state: Some("connected".to_string()),
                        }),
                    ),
                ]),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_source_answers_per_connection() {
        let source = ScriptedStatsSource::new();
        let known = ConnectionHandle::new();
        let broken = ConnectionHandle::new();

        source.set_report(
            known,
            report([("IT1", inbound_rtp(1, MediaKind::Audio, None, 0.0, 0))]),
        );
        source.fail(broken, "gone");

        assert_eq!(source.fetch(&known).await.unwrap().len(), 1);
        assert!(matches!(
            source.fetch(&broken).await,
            Err(TelemetryError::Fetch { .. })
        ));
        assert!(source.fetch(&ConnectionHandle::new()).await.unwrap().is_empty());
        assert_eq!(source.fetches(), 3);
    }

    #[tokio::test]
    async fn simulated_call_publishes_one_report_per_peer() {
        let mut call = SimulatedCall::new(2, true);
        call.advance(Duration::from_millis(2000));

        assert_eq!(call.clients.clients().len(), 3);
        for handle in call.handles() {
            let report = call.source.fetch(&handle).await.unwrap();
            assert!(report.contains_key("IV"));
            assert!(report.contains_key("CP"));
        }
    }
}
