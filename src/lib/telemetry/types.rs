//! Typed view over a transport statistics snapshot.
//!
//! Each record category only carries the counters the engine reads. Cumulative
//! counters are kept as `u64` and timestamps as milliseconds, following the
//! `RTCStatsReport` dictionaries.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A statistics snapshot for one connection, keyed by statistic id.
pub type StatsReport = HashMap<String, StatRecord>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub const ALL: [MediaKind; 2] = [MediaKind::Audio, MediaKind::Video];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StatRecord {
    InboundRtp(InboundRtpStats),
    OutboundRtp(OutboundRtpStats),
    RemoteInboundRtp(RemoteInboundRtpStats),
    CandidatePair(CandidatePairStats),
    MediaSource(MediaSourceStats),
    Codec(CodecStats),
    Transport(TransportStats),
}

impl StatRecord {
    pub fn timestamp(&self) -> f64 {
        match self {
            Self::InboundRtp(stats) => stats.timestamp,
            Self::OutboundRtp(stats) => stats.timestamp,
            Self::RemoteInboundRtp(stats) => stats.timestamp,
            Self::CandidatePair(stats) => stats.timestamp,
            Self::MediaSource(stats) => stats.timestamp,
            Self::Codec(stats) => stats.timestamp,
            Self::Transport(stats) => stats.timestamp,
        }
    }

    /// Cumulative byte counters used to detect counter resets, as `(sent, received)`.
    pub fn byte_counters(&self) -> Option<(u64, u64)> {
        match self {
            Self::InboundRtp(stats) => Some((0, stats.bytes_received)),
            Self::OutboundRtp(stats) => Some((stats.bytes_sent, 0)),
            Self::CandidatePair(stats) => Some((stats.bytes_sent, stats.bytes_received)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InboundRtpStats {
    pub timestamp: f64,
    pub ssrc: u32,
    pub kind: Option<MediaKind>,
    pub track_identifier: Option<String>,
    pub mid: Option<String>,
    pub codec_id: Option<String>,
    pub remote_id: Option<String>,
    pub bytes_received: u64,
    pub header_bytes_received: u64,
    pub packets_received: u64,
    pub packets_lost: i64,
    /// Seconds, as reported by the receiver.
    pub jitter: f64,
    pub jitter_buffer_delay: f64,
    pub jitter_buffer_emitted_count: u64,
    pub frames_decoded: u64,
    pub key_frames_decoded: u64,
    pub frame_width: Option<u32>,
    pub frame_height: Option<u32>,
    pub qp_sum: u64,
    pub pli_count: u64,
    pub nack_count: u64,
    pub total_samples_received: u64,
    pub concealed_samples: u64,
    pub silent_concealed_samples: u64,
    pub inserted_samples_for_deceleration: u64,
    pub removed_samples_for_acceleration: u64,
    pub audio_level: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutboundRtpStats {
    pub timestamp: f64,
    pub ssrc: u32,
    pub kind: Option<MediaKind>,
    pub media_source_id: Option<String>,
    pub codec_id: Option<String>,
    pub remote_id: Option<String>,
    pub rid: Option<String>,
    pub bytes_sent: u64,
    pub header_bytes_sent: u64,
    pub packets_sent: u64,
    pub frames_encoded: u64,
    pub key_frames_encoded: u64,
    pub frame_width: Option<u32>,
    pub frame_height: Option<u32>,
    pub qp_sum: u64,
    pub pli_count: u64,
    pub nack_count: u64,
    pub quality_limitation_reason: Option<String>,
}

/// Receiver-side report about one of our outbound streams.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteInboundRtpStats {
    pub timestamp: f64,
    pub ssrc: u32,
    pub kind: Option<MediaKind>,
    pub local_id: Option<String>,
    pub fraction_lost: f64,
    pub round_trip_time: Option<f64>,
    pub jitter: f64,
    pub packets_lost: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CandidatePairStats {
    pub timestamp: f64,
    pub state: Option<String>,
    pub nominated: bool,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub current_round_trip_time: Option<f64>,
    pub available_outgoing_bitrate: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MediaSourceStats {
    pub timestamp: f64,
    pub kind: Option<MediaKind>,
    pub track_identifier: Option<String>,
    pub audio_level: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frames_per_second: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CodecStats {
    pub timestamp: f64,
    pub mime_type: String,
    pub clock_rate: Option<u32>,
    pub channels: Option<u32>,
    pub sdp_fmtp_line: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportStats {
    pub timestamp: f64,
    pub selected_candidate_pair_id: Option<String>,
    pub dtls_state: Option<String>,
}

/// Per-stream derived values, overwritten every tick a matching record is seen.
///
/// Rate fields are `None` until a delta could be computed against a previous
/// snapshot of the same record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SsrcMetrics {
    pub ssrc: u32,
    pub direction: Option<Direction>,
    pub kind: Option<MediaKind>,
    pub track_id: Option<String>,
    pub mid: Option<String>,
    pub rid: Option<String>,
    pub codec: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub quality_limitation_reason: Option<String>,
    pub audio_level: Option<f64>,

    pub bitrate: Option<f64>,
    pub packet_rate: Option<f64>,
    pub packet_loss: Option<f64>,
    pub fraction_lost: Option<f64>,
    pub round_trip_time: Option<f64>,
    pub jitter: Option<f64>,
    pub jitter_buffer_delay: Option<f64>,
    pub pli_rate: Option<f64>,
    pub nack_rate: Option<f64>,

    pub fps: Option<f64>,
    pub qpf: Option<f64>,
    pub keyframe_rate: Option<f64>,

    pub concealment_ratio: Option<f64>,
    pub silent_concealment_ratio: Option<f64>,
    pub acceleration_ratio: Option<f64>,
    pub deceleration_ratio: Option<f64>,

    pub updated_tick: u64,
}

impl SsrcMetrics {
    /// Drop every value that depends on a previous snapshot.
    pub fn clear_rates(&mut self) {
        self.bitrate = None;
        self.packet_rate = None;
        self.packet_loss = None;
        self.pli_rate = None;
        self.nack_rate = None;
        self.jitter_buffer_delay = None;
        self.fps = None;
        self.qpf = None;
        self.keyframe_rate = None;
        self.concealment_ratio = None;
        self.silent_concealment_ratio = None;
        self.acceleration_ratio = None;
        self.deceleration_ratio = None;
    }

    pub fn is_outbound(&self) -> bool {
        self.direction == Some(Direction::Out)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePairMetrics {
    pub id: String,
    pub state: Option<String>,
    pub bitrate_in: Option<f64>,
    pub bitrate_out: Option<f64>,
    pub round_trip_time: Option<f64>,
    pub available_outgoing_bitrate: Option<f64>,
    pub updated_tick: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackStats {
    pub ssrcs: HashMap<u32, SsrcMetrics>,
    pub last_updated_tick: u64,
}

impl TrackStats {
    /// Streams of `kind`, sorted by ssrc for a stable evaluation order.
    pub fn ssrcs_of_kind(&self, kind: MediaKind) -> Vec<&SsrcMetrics> {
        let mut ssrcs: Vec<&SsrcMetrics> = self
            .ssrcs
            .values()
            .filter(|ssrc| ssrc.kind == Some(kind))
            .collect();
        ssrcs.sort_by_key(|ssrc| ssrc.ssrc);
        ssrcs
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewStats {
    pub tracks: HashMap<String, TrackStats>,
    pub candidate_pairs: HashMap<String, CandidatePairMetrics>,
    pub last_updated_tick: u64,
}

/// Per-view statistics, keyed by client id.
pub type StatsByView = HashMap<String, ViewStats>;
