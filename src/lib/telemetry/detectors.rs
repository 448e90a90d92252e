//! The ordered catalogue of issue detectors and metric probes.
//!
//! Detectors are evaluated for every `(view, kind)` pair, or once per tick for
//! the global scope. `enabled` gates whether the tick counts at all; `check`
//! decides whether the issue holds on an enabled tick.

use std::collections::HashMap;

use enum_dispatch::enum_dispatch;
use ringbuffer::{AllocRingBuffer, RingBuffer};

use super::{
    collaborators::{ClientInfo, TrackInfo},
    system_metrics::SystemMetrics,
    types::{MediaKind, SsrcMetrics, TrackStats},
};

/// Loss ratio / fraction lost above which the network is considered bad.
pub const BAD_NETWORK_LOSS: f64 = 0.03;
/// Video bitrate (bps) below which the network is considered bad.
pub const BAD_NETWORK_MIN_VIDEO_BITRATE: f64 = 30_000.0;
/// Picture loss indications per second above which the network is considered bad.
pub const BAD_NETWORK_MAX_PLI_RATE: f64 = 2.0;
pub const LOW_FRAMERATE_FPS: f64 = 10.0;
pub const CONCEALMENT_RATIO: f64 = 0.1;
/// Minimum number of loss spikes before a pattern is called periodic.
const PERIODIC_LOSS_MIN_SPIKES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorScope {
    PerKind,
    Global,
}

/// Everything a detector may look at for one evaluation.
#[derive(Debug, Clone)]
pub struct DetectorContext<'a> {
    pub tick: u64,
    /// `None` for global-scope evaluations.
    pub client: Option<&'a ClientInfo>,
    pub clients: &'a [ClientInfo],
    pub kind: Option<MediaKind>,
    pub track: Option<&'a TrackInfo>,
    pub stats: Option<&'a TrackStats>,
    pub has_live_track: bool,
    /// Primary stream: the lowest-resolution layer for video.
    pub ssrc0: Option<&'a SsrcMetrics>,
    pub ssrcs: Vec<&'a SsrcMetrics>,
    pub system: Option<&'a SystemMetrics>,
}

impl<'a> DetectorContext<'a> {
    pub fn global(tick: u64, clients: &'a [ClientInfo], system: Option<&'a SystemMetrics>) -> Self {
        Self {
            tick,
            client: None,
            clients,
            kind: None,
            track: None,
            stats: None,
            has_live_track: false,
            ssrc0: None,
            ssrcs: Vec::new(),
            system,
        }
    }

    /// Video checks are pointless when nobody on the other end can receive or
    /// send video.
    pub fn audio_only_exempt(&self) -> bool {
        if self.kind != Some(MediaKind::Video) {
            return false;
        }
        let Some(client) = self.client else {
            return false;
        };

        if client.is_local_client {
            !self
                .clients
                .iter()
                .any(|other| !other.is_local_client && !other.is_audio_only_mode_enabled)
        } else {
            client.is_audio_only_mode_enabled
                || self
                    .clients
                    .iter()
                    .any(|other| other.is_local_client && other.is_audio_only_mode_enabled)
        }
    }

    fn is_local(&self) -> bool {
        self.client
            .map(|client| client.is_local_client)
            .unwrap_or(false)
    }
}

/// Pick the lowest-height stream; streams without a known height come last.
pub fn primary_ssrc<'a>(ssrcs: &[&'a SsrcMetrics]) -> Option<&'a SsrcMetrics> {
    ssrcs
        .iter()
        .copied()
        .min_by_key(|ssrc| ssrc.height.unwrap_or(u32::MAX))
}

#[enum_dispatch]
pub trait IssueDetector {
    fn id(&self) -> &'static str;

    fn scope(&self) -> DetectorScope {
        DetectorScope::PerKind
    }

    fn enabled(&self, ctx: &DetectorContext) -> bool;

    fn check(&mut self, ctx: &DetectorContext) -> bool;
}

#[enum_dispatch(IssueDetector)]
#[derive(Debug)]
pub enum Detector {
    NoTrack,
    NoTrackStats,
    DryTrack,
    BadNetwork,
    LowFramerate,
    Concealment,
    QualityLimitation,
    PeriodicPacketLoss,
    CpuPressure,
}

/// Streams exist for this kind but no live media track is bound to them.
#[derive(Debug, Default)]
pub struct NoTrack;

impl IssueDetector for NoTrack {
    fn id(&self) -> &'static str {
        "no-track"
    }

    fn enabled(&self, ctx: &DetectorContext) -> bool {
        !ctx.ssrcs.is_empty() && !ctx.audio_only_exempt()
    }

    fn check(&mut self, ctx: &DetectorContext) -> bool {
        !ctx.has_live_track
    }
}

/// A live track is bound but the transport reports no stream for it.
#[derive(Debug, Default)]
pub struct NoTrackStats;

impl IssueDetector for NoTrackStats {
    fn id(&self) -> &'static str {
        "no-track-stats"
    }

    fn enabled(&self, ctx: &DetectorContext) -> bool {
        ctx.has_live_track && !ctx.audio_only_exempt()
    }

    fn check(&mut self, ctx: &DetectorContext) -> bool {
        ctx.ssrcs.is_empty()
    }
}

/// Every stream of the kind carries zero bitrate.
#[derive(Debug, Default)]
pub struct DryTrack;

impl IssueDetector for DryTrack {
    fn id(&self) -> &'static str {
        "dry-track"
    }

    fn enabled(&self, ctx: &DetectorContext) -> bool {
        ctx.has_live_track
            && !ctx.audio_only_exempt()
            && !ctx.ssrcs.is_empty()
            && ctx.ssrcs.iter().all(|ssrc| ssrc.bitrate.is_some())
    }

    fn check(&mut self, ctx: &DetectorContext) -> bool {
        ctx.ssrcs.iter().all(|ssrc| ssrc.bitrate == Some(0.0))
    }
}

#[derive(Debug, Default)]
pub struct BadNetwork;

impl IssueDetector for BadNetwork {
    fn id(&self) -> &'static str {
        "bad-network"
    }

    fn enabled(&self, ctx: &DetectorContext) -> bool {
        ctx.has_live_track
            && !ctx.audio_only_exempt()
            && ctx.ssrcs.iter().any(|ssrc| ssrc.bitrate.is_some())
    }

    fn check(&mut self, ctx: &DetectorContext) -> bool {
        let is_video = ctx.kind == Some(MediaKind::Video);

        ctx.ssrcs.iter().any(|ssrc| {
            let Some(bitrate) = ssrc.bitrate else {
                return false;
            };

            bitrate == 0.0
                || ssrc.packet_loss.unwrap_or(0.0) > BAD_NETWORK_LOSS
                || ssrc.fraction_lost.unwrap_or(0.0) > BAD_NETWORK_LOSS
                || (is_video && bitrate < BAD_NETWORK_MIN_VIDEO_BITRATE)
                || ssrc.pli_rate.unwrap_or(0.0) > BAD_NETWORK_MAX_PLI_RATE
        })
    }
}

#[derive(Debug, Default)]
pub struct LowFramerate;

impl IssueDetector for LowFramerate {
    fn id(&self) -> &'static str {
        "low-framerate"
    }

    fn enabled(&self, ctx: &DetectorContext) -> bool {
        ctx.kind == Some(MediaKind::Video)
            && ctx.has_live_track
            && ctx
                .ssrc0
                .map(|ssrc| ssrc.fps.is_some() && ssrc.bitrate.unwrap_or(0.0) > 0.0)
                .unwrap_or(false)
    }

    fn check(&mut self, ctx: &DetectorContext) -> bool {
        ctx.ssrc0
            .and_then(|ssrc| ssrc.fps)
            .map(|fps| fps < LOW_FRAMERATE_FPS)
            .unwrap_or(false)
    }
}

/// Received audio is being concealed too often.
#[derive(Debug, Default)]
pub struct Concealment;

impl IssueDetector for Concealment {
    fn id(&self) -> &'static str {
        "concealment"
    }

    fn enabled(&self, ctx: &DetectorContext) -> bool {
        ctx.kind == Some(MediaKind::Audio)
            && !ctx.is_local()
            && ctx
                .ssrcs
                .iter()
                .any(|ssrc| ssrc.concealment_ratio.is_some())
    }

    fn check(&mut self, ctx: &DetectorContext) -> bool {
        ctx.ssrcs
            .iter()
            .filter_map(|ssrc| ssrc.concealment_ratio)
            .any(|ratio| ratio > CONCEALMENT_RATIO)
    }
}

/// The encoder reports it is limited by CPU or bandwidth.
#[derive(Debug, Default)]
pub struct QualityLimitation;

impl IssueDetector for QualityLimitation {
    fn id(&self) -> &'static str {
        "quality-limitation"
    }

    fn enabled(&self, ctx: &DetectorContext) -> bool {
        ctx.kind == Some(MediaKind::Video)
            && ctx
                .ssrc0
                .map(|ssrc| ssrc.is_outbound())
                .unwrap_or(false)
    }

    fn check(&mut self, ctx: &DetectorContext) -> bool {
        matches!(
            ctx.ssrc0
                .and_then(|ssrc| ssrc.quality_limitation_reason.as_deref()),
            Some("cpu") | Some("bandwidth")
        )
    }
}

struct LossHistory {
    last_tick: u64,
    samples: AllocRingBuffer<f64>,
}

/// Loss reported for an outbound stream that comes back at a fixed spacing,
/// typically caused by a competing periodic transfer on the uplink.
pub struct PeriodicPacketLoss {
    capacity: usize,
    history: HashMap<u32, LossHistory>,
}

impl std::fmt::Debug for PeriodicPacketLoss {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicPacketLoss")
            .field("capacity", &self.capacity)
            .field("tracked_ssrcs", &self.history.len())
            .finish()
    }
}

impl PeriodicPacketLoss {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(PERIODIC_LOSS_MIN_SPIKES),
            history: HashMap::new(),
        }
    }

    fn is_periodic(samples: &[f64]) -> bool {
        let spikes: Vec<usize> = samples
            .iter()
            .enumerate()
            .filter(|(_, loss)| **loss > 0.0)
            .map(|(index, _)| index)
            .collect();
        if spikes.len() < PERIODIC_LOSS_MIN_SPIKES {
            return false;
        }

        let spacing = spikes[1] - spikes[0];
        spacing >= 2 && spikes.windows(2).all(|pair| pair[1] - pair[0] == spacing)
    }
}

impl Default for PeriodicPacketLoss {
    fn default() -> Self {
        Self::new(10)
    }
}

impl IssueDetector for PeriodicPacketLoss {
    fn id(&self) -> &'static str {
        "periodic-packet-loss"
    }

    fn enabled(&self, ctx: &DetectorContext) -> bool {
        ctx.ssrcs
            .iter()
            .any(|ssrc| ssrc.is_outbound() && ssrc.fraction_lost.is_some())
    }

    fn check(&mut self, ctx: &DetectorContext) -> bool {
        let stale_after = self.capacity as u64;
        self.history
            .retain(|_, history| history.last_tick + stale_after >= ctx.tick);

        let mut periodic = false;
        for ssrc in &ctx.ssrcs {
            let (true, Some(fraction_lost)) = (ssrc.is_outbound(), ssrc.fraction_lost) else {
                continue;
            };

            let capacity = self.capacity;
            let history = self.history.entry(ssrc.ssrc).or_insert_with(|| LossHistory {
                last_tick: 0,
                samples: AllocRingBuffer::new(capacity),
            });
            if history.last_tick != ctx.tick {
                history.samples.push(fraction_lost);
                history.last_tick = ctx.tick;
            }

            periodic |= Self::is_periodic(&history.samples.to_vec());
        }
        periodic
    }
}

#[derive(Debug)]
pub struct CpuPressure {
    threshold_pct: f64,
}

impl CpuPressure {
    pub fn new(threshold_pct: f64) -> Self {
        Self { threshold_pct }
    }
}

impl IssueDetector for CpuPressure {
    fn id(&self) -> &'static str {
        "cpu-pressure"
    }

    fn scope(&self) -> DetectorScope {
        DetectorScope::Global
    }

    fn enabled(&self, ctx: &DetectorContext) -> bool {
        ctx.system.is_some()
    }

    fn check(&mut self, ctx: &DetectorContext) -> bool {
        ctx.system
            .map(|system| system.cpu_pct >= self.threshold_pct)
            .unwrap_or(false)
    }
}

/// Build the detector list in evaluation order.
pub fn catalogue(packet_loss_history: usize, cpu_pressure_threshold_pct: f64) -> Vec<Detector> {
    vec![
        NoTrack.into(),
        NoTrackStats.into(),
        DryTrack.into(),
        BadNetwork.into(),
        LowFramerate.into(),
        Concealment.into(),
        QualityLimitation.into(),
        PeriodicPacketLoss::new(packet_loss_history).into(),
        CpuPressure::new(cpu_pressure_threshold_pct).into(),
    ]
}

/// A metric is sampled for a view on every tick its value is available.
#[derive(Clone, Copy)]
pub struct MetricProbe {
    pub id: &'static str,
    pub scope: DetectorScope,
    pub value: fn(&DetectorContext) -> Option<f64>,
}

impl std::fmt::Debug for MetricProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricProbe")
            .field("id", &self.id)
            .field("scope", &self.scope)
            .finish()
    }
}

fn max_of(ctx: &DetectorContext, field: impl Fn(&SsrcMetrics) -> Option<f64>) -> Option<f64> {
    ctx.ssrcs
        .iter()
        .filter_map(|ssrc| field(*ssrc))
        .fold(None, |max, value| Some(max.map_or(value, |max: f64| max.max(value))))
}

fn video_only(ctx: &DetectorContext) -> Option<()> {
    (ctx.kind == Some(MediaKind::Video)).then_some(())
}

pub fn metric_catalogue() -> Vec<MetricProbe> {
    vec![
        MetricProbe {
            id: "bitrate",
            scope: DetectorScope::PerKind,
            value: |ctx| {
                ctx.ssrcs
                    .iter()
                    .filter_map(|ssrc| ssrc.bitrate)
                    .fold(None, |sum, bitrate| Some(sum.unwrap_or(0.0) + bitrate))
            },
        },
        MetricProbe {
            id: "packetloss",
            scope: DetectorScope::PerKind,
            value: |ctx| max_of(ctx, |ssrc| ssrc.packet_loss.or(ssrc.fraction_lost)),
        },
        MetricProbe {
            id: "jitter",
            scope: DetectorScope::PerKind,
            value: |ctx| max_of(ctx, |ssrc| ssrc.jitter),
        },
        MetricProbe {
            id: "roundtrip",
            scope: DetectorScope::PerKind,
            value: |ctx| max_of(ctx, |ssrc| ssrc.round_trip_time),
        },
        MetricProbe {
            id: "fps",
            scope: DetectorScope::PerKind,
            value: |ctx| video_only(ctx).and(ctx.ssrc0?.fps),
        },
        MetricProbe {
            id: "qpf",
            scope: DetectorScope::PerKind,
            value: |ctx| video_only(ctx).and(ctx.ssrc0?.qpf),
        },
        MetricProbe {
            id: "concealment",
            scope: DetectorScope::PerKind,
            value: |ctx| max_of(ctx, |ssrc| ssrc.concealment_ratio),
        },
        MetricProbe {
            id: "cpu-usage",
            scope: DetectorScope::Global,
            value: |ctx| ctx.system.map(|system| system.cpu_pct),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{
        collaborators::TrackByKind,
        types::Direction,
    };

    fn client(id: &str, local: bool, audio_only: bool) -> ClientInfo {
        ClientInfo {
            id: id.into(),
            track_by_kind: TrackByKind {
                audio: None,
                video: Some(TrackInfo::live(format!("{id}-cam"))),
            },
            is_local_client: local,
            is_audio_only_mode_enabled: audio_only,
            ..Default::default()
        }
    }

    fn video_ssrc(bitrate: Option<f64>) -> SsrcMetrics {
        SsrcMetrics {
            ssrc: 1,
            kind: Some(MediaKind::Video),
            bitrate,
            ..Default::default()
        }
    }

    fn context<'a>(
        client: &'a ClientInfo,
        clients: &'a [ClientInfo],
        ssrcs: Vec<&'a SsrcMetrics>,
    ) -> DetectorContext<'a> {
        DetectorContext {
            tick: 1,
            client: Some(client),
            clients,
            kind: Some(MediaKind::Video),
            track: client.track_by_kind.video.as_ref(),
            stats: None,
            has_live_track: true,
            ssrc0: primary_ssrc(&ssrcs),
            ssrcs,
            system: None,
        }
    }

    #[test]
    fn dry_track_needs_a_receiving_remote_for_local_video() {
        let clients = vec![client("me", true, false), client("bob", false, true)];
        let ssrc = video_ssrc(Some(0.0));
        let ctx = context(&clients[0], &clients, vec![&ssrc]);

        assert!(!DryTrack.enabled(&ctx));

        let clients = vec![client("me", true, false), client("bob", false, false)];
        let ctx = context(&clients[0], &clients, vec![&ssrc]);
        let mut detector = DryTrack;

        assert!(detector.enabled(&ctx));
        assert!(detector.check(&ctx));
    }

    #[test]
    fn dry_track_is_disabled_until_a_bitrate_is_known() {
        let clients = vec![client("me", true, false), client("bob", false, false)];
        let ssrc = video_ssrc(None);
        let ctx = context(&clients[1], &clients, vec![&ssrc]);

        assert!(!DryTrack.enabled(&ctx));
    }

    #[test]
    fn no_track_holds_when_streams_exist_without_a_live_track() {
        let clients = vec![client("me", true, false), client("bob", false, false)];
        let ssrc = video_ssrc(Some(100_000.0));
        let mut ctx = context(&clients[1], &clients, vec![&ssrc]);
        ctx.has_live_track = false;
        ctx.track = None;

        assert!(NoTrack.enabled(&ctx));
        assert!(NoTrack.check(&ctx));
        assert!(!NoTrackStats.enabled(&ctx));
    }

    /// Enabled state of dry-track, no-track and no-track-stats for bob's
    /// video view.
    fn remote_video_detectors(me_audio_only: bool, bob_audio_only: bool) -> [bool; 3] {
        let clients = vec![
            client("me", true, me_audio_only),
            client("bob", false, bob_audio_only),
        ];
        let dry = video_ssrc(Some(0.0));

        let streaming = context(&clients[1], &clients, vec![&dry]);
        let mut unbound = context(&clients[1], &clients, vec![&dry]);
        unbound.has_live_track = false;
        unbound.track = None;
        let silent = context(&clients[1], &clients, vec![]);

        [
            DryTrack.enabled(&streaming),
            NoTrack.enabled(&unbound),
            NoTrackStats.enabled(&silent),
        ]
    }

    #[test]
    fn remote_video_issues_apply_when_nobody_is_audio_only() {
        assert_eq!(remote_video_detectors(false, false), [true; 3]);
    }

    #[test]
    fn audio_only_remote_is_exempt_from_video_issues() {
        assert_eq!(remote_video_detectors(false, true), [false; 3]);
    }

    #[test]
    fn remote_video_is_exempt_while_the_local_client_is_audio_only() {
        assert_eq!(remote_video_detectors(true, false), [false; 3]);
    }

    #[test]
    fn bad_network_thresholds() {
        let clients = vec![client("me", true, false), client("bob", false, false)];
        let mut detector = BadNetwork;

        let healthy = SsrcMetrics {
            packet_loss: Some(0.01),
            pli_rate: Some(0.5),
            ..video_ssrc(Some(500_000.0))
        };
        assert!(!detector.check(&context(&clients[1], &clients, vec![&healthy])));

        let lossy = SsrcMetrics {
            packet_loss: Some(0.04),
            ..healthy.clone()
        };
        assert!(detector.check(&context(&clients[1], &clients, vec![&lossy])));

        let starved = video_ssrc(Some(20_000.0));
        assert!(detector.check(&context(&clients[1], &clients, vec![&starved])));

        let pli_storm = SsrcMetrics {
            pli_rate: Some(2.5),
            ..healthy.clone()
        };
        assert!(detector.check(&context(&clients[1], &clients, vec![&pli_storm])));
    }

    #[test]
    fn primary_ssrc_is_the_lowest_layer() {
        let high = SsrcMetrics {
            ssrc: 1,
            height: Some(720),
            ..Default::default()
        };
        let low = SsrcMetrics {
            ssrc: 2,
            height: Some(180),
            ..Default::default()
        };
        let unknown = SsrcMetrics {
            ssrc: 3,
            ..Default::default()
        };

        assert_eq!(primary_ssrc(&[&high, &unknown, &low]).map(|s| s.ssrc), Some(2));
    }

    #[test]
    fn periodic_packet_loss_needs_a_regular_pattern() {
        assert!(PeriodicPacketLoss::is_periodic(&[
            0.1, 0.0, 0.0, 0.1, 0.0, 0.0, 0.1, 0.0
        ]));
        assert!(!PeriodicPacketLoss::is_periodic(&[0.1, 0.1, 0.1, 0.1]));
        assert!(!PeriodicPacketLoss::is_periodic(&[0.1, 0.0, 0.1, 0.0, 0.0, 0.1]));
        assert!(!PeriodicPacketLoss::is_periodic(&[0.0, 0.1, 0.0, 0.1]));
    }

    #[test]
    fn periodic_packet_loss_keeps_history_per_outbound_ssrc() {
        let clients = vec![client("me", true, false), client("bob", false, false)];
        let mut detector = PeriodicPacketLoss::new(10);

        let losses = [0.05, 0.0, 0.0, 0.05, 0.0, 0.0, 0.05];
        let mut last = false;
        for (tick, loss) in losses.iter().enumerate() {
            let ssrc = SsrcMetrics {
                direction: Some(Direction::Out),
                fraction_lost: Some(*loss),
                ..video_ssrc(Some(300_000.0))
            };
            let mut ctx = context(&clients[0], &clients, vec![&ssrc]);
            ctx.tick = tick as u64 + 1;

            assert!(detector.enabled(&ctx));
            last = detector.check(&ctx);
            // Evaluating twice in the same tick must not append a sample.
            assert_eq!(detector.check(&ctx), last);
        }

        assert!(last);
    }

    #[test]
    fn cpu_pressure_is_global() {
        let metrics = SystemMetrics {
            cpu_pct: 91.0,
            ..Default::default()
        };
        let mut detector = CpuPressure::new(80.0);
        let ctx = DetectorContext::global(1, &[], Some(&metrics));

        assert_eq!(detector.scope(), DetectorScope::Global);
        assert!(detector.enabled(&ctx));
        assert!(detector.check(&ctx));
        assert!(!detector.enabled(&DetectorContext::global(1, &[], None)));
    }

    #[test]
    fn catalogue_order_is_stable() {
        let ids: Vec<&str> = catalogue(10, 80.0).iter().map(|d| d.id()).collect();
        assert_eq!(
            ids,
            [
                "no-track",
                "no-track-stats",
                "dry-track",
                "bad-network",
                "low-framerate",
                "concealment",
                "quality-limitation",
                "periodic-packet-loss",
                "cpu-pressure",
            ]
        );
    }
}
