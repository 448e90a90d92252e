//! Per-view issue state machines and metric accumulators.
//!
//! Each `(view, kind, detector)` key starts absent and is created the first
//! tick its detector is enabled. Keys only disappear together with the view.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use tracing::*;

use super::{
    aggregator::{global_key, issue_key, Aggregator},
    collaborators::ClientInfo,
    detectors::{
        self, primary_ssrc, Detector, DetectorContext, DetectorScope, IssueDetector, MetricProbe,
    },
    settings::EngineSettings,
    system_metrics::SystemMetrics,
    types::{MediaKind, StatsByView, TrackStats, ViewStats},
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueData {
    pub active: bool,
    /// Ticks on which the detector was enabled.
    pub ticks: u64,
    /// Ticks on which the condition held.
    pub registered: u64,
    pub initial: u64,
    pub periods: u64,
    pub current: u64,
    pub longest: u64,
}

/// What changed in an [`IssueData`] during one enabled tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IssueUpdate {
    pub registered: bool,
    pub new_period: bool,
    pub initial: bool,
}

impl IssueData {
    /// Account one enabled tick.
    pub fn record(&mut self, holds: bool) -> IssueUpdate {
        let first_tick = self.ticks == 0;
        self.ticks += 1;

        if !holds {
            self.active = false;
            self.current = 0;
            return IssueUpdate::default();
        }

        let initial = first_tick && self.registered == 0;
        let new_period = !self.active;

        self.registered += 1;
        self.current += 1;
        self.active = true;
        if new_period {
            self.periods += 1;
        }
        if initial {
            self.initial += 1;
        }
        self.longest = self.longest.max(self.current);

        IssueUpdate {
            registered: true,
            new_period,
            initial,
        }
    }

    /// A disabled tick breaks the streak without counting.
    pub fn interrupt(&mut self) {
        self.active = false;
        self.current = 0;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricData {
    pub ticks: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

impl MetricData {
    pub fn record(&mut self, value: f64) {
        self.ticks += 1;
        self.sum += value;
        if self.ticks == 1 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.avg = self.sum / self.ticks as f64;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ViewIssues {
    pub issues: BTreeMap<String, IssueData>,
    pub metrics: BTreeMap<String, MetricData>,
}

impl ViewIssues {
    fn evaluate_issue(
        &mut self,
        key: String,
        detector: &mut Detector,
        ctx: &DetectorContext,
        aggregator: &mut Aggregator,
    ) {
        if !detector.enabled(ctx) {
            if let Some(issue) = self.issues.get_mut(&key) {
                issue.interrupt();
            }
            return;
        }

        let holds = detector.check(ctx);
        let issue = self.issues.entry(key.clone()).or_default();
        let update = issue.record(holds);
        if update.new_period {
            debug!("Issue {key:?} became active");
        }

        aggregator.record_issue(&key, issue, update);
    }

    fn evaluate_metric(
        &mut self,
        key: String,
        probe: &MetricProbe,
        ctx: &DetectorContext,
        aggregator: &mut Aggregator,
    ) {
        let Some(value) = (probe.value)(ctx) else {
            return;
        };
        if !value.is_finite() {
            trace!("Metric {key:?} produced {value}, skipping");
            return;
        }

        aggregator.record_metric(&key, value);
        self.metrics.entry(key).or_default().record(value);
    }
}

/// Per-view and global issue state for every client.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IssuesByView {
    pub views: BTreeMap<String, ViewIssues>,
    pub global: ViewIssues,
}

pub struct IssueDetectorEngine {
    detectors: Vec<Detector>,
    metrics: Vec<MetricProbe>,
    state: IssuesByView,
}

impl IssueDetectorEngine {
    pub fn new(detectors: Vec<Detector>, metrics: Vec<MetricProbe>) -> Self {
        Self {
            detectors,
            metrics,
            state: IssuesByView::default(),
        }
    }

    pub fn with_settings(settings: &EngineSettings) -> Self {
        Self::new(
            detectors::catalogue(
                settings.packet_loss_history,
                settings.cpu_pressure_threshold_pct,
            ),
            detectors::metric_catalogue(),
        )
    }

    pub fn state(&self) -> &IssuesByView {
        &self.state
    }

    /// Run every detector and metric for every client and kind, then the
    /// global ones once. Views whose client left the list are dropped.
    #[instrument(level = "debug", skip_all, fields(tick = tick))]
    pub fn evaluate(
        &mut self,
        tick: u64,
        clients: &[ClientInfo],
        stats: &StatsByView,
        system: Option<&SystemMetrics>,
        aggregator: &mut Aggregator,
    ) {
        let Self {
            detectors,
            metrics,
            state,
        } = self;

        for client in clients {
            let view_stats = stats.get(&client.id);
            let view = state.views.entry(client.id.clone()).or_default();

            for kind in MediaKind::ALL {
                let ctx = view_context(tick, client, clients, kind, view_stats, system);

                for detector in detectors.iter_mut() {
                    if detector.scope() != DetectorScope::PerKind {
                        continue;
                    }
                    let key = issue_key(client, kind, detector.id());
                    view.evaluate_issue(key, detector, &ctx, aggregator);
                }

                for probe in metrics.iter() {
                    if probe.scope != DetectorScope::PerKind {
                        continue;
                    }
                    let key = issue_key(client, kind, probe.id);
                    view.evaluate_metric(key, probe, &ctx, aggregator);
                }
            }
        }

        let ctx = DetectorContext::global(tick, clients, system);
        for detector in detectors.iter_mut() {
            if detector.scope() == DetectorScope::Global {
                let key = global_key(detector.id());
                state.global.evaluate_issue(key, detector, &ctx, aggregator);
            }
        }
        for probe in metrics.iter() {
            if probe.scope == DetectorScope::Global {
                let key = global_key(probe.id);
                state.global.evaluate_metric(key, probe, &ctx, aggregator);
            }
        }

        let present: HashSet<&str> = clients.iter().map(|client| client.id.as_str()).collect();
        state.views.retain(|view_id, _| {
            let keep = present.contains(view_id.as_str());
            if !keep {
                debug!("Dropping issues of departed view {view_id:?}");
            }
            keep
        });
    }
}

/// The track stats of `kind` for a view: the client's own track when the
/// collector attributed one, otherwise the first track carrying that kind.
fn track_stats_for<'a>(
    view_stats: Option<&'a ViewStats>,
    client: &ClientInfo,
    kind: MediaKind,
) -> Option<&'a TrackStats> {
    let view_stats = view_stats?;

    if let Some(track) = client
        .track_by_kind
        .get(kind)
        .and_then(|track| view_stats.tracks.get(&track.id))
    {
        return Some(track);
    }

    let mut track_ids: Vec<&String> = view_stats.tracks.keys().collect();
    track_ids.sort();
    track_ids
        .into_iter()
        .filter_map(|track_id| view_stats.tracks.get(track_id))
        .find(|track| track.ssrcs.values().any(|ssrc| ssrc.kind == Some(kind)))
}

fn view_context<'a>(
    tick: u64,
    client: &'a ClientInfo,
    clients: &'a [ClientInfo],
    kind: MediaKind,
    view_stats: Option<&'a ViewStats>,
    system: Option<&'a SystemMetrics>,
) -> DetectorContext<'a> {
    let track = client.track_by_kind.get(kind);
    let stats = track_stats_for(view_stats, client, kind);
    let ssrcs = stats
        .map(|stats| stats.ssrcs_of_kind(kind))
        .unwrap_or_default();

    DetectorContext {
        tick,
        client: Some(client),
        clients,
        kind: Some(kind),
        track,
        stats,
        has_live_track: track.map(|track| track.is_live()).unwrap_or(false),
        ssrc0: primary_ssrc(&ssrcs),
        ssrcs,
        system,
    }
}
