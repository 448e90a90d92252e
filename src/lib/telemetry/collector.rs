//! Polls every registered connection, keeps the previous snapshot per
//! connection and folds each snapshot into per-view statistics.

use std::{
    collections::{HashMap, HashSet},
    time::{Duration, Instant},
};

use tracing::*;

use super::{
    collaborators::{
        ClientInfo, ConnectionHandle, ConnectionRegistry, ConnectionStatus, StatsSource,
    },
    error::{Result, TelemetryError},
    extractor,
    types::{StatRecord, StatsByView, StatsReport},
};

/// Private per-connection cache, created the first time a connection is seen
/// and dropped once the registry stops listing it.
#[derive(Debug)]
pub struct ConnectionState {
    pub index: usize,
    previous: Option<StatsReport>,
    /// Last known track identifier per ssrc. Inbound records may omit the
    /// identifier once a track ends.
    ssrc_track_ids: HashMap<u32, String>,
}

impl ConnectionState {
    fn new(index: usize) -> Self {
        Self {
            index,
            previous: None,
            ssrc_track_ids: HashMap::new(),
        }
    }
}

pub struct StatsCollector {
    min_poll_spacing: Duration,
    fetch_timeout: Duration,
    default_view_id: String,
    connections: HashMap<ConnectionHandle, ConnectionState>,
    views: StatsByView,
    tick: u64,
    last_poll: Option<Instant>,
    fetch_failures: u64,
}

impl StatsCollector {
    pub fn new(
        min_poll_spacing: Duration,
        fetch_timeout: Duration,
        default_view_id: impl Into<String>,
    ) -> Self {
        Self {
            min_poll_spacing,
            fetch_timeout,
            default_view_id: default_view_id.into(),
            connections: HashMap::new(),
            views: StatsByView::new(),
            tick: 0,
            last_poll: None,
            fetch_failures: 0,
        }
    }

    pub fn views(&self) -> &StatsByView {
        &self.views
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn fetch_failures(&self) -> u64 {
        self.fetch_failures
    }

    pub fn connection(&self, handle: &ConnectionHandle) -> Option<&ConnectionState> {
        self.connections.get(handle)
    }

    /// `true` while a real poll would land closer than the minimum spacing to
    /// the previous one.
    pub fn is_throttled(&self, now: Instant) -> bool {
        self.last_poll
            .map(|last_poll| now.saturating_duration_since(last_poll) < self.min_poll_spacing)
            .unwrap_or(false)
    }

    /// Poll all connections and update the per-view statistics.
    ///
    /// Fetches are issued concurrently and all awaited before any state is
    /// touched. A fetch still pending after the fetch timeout counts as
    /// failed. A malformed snapshot fails the whole tick, leaving everything
    /// but the failure counter untouched, so the next poll retries from the
    /// same baseline.
    #[instrument(level = "debug", skip_all, fields(tick = self.tick + 1))]
    pub async fn collect(
        &mut self,
        registry: &dyn ConnectionRegistry,
        source: &dyn StatsSource,
        clients: &[ClientInfo],
        now: Instant,
    ) -> Result<()> {
        let handles = registry.list();

        let mut closed = Vec::new();
        let mut open = Vec::with_capacity(handles.len());
        for handle in handles {
            if registry.state(&handle) == ConnectionStatus::Closed {
                closed.push(handle);
            } else {
                open.push(handle);
            }
        }

        let fetch_timeout = self.fetch_timeout;
        let results = futures::future::join_all(
            open.iter()
                .map(|handle| tokio::time::timeout(fetch_timeout, source.fetch(handle))),
        )
        .await;

        let mut reports: Vec<(ConnectionHandle, Option<StatsReport>)> = Vec::new();
        for (handle, result) in open.into_iter().zip(results) {
            match result {
                Ok(Ok(report)) => reports.push((handle, Some(report))),
                Ok(Err(error)) => {
                    warn!("Failed to get stats for connection {handle}: {error}");
                    self.fetch_failures += 1;
                    reports.push((handle, None));
                }
                Err(_) => {
                    warn!(
                        "Stats for connection {handle} not ready after {fetch_timeout:?}, skipping it"
                    );
                    self.fetch_failures += 1;
                    reports.push((handle, None));
                }
            }
        }
        for handle in &closed {
            reports.push((*handle, Some(StatsReport::new())));
        }

        for (_, report) in &reports {
            if let Some(report) = report {
                validate_report(report)?;
            }
        }

        self.tick += 1;
        let tick = self.tick;

        for (handle, report) in reports {
            let index = registry
                .index_of(&handle)
                .unwrap_or_else(|| self.connections.len());
            let state = self
                .connections
                .entry(handle)
                .or_insert_with(|| ConnectionState::new(index));

            // A failed fetch contributes nothing this tick and keeps its baseline.
            let Some(report) = report else {
                continue;
            };

            process_report(
                &mut self.views,
                state,
                &report,
                clients,
                &self.default_view_id,
                tick,
            );
            state.previous = Some(report);
        }

        for handle in &closed {
            debug!("Connection {handle} closed, dropping its state");
            registry.on_closed(handle);
            self.connections.remove(handle);
        }

        let listed: HashSet<ConnectionHandle> = registry.list().into_iter().collect();
        self.connections.retain(|handle, _| listed.contains(handle));

        prune_stale(&mut self.views, tick);
        self.last_poll = Some(now);

        Ok(())
    }
}

fn validate_report(report: &StatsReport) -> Result<()> {
    for (id, record) in report {
        let timestamp = record.timestamp();
        if !timestamp.is_finite() || timestamp < 0.0 {
            return Err(TelemetryError::MalformedRecord {
                id: id.clone(),
                reason: format!("invalid timestamp {timestamp}"),
            });
        }
    }
    Ok(())
}

fn selected_candidate_pair_id(report: &StatsReport) -> Option<&str> {
    report.values().find_map(|record| match record {
        StatRecord::Transport(transport) => transport.selected_candidate_pair_id.as_deref(),
        _ => None,
    })
}

/// A previous snapshot is unusable when any byte counter went backwards or
/// the transport switched to a different candidate pair.
pub fn counters_reset(previous: &StatsReport, current: &StatsReport) -> bool {
    if let (Some(previous_pair), Some(current_pair)) = (
        selected_candidate_pair_id(previous),
        selected_candidate_pair_id(current),
    ) {
        if previous_pair != current_pair {
            return true;
        }
    }

    current.iter().any(|(id, record)| {
        let Some((sent, received)) = record.byte_counters() else {
            return false;
        };
        let Some((previous_sent, previous_received)) =
            previous.get(id).and_then(|previous| previous.byte_counters())
        else {
            return false;
        };
        sent < previous_sent || received < previous_received
    })
}

fn resolve_track_id(
    state: &mut ConnectionState,
    record: &StatRecord,
    report: &StatsReport,
) -> Option<(u32, Option<String>)> {
    let (ssrc, track_id) = match record {
        StatRecord::InboundRtp(stats) => (stats.ssrc, stats.track_identifier.clone()),
        StatRecord::OutboundRtp(stats) => {
            let track_id = match stats.media_source_id.as_deref().and_then(|id| report.get(id)) {
                Some(StatRecord::MediaSource(source)) => source.track_identifier.clone(),
                _ => None,
            };
            (stats.ssrc, track_id)
        }
        _ => return None,
    };

    match track_id {
        Some(track_id) => {
            state.ssrc_track_ids.insert(ssrc, track_id.clone());
            Some((ssrc, Some(track_id)))
        }
        None => Some((ssrc, state.ssrc_track_ids.get(&ssrc).cloned())),
    }
}

fn process_report(
    views: &mut StatsByView,
    state: &mut ConnectionState,
    report: &StatsReport,
    clients: &[ClientInfo],
    default_view_id: &str,
    tick: u64,
) {
    let previous = match state.previous.take() {
        Some(previous) if counters_reset(&previous, report) => {
            debug!(
                "Connection #{} counters reset, skipping deltas this tick",
                state.index
            );
            None
        }
        previous => previous,
    };

    let mut ids: Vec<&String> = report.keys().collect();
    ids.sort();

    let mut touched_views: Vec<String> = Vec::new();
    let mut seen_ssrcs: HashSet<u32> = HashSet::new();

    for id in ids {
        let record = &report[id];
        let Some((ssrc, track_id)) = resolve_track_id(state, record, report) else {
            continue;
        };
        seen_ssrcs.insert(ssrc);

        let view_id = track_id
            .as_deref()
            .and_then(|track_id| clients.iter().find(|client| client.owns_track(track_id)))
            .map(|client| client.id.clone())
            .unwrap_or_else(|| default_view_id.to_string());
        let track_key = track_id.unwrap_or_else(|| default_view_id.to_string());

        trace!("Record {id:?} (ssrc {ssrc}) resolved to view {view_id:?}, track {track_key:?}");

        let view = views.entry(view_id.clone()).or_default();
        view.last_updated_tick = tick;
        let track = view.tracks.entry(track_key).or_default();
        track.last_updated_tick = tick;
        let target = track.ssrcs.entry(ssrc).or_default();

        let previous_record = previous.as_ref().and_then(|previous| previous.get(id));
        let elapsed_ms = previous_record
            .map(|previous_record| record.timestamp() - previous_record.timestamp())
            .unwrap_or(0.0);

        extractor::extract_ssrc_metrics(target, record, previous_record, elapsed_ms, report);
        target.updated_tick = tick;

        if !touched_views.contains(&view_id) {
            touched_views.push(view_id);
        }
    }

    state
        .ssrc_track_ids
        .retain(|ssrc, _| seen_ssrcs.contains(ssrc));

    let selected_pair = selected_candidate_pair_id(report);
    for (id, record) in report {
        let StatRecord::CandidatePair(pair) = record else {
            continue;
        };
        let is_selected = match selected_pair {
            Some(selected_pair) => selected_pair == id,
            None => pair.nominated && pair.state.as_deref() == Some("succeeded"),
        };
        if !is_selected {
            continue;
        }

        let previous_pair = match previous.as_ref().and_then(|previous| previous.get(id)) {
            Some(StatRecord::CandidatePair(previous_pair)) => Some(previous_pair),
            _ => None,
        };
        let elapsed_ms = previous_pair
            .map(|previous_pair| pair.timestamp - previous_pair.timestamp)
            .unwrap_or(0.0);
        let pair_key = format!("{}:{id}", state.index);

        for view_id in &touched_views {
            let Some(view) = views.get_mut(view_id) else {
                continue;
            };
            let target = view.candidate_pairs.entry(pair_key.clone()).or_default();
            target.id = id.clone();
            extractor::extract_candidate_pair(target, pair, previous_pair, elapsed_ms);
            target.updated_tick = tick;
        }
    }
}

/// Remove every view, track, ssrc and candidate pair not refreshed this tick.
fn prune_stale(views: &mut StatsByView, tick: u64) {
    views.retain(|view_id, view| {
        if view.last_updated_tick != tick {
            debug!("View {view_id:?} is gone");
            return false;
        }

        view.tracks.retain(|_, track| {
            if track.last_updated_tick != tick {
                return false;
            }
            track.ssrcs.retain(|_, ssrc| ssrc.updated_tick == tick);
            true
        });
        view.candidate_pairs
            .retain(|_, pair| pair.updated_tick == tick);
        true
    });
}
