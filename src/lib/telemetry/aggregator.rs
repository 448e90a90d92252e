//! Cross-view accumulation of issues and metrics.
//!
//! Every tick follows the same order: [`Aggregator::begin_tick`] clears the
//! `cur*` window, views record into it, then [`Aggregator::finish_tick`] folds
//! the window into the `tot*` statistics.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::*;

use super::{
    collaborators::ClientInfo,
    issues::{IssueData, IssueUpdate},
    types::MediaKind,
};

/// Key shared by every view of the same category, e.g. `rem-cam-video-dry-track`.
pub fn issue_key(client: &ClientInfo, kind: MediaKind, id: &str) -> String {
    format!(
        "{}-{}-{kind}-{id}",
        if client.is_local_client { "loc" } else { "rem" },
        if client.is_presentation { "pres" } else { "cam" },
    )
}

pub fn global_key(id: &str) -> String {
    format!("global-{id}")
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedIssueData {
    pub ticks: u64,
    pub registered: u64,
    pub active: bool,
    pub periods: u64,
    pub initial: u64,
    pub current: u64,
    pub longest: u64,
    pub cur_ticks: u64,
    pub cur_registered: u64,
}

impl AggregatedIssueData {
    fn begin_tick(&mut self) {
        self.cur_ticks = 0;
        self.cur_registered = 0;
        self.active = false;
        self.current = 0;
    }

    fn record(&mut self, view: &IssueData, update: IssueUpdate) {
        self.ticks += 1;
        self.cur_ticks += 1;

        if update.registered {
            self.registered += 1;
            self.cur_registered += 1;
            self.active = true;
        }
        if update.new_period {
            self.periods += 1;
        }
        if update.initial {
            self.initial += 1;
        }

        self.current = self.current.max(view.current);
        self.longest = self.longest.max(view.longest);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedMetricData {
    pub ticks: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,

    pub cur_ticks: u64,
    pub cur_sum: f64,
    pub cur_min: f64,
    pub cur_max: f64,
    pub cur_avg: f64,

    /// Statistics over the per-tick sums.
    pub tot_ticks: u64,
    pub tot_sum: f64,
    pub tot_min: f64,
    pub tot_max: f64,
    pub tot_avg: f64,
}

impl AggregatedMetricData {
    fn begin_tick(&mut self) {
        self.cur_ticks = 0;
        self.cur_sum = 0.0;
        self.cur_min = 0.0;
        self.cur_max = 0.0;
        self.cur_avg = 0.0;
    }

    fn record(&mut self, value: f64) {
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

        self.cur_ticks += 1;
        self.cur_sum += value;
        if self.cur_ticks == 1 {
            self.cur_min = value;
            self.cur_max = value;
        } else {
            self.cur_min = self.cur_min.min(value);
            self.cur_max = self.cur_max.max(value);
        }
    }

    fn finish_tick(&mut self) {
        if self.cur_ticks == 0 {
            return;
        }

        self.cur_avg = self.cur_sum / self.cur_ticks as f64;

        self.tot_ticks += 1;
        self.tot_sum += self.cur_sum;
        if self.tot_ticks == 1 {
            self.tot_min = self.cur_sum;
            self.tot_max = self.cur_sum;
        } else {
            self.tot_min = self.tot_min.min(self.cur_sum);
            self.tot_max = self.tot_max.max(self.cur_sum);
        }
        self.tot_avg = self.tot_sum / self.tot_ticks as f64;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedData {
    pub issues: BTreeMap<String, AggregatedIssueData>,
    pub metrics: BTreeMap<String, AggregatedMetricData>,
}

#[derive(Debug, Default)]
pub struct Aggregator {
    data: AggregatedData,
    in_tick: bool,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data(&self) -> &AggregatedData {
        &self.data
    }

    /// Clear the `cur*` window of every key.
    pub fn begin_tick(&mut self) {
        if self.in_tick {
            trace!("Previous tick was not finished, restarting the window");
        }
        self.in_tick = true;

        self.data
            .issues
            .values_mut()
            .for_each(AggregatedIssueData::begin_tick);
        self.data
            .metrics
            .values_mut()
            .for_each(AggregatedMetricData::begin_tick);
    }

    pub fn record_issue(&mut self, key: &str, view: &IssueData, update: IssueUpdate) {
        self.data
            .issues
            .entry(key.to_string())
            .or_default()
            .record(view, update);
    }

    pub fn record_metric(&mut self, key: &str, value: f64) {
        self.data
            .metrics
            .entry(key.to_string())
            .or_default()
            .record(value);
    }

    pub fn finish_tick(&mut self) {
        self.in_tick = false;
        self.data
            .metrics
            .values_mut()
            .for_each(AggregatedMetricData::finish_tick);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(presentation: bool) -> ClientInfo {
        ClientInfo {
            id: "bob".into(),
            is_presentation: presentation,
            ..Default::default()
        }
    }

    #[test]
    fn keys_group_views_by_role() {
        let local = ClientInfo {
            is_local_client: true,
            ..remote(false)
        };

        assert_eq!(
            issue_key(&local, MediaKind::Video, "dry-track"),
            "loc-cam-video-dry-track"
        );
        assert_eq!(
            issue_key(&remote(true), MediaKind::Audio, "no-track"),
            "rem-pres-audio-no-track"
        );
        assert_eq!(global_key("cpu-pressure"), "global-cpu-pressure");
    }

    #[test]
    fn metric_windows_fold_into_totals() {
        let mut aggregator = Aggregator::new();

        aggregator.begin_tick();
        aggregator.record_metric("rem-cam-video-bitrate", 100.0);
        aggregator.record_metric("rem-cam-video-bitrate", 300.0);
        aggregator.finish_tick();

        let metric = &aggregator.data().metrics["rem-cam-video-bitrate"];
        assert_eq!(metric.cur_ticks, 2);
        assert_eq!(metric.cur_avg, 200.0);
        assert_eq!(metric.tot_ticks, 1);
        assert_eq!(metric.tot_sum, 400.0);

        aggregator.begin_tick();
        aggregator.record_metric("rem-cam-video-bitrate", 50.0);
        aggregator.finish_tick();

        let metric = &aggregator.data().metrics["rem-cam-video-bitrate"];
        assert_eq!(metric.ticks, 3);
        assert_eq!(metric.min, 50.0);
        assert_eq!(metric.max, 300.0);
        assert_eq!(metric.cur_ticks, 1);
        assert_eq!(metric.cur_sum, 50.0);
        assert_eq!(metric.tot_ticks, 2);
        assert_eq!(metric.tot_min, 50.0);
        assert_eq!(metric.tot_max, 400.0);
        assert_eq!(metric.tot_avg, 225.0);
    }

    #[test]
    fn untouched_metrics_keep_their_totals() {
        let mut aggregator = Aggregator::new();

        aggregator.begin_tick();
        aggregator.record_metric("global-cpu-usage", 40.0);
        aggregator.finish_tick();

        aggregator.begin_tick();
        aggregator.finish_tick();

        let metric = &aggregator.data().metrics["global-cpu-usage"];
        assert_eq!(metric.cur_ticks, 0);
        assert_eq!(metric.cur_sum, 0.0);
        assert_eq!(metric.tot_ticks, 1);
        assert_eq!(metric.tot_sum, 40.0);
    }

    #[test]
    fn issue_windows_reset_every_tick() {
        let mut aggregator = Aggregator::new();
        let mut view = IssueData::default();

        aggregator.begin_tick();
        let update = view.record(true);
        aggregator.record_issue("rem-cam-video-dry-track", &view, update);
        aggregator.finish_tick();

        let issue = &aggregator.data().issues["rem-cam-video-dry-track"];
        assert!(issue.active);
        assert_eq!((issue.cur_ticks, issue.cur_registered), (1, 1));
        assert_eq!(issue.initial, 1);

        aggregator.begin_tick();
        aggregator.finish_tick();

        let issue = &aggregator.data().issues["rem-cam-video-dry-track"];
        assert!(!issue.active);
        assert_eq!((issue.cur_ticks, issue.cur_registered), (0, 0));
        assert_eq!((issue.ticks, issue.registered), (1, 1));
        assert_eq!(issue.longest, 1);
    }
}
