//! Subscription bus: the public entry point of the engine.
//!
//! The first subscriber lazily starts the polling task (and the CPU sampler),
//! later subscribers share it. Stopping the last subscription tears everything
//! down, so the next subscriber starts from clean state.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, Weak},
    time::Instant,
};

use serde::Serialize;
use tokio::{
    sync::{watch, Notify},
    time::MissedTickBehavior,
};
use tracing::*;

use super::{
    aggregator::{AggregatedData, Aggregator},
    collaborators::{ClientInfo, ClientProvider, ConnectionRegistry, StatsSource},
    collector::StatsCollector,
    error::{Result, TelemetryError},
    issues::{IssueDetectorEngine, IssuesByView},
    settings::EngineSettings,
    system_metrics::{CpuSampler, SystemMetrics, SystemMetricsReader},
    types::StatsByView,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IssuesReport {
    pub aggregated: AggregatedData,
    pub views: IssuesByView,
}

/// Everything observers receive for one tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    pub tick: u64,
    pub issues: IssuesReport,
    pub stats: StatsByView,
    pub clients: Vec<ClientInfo>,
    pub fetch_failures: u64,
    pub system: Option<SystemMetrics>,
}

pub trait IssueObserver: Send + Sync {
    /// Called from the polling task at the end of every tick. Must not block.
    fn on_updated_issues(&self, report: &Arc<TickReport>);
}

impl<F> IssueObserver for F
where
    F: Fn(&Arc<TickReport>) + Send + Sync,
{
    fn on_updated_issues(&self, report: &Arc<TickReport>) {
        self(report)
    }
}

/// Collector, detectors and aggregates of one engine run.
pub struct TelemetryPipeline {
    registry: Arc<dyn ConnectionRegistry>,
    source: Arc<dyn StatsSource>,
    clients: Arc<dyn ClientProvider>,
    collector: StatsCollector,
    engine: IssueDetectorEngine,
    aggregator: Aggregator,
    last_report: Option<Arc<TickReport>>,
}

impl TelemetryPipeline {
    pub fn new(
        settings: &EngineSettings,
        registry: Arc<dyn ConnectionRegistry>,
        source: Arc<dyn StatsSource>,
        clients: Arc<dyn ClientProvider>,
    ) -> Self {
        Self {
            registry,
            source,
            clients,
            collector: StatsCollector::new(
                settings.min_poll_spacing(),
                settings.fetch_timeout(),
                settings.default_view_id.clone(),
            ),
            engine: IssueDetectorEngine::with_settings(settings),
            aggregator: Aggregator::new(),
            last_report: None,
        }
    }

    pub fn last_report(&self) -> Option<&Arc<TickReport>> {
        self.last_report.as_ref()
    }

    /// Run one tick. Within the minimum poll spacing the previous report is
    /// returned untouched and no collaborator is called.
    #[instrument(level = "debug", skip_all)]
    pub async fn tick(
        &mut self,
        now: Instant,
        system: Option<SystemMetrics>,
    ) -> Result<Arc<TickReport>> {
        if self.collector.is_throttled(now) {
            if let Some(last_report) = &self.last_report {
                trace!("Tick throttled, re-delivering tick {}", last_report.tick);
                return Ok(last_report.clone());
            }
        }

        let clients = self.clients.clients();

        self.aggregator.begin_tick();
        self.collector
            .collect(&*self.registry, &*self.source, &clients, now)
            .await?;

        let tick = self.collector.tick();
        self.engine.evaluate(
            tick,
            &clients,
            self.collector.views(),
            system.as_ref(),
            &mut self.aggregator,
        );
        self.aggregator.finish_tick();

        let report = Arc::new(TickReport {
            tick,
            issues: IssuesReport {
                aggregated: self.aggregator.data().clone(),
                views: self.engine.state().clone(),
            },
            stats: self.collector.views().clone(),
            clients,
            fetch_failures: self.collector.fetch_failures(),
            system,
        });
        self.last_report = Some(report.clone());

        Ok(report)
    }
}

struct Runner {
    generation: u64,
    poke: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    _sampler: Option<CpuSampler>,
}

#[derive(Default)]
struct BusState {
    next_id: u64,
    generation: u64,
    observers: BTreeMap<u64, Arc<dyn IssueObserver>>,
    runner: Option<Runner>,
}

impl BusState {
    /// Observers to notify, if `generation` is still the running one.
    fn observers_for(&self, generation: u64) -> Option<Vec<Arc<dyn IssueObserver>>> {
        let runner = self.runner.as_ref()?;
        if runner.generation != generation {
            return None;
        }
        Some(self.observers.values().cloned().collect())
    }

    fn remove(&mut self, id: u64) {
        if self.observers.remove(&id).is_none() {
            return;
        }
        debug!("Subscription {id} stopped, {} left", self.observers.len());

        if !self.observers.is_empty() {
            return;
        }

        if let Some(runner) = self.runner.take() {
            debug!("Last subscription gone, stopping engine run {}", runner.generation);
            let _ = runner.shutdown.send(true);
        }
    }
}

/// Handle returned by [`Engine::subscribe`]. Dropping it stops it.
pub struct Subscription {
    id: u64,
    state: Weak<Mutex<BusState>>,
    stopped: bool,
}

impl Subscription {
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        let Some(state) = self.state.upgrade() else {
            return;
        };
        match state.lock() {
            Ok(mut state) => state.remove(self.id),
            Err(error) => error!("Engine state lock is poisoned: {error:?}"),
        };
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop();
    }
}

pub struct Engine {
    settings: EngineSettings,
    registry: Arc<dyn ConnectionRegistry>,
    source: Arc<dyn StatsSource>,
    clients: Arc<dyn ClientProvider>,
    state: Arc<Mutex<BusState>>,
}

impl Engine {
    pub fn new(
        settings: EngineSettings,
        registry: Arc<dyn ConnectionRegistry>,
        source: Arc<dyn StatsSource>,
        clients: Arc<dyn ClientProvider>,
    ) -> Self {
        Self {
            settings,
            registry,
            source,
            clients,
            state: Default::default(),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.state
            .lock()
            .map(|state| state.runner.is_some())
            .unwrap_or(false)
    }

    pub fn subscribers(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.observers.len())
            .unwrap_or(0)
    }

    /// Register `observer`. Never fails: without a tokio runtime the
    /// subscription is kept but nothing is polled until a later subscriber
    /// starts the engine from within a runtime.
    #[instrument(level = "debug", skip_all)]
    pub fn subscribe(&self, observer: impl IssueObserver + 'static) -> Subscription {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(error) => {
                error!("Engine state lock is poisoned: {error:?}");
                return Subscription {
                    id: u64::MAX,
                    state: Weak::new(),
                    stopped: true,
                };
            }
        };

        let id = state.next_id;
        state.next_id += 1;
        state.observers.insert(id, Arc::new(observer));
        debug!("Subscription {id} added, {} total", state.observers.len());

        let poke = state.runner.as_ref().map(|runner| runner.poke.clone());
        match poke {
            // Hits the throttle and re-delivers the last tick, unless the
            // previous poll is old enough for a real one.
            Some(poke) => poke.notify_one(),
            None => match self.start_runner(&mut state) {
                Ok(runner) => state.runner = Some(runner),
                Err(error) => error!("Failed to start engine: {error}"),
            },
        }

        Subscription {
            id,
            state: Arc::downgrade(&self.state),
            stopped: false,
        }
    }

    fn start_runner(&self, state: &mut BusState) -> Result<Runner> {
        let handle =
            tokio::runtime::Handle::try_current().map_err(|_| TelemetryError::NoRuntime)?;

        state.generation += 1;
        let generation = state.generation;

        let sampler = self
            .settings
            .cpu_sampler
            .then(|| CpuSampler::start(self.settings.cpu_sample_interval()));
        let reader = sampler.as_ref().map(CpuSampler::reader);

        let pipeline = TelemetryPipeline::new(
            &self.settings,
            self.registry.clone(),
            self.source.clone(),
            self.clients.clone(),
        );
        let poke = Arc::new(Notify::new());
        let (shutdown, shutdown_rx) = watch::channel(false);

        debug!("Starting engine run {generation}...");

        let span = span!(Level::DEBUG, "Engine task", generation);
        handle.spawn(
            Self::runner(
                pipeline,
                self.settings.poll_interval(),
                reader,
                poke.clone(),
                shutdown_rx,
                Arc::downgrade(&self.state),
                generation,
            )
            .instrument(span),
        );

        Ok(Runner {
            generation,
            poke,
            shutdown,
            _sampler: sampler,
        })
    }

    async fn runner(
        mut pipeline: TelemetryPipeline,
        poll_interval: std::time::Duration,
        system: Option<SystemMetricsReader>,
        poke: Arc<Notify>,
        mut shutdown: watch::Receiver<bool>,
        state: Weak<Mutex<BusState>>,
        generation: u64,
    ) {
        debug!("task started!");

        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = poke.notified() => {}
                _ = shutdown.changed() => break,
            }

            let system = system.as_ref().and_then(SystemMetricsReader::latest);
            let now = tokio::time::Instant::now().into_std();
            let result = tokio::select! {
                result = pipeline.tick(now, system) => result,
                _ = shutdown.changed() => {
                    debug!("Engine stopped while a tick was in flight, discarding it");
                    break;
                }
            };

            if *shutdown.borrow() {
                debug!("Engine stopped while a tick was in flight, discarding it");
                break;
            }

            let report = match result {
                Ok(report) => report,
                Err(error) => {
                    error!("Tick failed, retrying on the next timer fire: {error}");
                    continue;
                }
            };

            let Some(shared) = state.upgrade() else {
                break;
            };
            let observers = match shared.lock() {
                Ok(state) => state.observers_for(generation),
                Err(error) => {
                    error!("Engine state lock is poisoned: {error:?}");
                    None
                }
            };
            let Some(observers) = observers else {
                break;
            };

            for observer in observers {
                observer.on_updated_issues(&report);
            }
        }

        debug!("task ended");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        debug!("Dropping Engine...");

        if let Ok(mut state) = self.state.lock() {
            state.observers.clear();
            if let Some(runner) = state.runner.take() {
                let _ = runner.shutdown.send(true);
            }
        }
    }
}
