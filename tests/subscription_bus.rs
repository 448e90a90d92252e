use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use media_quality_telemetry::{
    simulation::{ScriptedStatsSource, StaticClients},
    telemetry::{
        collaborators::{ClientInfo, ConnectionHandle, InMemoryRegistry, TrackByKind, TrackInfo},
        Engine, EngineSettings, TickReport,
    },
};

const NO_TRACK_STATS: &str = "rem-cam-video-no-track-stats";

type Received = Arc<Mutex<Vec<Arc<TickReport>>>>;

fn video_client(id: &str, is_local_client: bool) -> ClientInfo {
    ClientInfo {
        id: id.to_string(),
        track_by_kind: TrackByKind {
            audio: None,
            video: Some(TrackInfo::live(format!("{id}-cam"))),
        },
        is_local_client,
        ..Default::default()
    }
}

/// An engine whose remote client has a live camera but its connection never
/// reports a stream for it.
fn silent_call() -> (Engine, Arc<ScriptedStatsSource>) {
    silent_call_with(EngineSettings {
        cpu_sampler: false,
        ..Default::default()
    })
}

fn silent_call_with(settings: EngineSettings) -> (Engine, Arc<ScriptedStatsSource>) {
    let registry = Arc::new(InMemoryRegistry::new());
    registry.register(ConnectionHandle::new());
    let source = Arc::new(ScriptedStatsSource::new());
    let clients = Arc::new(StaticClients::new(vec![
        video_client("local", true),
        video_client("remote1", false),
    ]));

    let engine = Engine::new(
        settings,
        registry,
        source.clone(),
        clients,
    );
    (engine, source)
}

fn recorder() -> (Received, impl Fn(&Arc<TickReport>) + Send + Sync + 'static) {
    let received: Received = Default::default();
    let sink = received.clone();
    (received, move |report: &Arc<TickReport>| {
        sink.lock().unwrap().push(report.clone())
    })
}

#[tokio::test(start_paused = true)]
async fn unsubscribing_the_last_observer_resets_state() {
    let (engine, _source) = silent_call();

    let (received, observer) = recorder();
    let mut subscription = engine.subscribe(observer);
    tokio::time::sleep(Duration::from_millis(4100)).await;

    {
        let received = received.lock().unwrap();
        let last = received.last().expect("no tick delivered");
        assert_eq!(last.tick, 3);
        assert_eq!(last.issues.aggregated.issues[NO_TRACK_STATS].ticks, 3);
    }

    subscription.stop();
    assert!(!engine.is_running());

    let (received, observer) = recorder();
    let _subscription = engine.subscribe(observer);
    tokio::time::sleep(Duration::from_millis(10)).await;

    let received = received.lock().unwrap();
    let first = received.first().expect("no tick delivered after resubscribing");
    assert_eq!(first.tick, 1);
    let issue = &first.issues.aggregated.issues[NO_TRACK_STATS];
    assert_eq!((issue.registered, issue.ticks), (1, 1));
    assert!(issue.active);
}

#[tokio::test(start_paused = true)]
async fn result_arriving_after_shutdown_is_discarded() {
    let (engine, source) = silent_call();
    source.set_delay(Some(Duration::from_millis(500)));

    let (received, observer) = recorder();
    let mut subscription = engine.subscribe(observer);

    tokio::time::sleep(Duration::from_millis(100)).await;
    subscription.stop();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(received.lock().unwrap().is_empty());
    assert_eq!(source.fetches(), 1);
    assert!(!engine.is_running());
}

#[tokio::test(start_paused = true)]
async fn late_subscriber_receives_the_last_tick() {
    let (engine, source) = silent_call();

    let (early, observer) = recorder();
    let _early_subscription = engine.subscribe(observer);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let fetches = source.fetches();

    let (late, observer) = recorder();
    let _late_subscription = engine.subscribe(observer);
    tokio::time::sleep(Duration::from_millis(10)).await;

    let early = early.lock().unwrap();
    let late = late.lock().unwrap();
    assert_eq!(late.len(), 1);
    assert_eq!(late[0].tick, 1);
    assert!(Arc::ptr_eq(&early[0], &late[0]));
    assert_eq!(engine.subscribers(), 2);
    assert_eq!(source.fetches(), fetches);
}

#[tokio::test(start_paused = true)]
async fn hung_connection_does_not_stall_the_engine() {
    let (engine, source) = silent_call();
    source.set_delay(Some(Duration::from_secs(3600)));

    let (received, observer) = recorder();
    let _subscription = engine.subscribe(observer);
    tokio::time::sleep(Duration::from_secs(7)).await;

    let received = received.lock().unwrap();
    assert!(received.len() >= 3);
    let last = received.last().unwrap();
    assert_eq!(last.fetch_failures, last.tick);
}

#[tokio::test(start_paused = true)]
async fn stop_does_not_wait_for_an_in_flight_fetch() {
    let (engine, source) = silent_call_with(EngineSettings {
        cpu_sampler: false,
        fetch_timeout_ms: 3_600_000,
        ..Default::default()
    });
    source.set_delay(Some(Duration::from_secs(3600)));

    let (received, observer) = recorder();
    let mut subscription = engine.subscribe(observer);
    tokio::time::sleep(Duration::from_millis(100)).await;
    // Held by this test, the engine and the running pipeline.
    assert_eq!(Arc::strong_count(&source), 3);

    subscription.stop();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(Arc::strong_count(&source), 2);
    assert!(received.lock().unwrap().is_empty());
    assert!(!engine.is_running());
}
