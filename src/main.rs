use std::sync::Arc;

use anyhow::Result;
use media_quality_telemetry::{
    cli, logger, settings,
    simulation::SimulatedCall,
    telemetry::{Engine, TickReport},
};
use tracing::*;

fn summarize(report: &TickReport) {
    let aggregated = &report.issues.aggregated;

    let active: Vec<&String> = aggregated
        .issues
        .iter()
        .filter(|(_, issue)| issue.active)
        .map(|(key, _)| key)
        .collect();

    info!(
        "Tick {}: {} views, {} active issues {active:?}, {} fetch failures",
        report.tick,
        report.stats.len(),
        active.len(),
        report.fetch_failures,
    );

    for (key, metric) in aggregated
        .metrics
        .iter()
        .filter(|(_, metric)| metric.cur_ticks > 0)
    {
        debug!(
            "{key}: cur avg {:.3} over {} views, lifetime avg {:.3}",
            metric.cur_avg, metric.cur_ticks, metric.avg
        );
    }

    match serde_json::to_string(report) {
        Ok(json) => trace!("Tick report: {json}"),
        Err(error) => warn!("Failed to serialize tick report: {error:?}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    cli::manager::init();
    logger::manager::init()?;
    settings::manager::init(Some(cli::manager::settings_file().as_str()))?;

    let engine_settings = settings::manager::effective_engine_settings();
    debug!("Engine settings: {engine_settings:#?}");

    let mut call = SimulatedCall::new(cli::manager::simulated_remote_clients(), true);
    let engine = Engine::new(
        engine_settings.clone(),
        call.registry.clone(),
        call.source.clone(),
        call.clients.clone(),
    );

    let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel::<Arc<TickReport>>();
    let mut subscription = engine.subscribe(move |report: &Arc<TickReport>| {
        let _ = sender.send(report.clone());
    });

    let max_ticks = cli::manager::ticks();
    let mut delivered = 0;

    loop {
        tokio::select! {
            report = receiver.recv() => {
                let Some(report) = report else {
                    break;
                };
                summarize(&report);

                delivered += 1;
                if max_ticks.is_some_and(|max_ticks| delivered >= max_ticks) {
                    break;
                }

                call.advance(engine_settings.poll_interval());
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping");
                break;
            }
        }
    }

    subscription.stop();
    info!("Delivered {delivered} ticks");

    Ok(())
}
