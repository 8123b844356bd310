//! sessionflow daemon entry point.
//!
//! Loads config, wires up the pipeline, and runs the ingestion scheduler
//! until interrupted.

use std::sync::Arc;

use sessionflow::config::load_config;
use sessionflow::pipeline::Pipeline;
use sessionflow::queries;
use sessionflow::scheduler::Scheduler;
use sessionflow::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = load_config().map_err(anyhow::Error::msg)?;
    if config.watch_folder.is_empty() {
        log::warn!("watchFolder is not set; only sync retries will run");
    }

    let state = Arc::new(AppState::from_config(config)?);
    log::info!(
        "sessionflow starting: {} provider(s), store {}",
        state.orchestrator.provider_count(),
        if state.store.is_some() {
            "configured"
        } else {
            "disabled"
        }
    );

    let counts = queries::status_counts(&state)?;
    log::info!(
        "pipeline state: {} total, {} pending, {} in flight, {} failed",
        counts.total,
        counts.pending,
        counts.in_flight,
        counts.failed
    );

    let pipeline = Arc::new(Pipeline::start(state.clone()));

    // Pick up whatever a previous run left behind before scanning for new
    // work.
    let recovered = pipeline.recover().await?;
    if recovered.requeued + recovered.parked + recovered.sync_rescheduled > 0 {
        log::info!(
            "restart recovery: {} requeued, {} parked for operator retry, {} sync retries rescheduled",
            recovered.requeued,
            recovered.parked,
            recovered.sync_rescheduled
        );
    }

    let scheduler = Arc::new(Scheduler::new(state.clone(), pipeline));

    tokio::select! {
        _ = scheduler.run() => {}
        result = tokio::signal::ctrl_c() => {
            result?;
            log::info!("shutting down");
        }
    }

    Ok(())
}
