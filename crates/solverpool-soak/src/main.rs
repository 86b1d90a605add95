#![doc = include_str!("../README.md")]

mod config;
mod engine;
mod telemetry;

use clap::Parser;
use config::{CliArgs, SoakConfig};
use engine::{SimulatedEngine, SimulatedFactory, Solution};
use indicatif::{ProgressBar, ProgressStyle};
use solverpool::{BatchError, BatchOptions, ItemError, ItemResult, WorkItem, WorkerPool};
use std::time::{Duration, Instant};
use telemetry::init_telemetry;
use tokio::signal;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

type Pool = WorkerPool<SimulatedFactory>;

#[derive(Debug, Default)]
struct RoundSummary {
    solved: usize,
    rejected: usize,
    lost: usize,
    cancelled: usize,
    solve_time: Duration,
}

impl RoundSummary {
    fn tally(results: &[ItemResult<Solution>]) -> Self {
        let mut summary = Self::default();
        for result in results {
            match result {
                Ok(solution) => {
                    summary.solved += 1;
                    summary.solve_time += solution.elapsed;
                }
                Err(ItemError::Failed { source, .. }) if source.is_crash() => summary.lost += 1,
                Err(ItemError::Failed { .. }) => summary.rejected += 1,
                Err(ItemError::Cancelled { .. } | ItemError::Aborted { .. }) => summary.cancelled += 1,
            }
        }
        summary
    }

    fn mean_solve(&self) -> Duration {
        u32::try_from(self.solved)
            .ok()
            .filter(|n| *n > 0)
            .map_or(Duration::ZERO, |n| self.solve_time / n)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = SoakConfig::try_from(args)?;

    let providers = init_telemetry()?;
    log_startup_info(&config);

    let started = Instant::now();
    let pool = WorkerPool::new(SimulatedFactory::new(config.profile.clone()), config.pool.clone()).await?;
    tracing::info!("{pool} ready after {:?}", started.elapsed());

    tokio::select! {
        res = soak(&pool, &config) => {
            if let Err(e) = res {
                tracing::error!("soak run stopped: {e:#}");
            }
        }
        () = shutdown_signal() => {
            tracing::info!("Shutdown signal received, terminating gracefully...");
        }
    }

    let restarts: u64 = pool.slots().map(|slot| slot.generation()).sum();
    let report = pool.exit().await;
    tracing::info!(
        restarts,
        terminated = report.terminated,
        teardown_failures = report.failures.len(),
        elapsed = ?started.elapsed(),
        "soak finished"
    );

    providers.shutdown();
    Ok(())
}

async fn soak(pool: &Pool, config: &SoakConfig) -> anyhow::Result<()> {
    for round in 1..=config.rounds {
        let bar = progress_bar(config)?;
        let options = {
            let bar = bar.clone();
            BatchOptions::default().on_progress(move |p| {
                bar.set_position(p.finished as u64);
                bar.set_message(format!("{} failed, {} running", p.failed, p.running));
            })
        };

        let started = Instant::now();
        let outcome = if config.inputs.is_empty() {
            pool.map_with(
                |engine: &mut SimulatedEngine, case: u64| engine.solve(case),
                0..config.cases,
                options,
            )
            .await
        } else {
            let items = config.inputs.iter().map(WorkItem::input).collect();
            pool.run_batch_with(items, options).await
        };
        bar.finish_and_clear();

        let (results, fatal) = match outcome {
            Ok(results) => (results, None),
            Err(BatchError { source, results }) => (results, Some(source)),
        };

        let summary = RoundSummary::tally(&results);
        tracing::info!(
            round,
            solved = summary.solved,
            rejected = summary.rejected,
            lost = summary.lost,
            cancelled = summary.cancelled,
            mean_solve = ?summary.mean_solve(),
            elapsed = ?started.elapsed(),
            capacity = pool.capacity(),
            "round complete"
        );

        if let Some(err) = fatal {
            return Err(err.into());
        }
    }
    Ok(())
}

fn progress_bar(config: &SoakConfig) -> anyhow::Result<ProgressBar> {
    if !config.show_progress {
        return Ok(ProgressBar::hidden());
    }

    let bar = ProgressBar::new(config.round_size());
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")?
            .progress_chars("=> "),
    );
    bar.enable_steady_tick(Duration::from_millis(100));
    Ok(bar)
}

fn log_startup_info(config: &SoakConfig) {
    if cfg!(debug_assertions) {
        tracing::info!("Starting soak run with full config: {:#?}", config);
    } else {
        tracing::info!(
            "Starting soak run with {} workers, {} items x {} rounds",
            config.pool.size,
            config.round_size(),
            config.rounds
        );
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }
}
