use super::state::{EngineOf, Lease, Shared};
use crate::{
    engine::{Engine, EngineFactory},
    error::EngineError,
    item::Job,
    slot::SlotState,
    telemetry,
};
use core::{panic::AssertUnwindSafe, time::Duration};
use futures::FutureExt;
use std::{any::Any, sync::Arc, time::Instant};
use tokio::time::{MissedTickBehavior, interval, timeout};

/// What happened to one attempt at an item.
pub(crate) enum Outcome<T> {
    Done(T),
    /// The engine reported an error but is still healthy.
    Failed(EngineError),
    /// The worker was lost while running the item.
    Crashed(EngineError),
    /// The worker was found dead before the item started. The attempt does
    /// not count against the item.
    Unavailable,
    /// The pool shut down mid-item.
    Cancelled,
}

/// Connects one engine, bounded by the startup timeout and by pool shutdown.
async fn start_engine<F: EngineFactory>(
    shared: &Shared<F>,
    ctx: crate::engine::SlotContext,
) -> Result<EngineOf<F>, EngineError> {
    let limit = shared.config.startup_timeout;
    tokio::select! {
        res = timeout(limit, shared.factory.connect(ctx)) => {
            res.unwrap_or(Err(EngineError::Timeout(limit)))
        }
        () = shared.shutdown.cancelled() => Err(EngineError::launch("pool is shutting down")),
    }
}

/// Brings a slot live, retrying up to `restart_attempts` times. An engine
/// that connects but fails its first ping counts as a failed attempt.
pub(crate) async fn boot_slot<F: EngineFactory>(
    shared: &Shared<F>,
    index: usize,
    restart: bool,
) -> Result<EngineOf<F>, EngineError> {
    let ctx = shared.prepare_context(index, restart)?;
    let attempts = shared.config.restart_attempts;
    let mut last_err = EngineError::launch("no start attempt was made");

    for attempt in 1..=attempts {
        if shared.shutdown.is_cancelled() {
            return Err(EngineError::launch("pool is shutting down"));
        }
        let started = match start_engine(shared, ctx.clone()).await {
            Ok(mut engine) => {
                if probe(&mut engine, shared.config.ping_timeout).await {
                    Ok(engine)
                } else {
                    // Connected but already gone. Keep the run directory for
                    // the next attempt.
                    if let Err(e) = shared.retire(index, engine, None).await {
                        tracing::debug!(slot = index, "teardown of dead-on-arrival worker failed: {e}");
                    }
                    Err(EngineError::connection("worker failed liveness check after starting"))
                }
            }
            Err(e) => Err(e),
        };

        match started {
            Ok(engine) => {
                tracing::debug!(
                    slot = index,
                    generation = ctx.generation,
                    port = ?ctx.port,
                    "worker started"
                );
                return Ok(engine);
            }
            Err(e) => {
                tracing::warn!(
                    slot = index,
                    generation = ctx.generation,
                    attempt,
                    attempts,
                    "failed to start worker: {e}"
                );
                last_err = e;
            }
        }
    }

    Err(last_err)
}

/// Replaces a slot's engine: STARTING -> LIVE, or DEAD for good if every
/// start attempt fails.
pub(crate) async fn respawn<F: EngineFactory>(shared: Arc<Shared<F>>, index: usize) {
    match boot_slot(&shared, index, true).await {
        Ok(engine) => match shared.install(index, engine) {
            None => {
                telemetry::increment_worker_restarts();
                tracing::info!(
                    slot = index,
                    generation = shared.slots[index].generation(),
                    "worker restarted"
                );
            }
            Some(engine) => {
                // The pool closed while we were connecting.
                let run_dir = shared.slots[index].run_dir();
                let result = shared.retire(index, engine, run_dir).await;
                shared.record_teardown(Some(index), result);
                shared.settle(index, SlotState::Closed);
            }
        },
        Err(e) => {
            shared.settle(index, SlotState::Dead);
            if !shared.is_closed() {
                tracing::error!(
                    slot = index,
                    capacity = shared.capacity(),
                    "worker could not be restarted, pool capacity reduced: {e}"
                );
            }
        }
    }
}

/// Takes a lost worker out of service and, if configured, starts its
/// replacement in the background.
///
/// `idle` is set when the loss was found by a ping rather than by running an
/// item.
pub(crate) fn recycle<F: EngineFactory>(
    shared: &Arc<Shared<F>>,
    lease: Lease<EngineOf<F>>,
    reason: &EngineError,
    idle: bool,
) {
    let Lease {
        slot,
        generation,
        engine,
    } = lease;

    telemetry::increment_worker_crashes();
    let (next, run_dir) = shared.mark_dead(slot, idle);
    match next {
        SlotState::Starting => {
            tracing::warn!(slot, generation, "worker died, restarting: {reason}");
        }
        SlotState::Dead if shared.config.restart_on_failure => {
            tracing::error!(
                slot,
                generation,
                capacity = shared.capacity(),
                "worker keeps dying before it can run anything, giving up on it: {reason}"
            );
        }
        SlotState::Dead => {
            tracing::warn!(
                slot,
                generation,
                capacity = shared.capacity(),
                "worker died, continuing with reduced capacity: {reason}"
            );
        }
        _ => {
            tracing::debug!(slot, generation, "worker lost during shutdown: {reason}");
        }
    }

    let shared = Arc::clone(shared);
    let tracker = shared.tracker.clone();
    tracker.spawn(async move {
        let result = shared.retire(slot, engine, run_dir).await;
        if next == SlotState::Closed {
            shared.record_teardown(Some(slot), result);
        } else if let Err(e) = result {
            tracing::debug!(slot, generation, "teardown of dead worker failed: {e}");
        }
        if next == SlotState::Starting {
            respawn(shared, slot).await;
        }
    });
}

/// Returns a healthy engine to its slot, or tears it down if the pool has
/// closed in the meantime.
pub(crate) async fn settle<F: EngineFactory>(shared: &Shared<F>, lease: Lease<EngineOf<F>>) {
    let slot = lease.slot;
    if let Some(engine) = shared.install(slot, lease.engine) {
        let run_dir = shared.slots[slot].run_dir();
        let result = shared.retire(slot, engine, run_dir).await;
        shared.record_teardown(Some(slot), result);
        shared.settle(slot, SlotState::Closed);
    }
}

async fn probe<E: Engine>(engine: &mut E, limit: Duration) -> bool {
    timeout(limit, engine.is_alive()).await.unwrap_or(false)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Runs one attempt of an item on a leased engine and puts the engine where
/// it belongs afterwards.
pub(crate) async fn execute<F, T>(
    shared: Arc<Shared<F>>,
    mut lease: Lease<EngineOf<F>>,
    job: Job<EngineOf<F>, T>,
    item_timeout: Option<Duration>,
) -> Outcome<T>
where
    F: EngineFactory,
    T: Send + 'static,
{
    let ping = shared.config.ping_timeout;
    if !probe(&mut lease.engine, ping).await {
        recycle(
            &shared,
            lease,
            &EngineError::connection("worker failed liveness check before dispatch"),
            true,
        );
        return Outcome::Unavailable;
    }
    shared.mark_proven(lease.slot);

    telemetry::increment_items_dispatched();
    let started = Instant::now();

    let result = {
        let engine = &mut lease.engine;
        let call = AssertUnwindSafe(async move { job.as_ref()(engine).await }).catch_unwind();
        let call = async move {
            let res = match item_timeout {
                Some(limit) => timeout(limit, call)
                    .await
                    .unwrap_or(Ok(Err(EngineError::Timeout(limit)))),
                None => call.await,
            };
            res.unwrap_or_else(|payload| Err(EngineError::Panicked(panic_message(&*payload))))
        };

        tokio::select! {
            biased;
            () = shared.shutdown.cancelled() => None,
            res = call => Some(res),
        }
    };

    telemetry::record_item_duration(started.elapsed().as_secs_f64() * 1000.0);

    match result {
        None => {
            // Dropping the call above interrupted it; the pool is closed, so
            // this hands the engine to teardown.
            settle(&shared, lease).await;
            Outcome::Cancelled
        }
        Some(Ok(value)) => {
            settle(&shared, lease).await;
            Outcome::Done(value)
        }
        Some(Err(err)) if err.is_crash() => {
            recycle(&shared, lease, &err, false);
            Outcome::Crashed(err)
        }
        Some(Err(err)) => {
            if probe(&mut lease.engine, ping).await {
                settle(&shared, lease).await;
                Outcome::Failed(err)
            } else {
                recycle(&shared, lease, &err, false);
                Outcome::Crashed(err)
            }
        }
    }
}

/// Periodic heartbeat over idle workers. Busy workers are checked by the
/// item they are running.
pub(crate) async fn monitor<F: EngineFactory>(shared: Arc<Shared<F>>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = shared.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        for index in 0..shared.slots.len() {
            let mut lease = match shared.try_lease_slot(index) {
                Ok(Some(lease)) => lease,
                Ok(None) | Err(crate::PoolError::SlotUnavailable(_)) => continue,
                Err(_) => return,
            };
            if probe(&mut lease.engine, shared.config.ping_timeout).await {
                settle(&shared, lease).await;
            } else {
                recycle(&shared, lease, &EngineError::connection("heartbeat failed"), true);
            }
        }
    }

    tracing::trace!("pool monitor stopped");
}
