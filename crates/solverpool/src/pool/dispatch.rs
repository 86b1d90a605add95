//! Batch coordination.
//!
//! One coordinator loop per batch owns the pending queue and the per-item
//! state. It leases an idle worker whenever there is work left, hands the
//! item to a tracked task, and folds finished attempts back in. Crashed
//! attempts go to the back of the queue until the item's retry budget is
//! spent; items whose worker turned out to be dead before they started go
//! back to the front at no cost.

use super::{
    state::{EngineOf, Shared},
    worker::{self, Outcome},
};
use crate::{
    config::BatchOptions,
    engine::EngineFactory,
    error::{ItemError, ItemResult, PoolError},
    item::{ItemState, Job, Progress},
    telemetry,
};
use std::{collections::VecDeque, sync::Arc};
use tokio::sync::mpsc;

struct Finished<T> {
    index: usize,
    /// Attempts charged before this one.
    attempts: u32,
    outcome: Outcome<T>,
}

/// Runs every job to a terminal result, calling `report` exactly once per
/// item that reaches one.
///
/// Returns an error if the pool closed or lost all capacity before every item
/// could run. Items still queued at that point are reported as cancelled or
/// aborted; items already in flight are drained first, so nothing that
/// finished is dropped.
pub(crate) async fn dispatch<F, T>(
    shared: &Arc<Shared<F>>,
    jobs: Vec<Job<EngineOf<F>, T>>,
    options: &BatchOptions,
    mut report: impl FnMut(usize, ItemResult<T>),
) -> Result<(), PoolError>
where
    F: EngineFactory,
    T: Send + 'static,
{
    let retries = options.retries.unwrap_or(shared.config.item_retries);
    let item_timeout = options.item_timeout.or(shared.config.item_timeout);

    let mut states = vec![ItemState::Pending; jobs.len()];
    let mut pending: VecDeque<(usize, u32)> = (0..jobs.len()).map(|index| (index, 0)).collect();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Finished<T>>();
    let mut running = 0_usize;
    let mut fatal: Option<PoolError> = None;

    tracing::debug!(items = jobs.len(), retries, "dispatching batch");

    loop {
        let can_dispatch = fatal.is_none() && !pending.is_empty();

        tokio::select! {
            lease = shared.lease(), if can_dispatch => {
                let lease = match lease {
                    Ok(lease) => lease,
                    Err(e) => {
                        tracing::debug!(running, queued = pending.len(), "batch interrupted: {e}");
                        fatal = Some(e);
                        continue;
                    }
                };
                let Some((index, attempts)) = pending.pop_front() else {
                    worker::settle(shared, lease).await;
                    continue;
                };

                tracing::trace!(item = index, slot = lease.slot, attempt = attempts + 1, "item dispatched");
                states[index] = ItemState::Running;
                running += 1;

                let shared = Arc::clone(shared);
                let job = Arc::clone(&jobs[index]);
                let done_tx = done_tx.clone();
                let tracker = shared.tracker.clone();
                tracker.spawn(async move {
                    let outcome = worker::execute(shared, lease, job, item_timeout).await;
                    let _ = done_tx.send(Finished { index, attempts, outcome });
                });
            }
            Some(Finished { index, attempts, outcome }) = done_rx.recv(), if running > 0 => {
                running -= 1;
                let attempts = attempts + 1;

                let result = match outcome {
                    Outcome::Done(value) => Ok(value),
                    Outcome::Failed(source) => Err(ItemError::Failed { index, attempts, source }),
                    Outcome::Crashed(source) if attempts <= retries => {
                        tracing::debug!(item = index, attempts, "worker lost mid-item, requeueing: {source}");
                        states[index] = ItemState::Pending;
                        pending.push_back((index, attempts));
                        continue;
                    }
                    Outcome::Crashed(source) => Err(ItemError::Failed { index, attempts, source }),
                    Outcome::Unavailable => {
                        states[index] = ItemState::Pending;
                        pending.push_front((index, attempts - 1));
                        continue;
                    }
                    Outcome::Cancelled => Err(ItemError::Cancelled { index }),
                };

                match &result {
                    Ok(_) => states[index] = ItemState::Done,
                    Err(e) => {
                        tracing::debug!(item = index, "item failed: {e}");
                        telemetry::increment_items_failed();
                        states[index] = ItemState::Failed;
                    }
                }
                report(index, result);

                if let Some(progress) = &options.progress {
                    progress(Progress::from_states(&states));
                }
            }
            else => break,
        }
    }

    let Some(err) = fatal else {
        return Ok(());
    };

    let closed = matches!(err, PoolError::Closed);
    let reason = err.to_string();
    for (index, _) in pending.drain(..) {
        let result = if closed {
            Err(ItemError::Cancelled { index })
        } else {
            Err(ItemError::Aborted {
                index,
                reason: reason.clone(),
            })
        };
        report(index, result);
    }

    Err(err)
}
