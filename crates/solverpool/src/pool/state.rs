//! Shared pool state and the leasing protocol.
//!
//! An idle engine lives inside its [`Slot`]. Dispatch *leases* it: the engine
//! is moved out, the slot turns `Busy`, and the task running the item owns
//! the engine outright until it is installed back. Exclusive ownership is
//! what guarantees at most one item per worker; no lock is held while an
//! engine is in use.
//!
//! Lock order is `state` then a slot's `inner`. Never take `state` while
//! holding a slot lock.

use crate::{
    config::PoolConfig,
    engine::{Engine, EngineFactory, SlotContext},
    error::{EngineError, ExitReport, PoolError, TeardownFailure},
    ports,
    slot::{Slot, SlotState},
};
use parking_lot::Mutex;
use std::{collections::VecDeque, path::PathBuf};
use tokio::{sync::Notify, time::timeout};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

pub(crate) type EngineOf<F> = <F as EngineFactory>::Engine;

pub(crate) struct PoolState {
    /// Idle slots, least recently used first.
    pub idle: VecDeque<usize>,
    pub closed: bool,
}

/// Exclusive use of one slot's engine.
pub(crate) struct Lease<E> {
    pub slot: usize,
    pub generation: u64,
    pub engine: E,
}

pub(crate) struct Shared<F: EngineFactory> {
    pub factory: F,
    pub config: PoolConfig,
    pub slots: Vec<Slot<EngineOf<F>>>,
    pub state: Mutex<PoolState>,
    /// Woken whenever a slot becomes idle or the pool loses capacity.
    pub available: Notify,
    pub shutdown: CancellationToken,
    pub tracker: TaskTracker,
    /// Teardown results produced outside of `exit` itself (in-flight items
    /// that finished after the pool closed).
    pub teardown: Mutex<ExitReport>,
}

impl<F: EngineFactory> Shared<F> {
    pub fn new(factory: F, config: PoolConfig, ports: Option<Vec<u16>>) -> Self {
        let slots = (0..config.size)
            .map(|index| Slot::new(index, ports.as_ref().and_then(|p| p.get(index).copied())))
            .collect();

        Self {
            factory,
            config,
            slots,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                closed: false,
            }),
            available: Notify::new(),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            teardown: Mutex::new(ExitReport::default()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Slots that are live, busy, or on their way back.
    pub fn capacity(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state().has_capacity())
            .count()
    }

    /// Slots with a connected engine.
    pub fn active(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state().is_active())
            .count()
    }

    fn checkout(&self, index: usize) -> Option<Lease<EngineOf<F>>> {
        let mut slot = self.slots[index].inner.lock();
        if slot.state != SlotState::Live {
            return None;
        }
        let engine = slot.engine.take()?;
        slot.state = SlotState::Busy;
        Some(Lease {
            slot: index,
            generation: slot.generation,
            engine,
        })
    }

    /// Leases the least recently used idle slot, if any.
    ///
    /// # Errors
    ///
    /// - [`PoolError::Closed`] once the pool has shut down.
    /// - [`PoolError::Exhausted`] if no slot can ever become idle again.
    pub fn try_lease(&self) -> Result<Option<Lease<EngineOf<F>>>, PoolError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PoolError::Closed);
        }
        while let Some(index) = state.idle.pop_front() {
            if let Some(lease) = self.checkout(index) {
                return Ok(Some(lease));
            }
        }
        if self.capacity() == 0 {
            return Err(PoolError::Exhausted);
        }
        Ok(None)
    }

    /// Leases one specific slot if it is idle.
    pub fn try_lease_slot(&self, index: usize) -> Result<Option<Lease<EngineOf<F>>>, PoolError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PoolError::Closed);
        }
        let Some(slot) = self.slots.get(index) else {
            return Err(PoolError::SlotUnavailable(index));
        };
        if let Some(pos) = state.idle.iter().position(|i| *i == index) {
            state.idle.remove(pos);
            if let Some(lease) = self.checkout(index) {
                return Ok(Some(lease));
            }
        }
        if slot.state().has_capacity() {
            Ok(None)
        } else {
            Err(PoolError::SlotUnavailable(index))
        }
    }

    pub async fn lease(&self) -> Result<Lease<EngineOf<F>>, PoolError> {
        self.wait_for(|| self.try_lease()).await
    }

    pub async fn lease_slot(&self, index: usize) -> Result<Lease<EngineOf<F>>, PoolError> {
        self.wait_for(|| self.try_lease_slot(index)).await
    }

    async fn wait_for<T>(
        &self,
        mut attempt: impl FnMut() -> Result<Option<T>, PoolError>,
    ) -> Result<T, PoolError> {
        loop {
            // Register before checking so a release between the check and the
            // await is not missed.
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(found) = attempt()? {
                return Ok(found);
            }

            tokio::select! {
                () = notified.as_mut() => {}
                () = self.shutdown.cancelled() => return Err(PoolError::Closed),
            }
        }
    }

    /// Puts an engine into its slot and marks it idle.
    ///
    /// Hands the engine back if the pool has closed; the caller must then
    /// tear it down.
    pub fn install(&self, index: usize, engine: EngineOf<F>) -> Option<EngineOf<F>> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Some(engine);
            }
            let mut slot = self.slots[index].inner.lock();
            slot.engine = Some(engine);
            slot.state = SlotState::Live;
            state.idle.push_back(index);
        }
        self.available.notify_waiters();
        None
    }

    /// Records that a slot lost its engine and decides what happens next.
    ///
    /// `idle` marks a loss found by a ping rather than by running an item.
    /// A slot that keeps losing engines that way gives up after
    /// `restart_attempts` in a row instead of restarting forever.
    ///
    /// Returns the slot's new state (`Starting` if a restart follows, `Dead`
    /// if not, `Closed` if the pool is shutting down) and the working
    /// directory the lost engine used.
    pub fn mark_dead(&self, index: usize, idle: bool) -> (SlotState, Option<PathBuf>) {
        let next = {
            let state = self.state.lock();
            let mut slot = self.slots[index].inner.lock();
            slot.engine = None;
            if idle {
                slot.idle_losses += 1;
            }
            slot.state = if state.closed {
                SlotState::Closed
            } else if self.config.restart_on_failure
                && slot.idle_losses < self.config.restart_attempts
            {
                SlotState::Starting
            } else {
                SlotState::Dead
            };
            (slot.state, slot.run_dir.take())
        };
        self.available.notify_waiters();
        next
    }

    /// The slot's engine answered a ping and took on an item.
    pub fn mark_proven(&self, index: usize) {
        self.slots[index].inner.lock().idle_losses = 0;
    }

    /// Moves a slot to `state`, or to `Closed` if the pool has shut down.
    pub fn settle(&self, index: usize, state: SlotState) {
        let closed = self.state.lock().closed;
        self.slots[index].inner.lock().state = if closed { SlotState::Closed } else { state };
        self.available.notify_waiters();
    }

    /// Builds the context for (re)starting a slot. Restarts bump the
    /// generation and move to a fresh port.
    pub fn prepare_context(&self, index: usize, restart: bool) -> Result<SlotContext, EngineError> {
        let port = if restart {
            self.next_port(index)
        } else {
            self.slots[index].port()
        };

        let generation = {
            let mut slot = self.slots[index].inner.lock();
            if restart {
                slot.generation += 1;
                slot.port = port;
            }
            slot.generation
        };

        let run_dir = match &self.config.run_location {
            Some(root) => {
                let dir = root.join(format!("slot_{index}_{generation}"));
                std::fs::create_dir_all(&dir).map_err(|e| {
                    EngineError::launch(format!("cannot create {}: {e}", dir.display()))
                })?;
                Some(dir)
            }
            None => None,
        };
        self.slots[index].inner.lock().run_dir = run_dir.clone();

        Ok(SlotContext {
            index,
            generation,
            port,
            run_dir,
        })
    }

    /// A free port above every port currently handed out, so a restarted
    /// engine never collides with a sibling or its own lingering predecessor.
    fn next_port(&self, index: usize) -> Option<u16> {
        if self.config.starting_port.is_none() {
            return None;
        }
        let highest = self.slots.iter().filter_map(Slot::port).max()?;
        ports::next_available_port(highest).or_else(|| self.slots[index].port())
    }

    /// Terminates an engine within the shutdown grace period, drops it, and
    /// removes its working directory.
    pub async fn retire(
        &self,
        index: usize,
        mut engine: EngineOf<F>,
        run_dir: Option<PathBuf>,
    ) -> Result<(), String> {
        let grace = self.config.shutdown_grace;
        let outcome = match timeout(grace, engine.terminate()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("terminate did not finish within {grace:?}")),
        };
        // Dropping the handle is the forceful fallback.
        drop(engine);

        if let Some(dir) = run_dir.filter(|_| self.config.remove_run_dirs) {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                tracing::warn!(slot = index, dir = %dir.display(), "unable to remove run directory: {e}");
            }
        }

        outcome
    }

    pub fn record_teardown(&self, slot: Option<usize>, result: Result<(), String>) {
        let mut report = self.teardown.lock();
        match result {
            Ok(()) => report.terminated += 1,
            Err(reason) => report.failures.push(TeardownFailure { slot, reason }),
        }
    }

    /// Closes the pool to new work and takes every idle engine out of its
    /// slot. Returns `None` if the pool was already closed.
    #[allow(clippy::type_complexity)]
    pub fn close(&self) -> Option<Vec<(usize, EngineOf<F>, Option<PathBuf>)>> {
        let engines = {
            let mut state = self.state.lock();
            if state.closed {
                return None;
            }
            state.closed = true;
            state.idle.clear();

            self.slots
                .iter()
                .filter_map(|slot| {
                    let mut inner = slot.inner.lock();
                    let engine = inner.engine.take()?;
                    inner.state = SlotState::Closed;
                    Some((slot.index(), engine, inner.run_dir.take()))
                })
                .collect()
        };

        self.shutdown.cancel();
        self.available.notify_waiters();
        Some(engines)
    }

    pub fn mark_all_closed(&self) {
        for slot in &self.slots {
            slot.inner.lock().state = SlotState::Closed;
        }
    }
}
