//! In-process engine doubles.
//!
//! Jobs are plain strings and "processing" one reverses it. A job's prefix
//! picks its behavior:
//!
//! - `die...`: the engine dies under the job, every time.
//! - `bad...`: the engine rejects the job but stays alive.
//! - `slow...`: the job takes far longer than any test timeout.
//!
//! Any job registered with [`FakeState::crash_once`] kills its engine the
//! first time it runs and succeeds after that.

use crate::{Engine, EngineError, EngineFactory, SlotContext};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::{
    collections::HashSet,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

pub(crate) const SLOW: Duration = Duration::from_secs(5);
pub(crate) const SLOW_RESTART: Duration = Duration::from_millis(300);

#[derive(Default)]
pub(crate) struct FakeState {
    pub connects: AtomicUsize,
    pub resets: AtomicUsize,
    pub terminated: AtomicUsize,
    pub fail_terminate: AtomicBool,
    /// `terminate` never returns.
    pub hang_terminate: AtomicBool,
    /// Every connection for a replacement engine fails.
    pub refuse_restarts: AtomicBool,
    /// Replacement engines take [`SLOW_RESTART`] to connect.
    pub slow_restarts: AtomicBool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    refused_slots: Mutex<HashSet<usize>>,
    crash_once: Mutex<HashSet<String>>,
    killed: Mutex<HashSet<(usize, u64)>>,
    /// Engines of this generation and later connect but never answer a ping.
    dead_from: Mutex<Option<u64>>,
    /// Every engine answers this many pings, then reports itself dead.
    ping_budget: Mutex<Option<u32>>,
    /// `(slot, generation, job)` for every job that ran to completion.
    handled: Mutex<Vec<(usize, u64, String)>>,
}

impl FakeState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every connection attempt for `slot` fails.
    pub fn refuse_slot(&self, slot: usize) {
        self.refused_slots.lock().insert(slot);
    }

    pub fn crash_once(&self, job: &str) {
        self.crash_once.lock().insert(job.to_string());
    }

    /// Kills an engine out from under the pool, as if its process exited.
    pub fn kill(&self, slot: usize, generation: u64) {
        self.killed.lock().insert((slot, generation));
    }

    pub fn dead_from_generation(&self, generation: u64) {
        *self.dead_from.lock() = Some(generation);
    }

    pub fn die_after_pings(&self, pings: u32) {
        *self.ping_budget.lock() = Some(pings);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn handled(&self) -> Vec<(usize, u64, String)> {
        self.handled.lock().clone()
    }
}

pub(crate) struct FakeEngine {
    pub slot: usize,
    pub generation: u64,
    pub port: Option<u16>,
    alive: bool,
    pings: u32,
    state: Arc<FakeState>,
}

impl FakeEngine {
    pub fn process(&mut self, job: String) -> BoxFuture<'_, Result<String, EngineError>> {
        Box::pin(async move {
            let state = Arc::clone(&self.state);
            let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            state.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let result = self.run(&job).await;
            state.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        })
    }

    /// Reports the port the engine was started on.
    pub fn port_of(&mut self) -> BoxFuture<'_, Result<Option<u16>, EngineError>> {
        Box::pin(async move { Ok(self.port) })
    }

    /// Reports which engine answered.
    pub fn identity(&mut self) -> BoxFuture<'_, Result<(usize, u64), EngineError>> {
        Box::pin(async move { Ok((self.slot, self.generation)) })
    }

    async fn run(&mut self, job: &str) -> Result<String, EngineError> {
        tokio::time::sleep(Duration::from_millis(20)).await;

        if job.starts_with("slow") {
            tokio::time::sleep(SLOW).await;
        }
        if job.starts_with("die") || self.state.crash_once.lock().remove(job) {
            self.alive = false;
            return Err(EngineError::connection("engine process exited"));
        }
        if job.starts_with("bad") {
            return Err(EngineError::execution(format!("rejected {job}")));
        }

        self.state
            .handled
            .lock()
            .push((self.slot, self.generation, job.to_string()));
        Ok(job.chars().rev().collect())
    }
}

impl Engine for FakeEngine {
    type Output = String;

    async fn submit(&mut self, input: &Path) -> Result<String, EngineError> {
        let text = std::fs::read_to_string(input)
            .map_err(|e| EngineError::execution(format!("{}: {e}", input.display())))?;
        self.process(text.trim().to_string()).await
    }

    async fn is_alive(&mut self) -> bool {
        self.pings += 1;
        let out_of_pings = self
            .state
            .ping_budget
            .lock()
            .is_some_and(|budget| self.pings > budget);
        let born_dead = self
            .state
            .dead_from
            .lock()
            .is_some_and(|from| self.generation >= from);
        self.alive
            && !out_of_pings
            && !born_dead
            && !self.state.killed.lock().contains(&(self.slot, self.generation))
    }

    async fn terminate(&mut self) -> Result<(), EngineError> {
        if self.state.hang_terminate.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.state.fail_terminate.load(Ordering::SeqCst) {
            return Err(EngineError::connection("engine refused to exit"));
        }
        self.state.terminated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), EngineError> {
        self.state.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Clone)]
pub(crate) struct FakeFactory {
    state: Arc<FakeState>,
}

impl FakeFactory {
    pub fn new(state: &Arc<FakeState>) -> Self {
        Self {
            state: Arc::clone(state),
        }
    }
}

impl EngineFactory for FakeFactory {
    type Engine = FakeEngine;

    async fn connect(&self, ctx: SlotContext) -> Result<FakeEngine, EngineError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        if ctx.generation > 0 && self.state.slow_restarts.load(Ordering::SeqCst) {
            tokio::time::sleep(SLOW_RESTART).await;
        }
        let restart_refused = ctx.generation > 0 && self.state.refuse_restarts.load(Ordering::SeqCst);
        if restart_refused || self.state.refused_slots.lock().contains(&ctx.index) {
            return Err(EngineError::launch(format!("slot {} refused", ctx.index)));
        }
        Ok(FakeEngine {
            slot: ctx.index,
            generation: ctx.generation,
            port: ctx.port,
            alive: true,
            pings: 0,
            state: Arc::clone(&self.state),
        })
    }
}

/// Free-function form of [`FakeEngine::process`] for `map` calls.
pub(crate) fn reverse(engine: &mut FakeEngine, job: String) -> BoxFuture<'_, Result<String, EngineError>> {
    engine.process(job)
}
