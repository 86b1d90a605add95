//! Simulated solver engines.
//!
//! Each engine behaves like a remote solver process: it takes a while to
//! start, takes a random amount of time per case, and at configurable rates
//! either dies mid-solve or rejects the case.

use futures::future::BoxFuture;
use rand::Rng;
use solverpool::{Engine, EngineError, EngineFactory, SlotContext};
use std::{
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

/// Failure-injection knobs shared by every engine of a run.
#[derive(Clone, Debug)]
pub struct Profile {
    pub crash_rate: f64,
    pub error_rate: f64,
    pub startup_failure_rate: f64,
    pub startup: Duration,
    pub min_solve: Duration,
    pub max_solve: Duration,
}

/// What a successful solve reports back.
#[derive(Clone, Debug)]
pub struct Solution {
    pub slot: usize,
    pub generation: u64,
    pub label: String,
    pub elapsed: Duration,
}

enum Fate {
    Solve,
    Reject,
    Crash,
}

pub struct SimulatedEngine {
    slot: usize,
    generation: u64,
    alive: bool,
    solved: u64,
    profile: Arc<Profile>,
}

impl SimulatedEngine {
    /// Solves synthetic case `case`.
    pub fn solve(&mut self, case: u64) -> BoxFuture<'_, Result<Solution, EngineError>> {
        Box::pin(async move { self.run(format!("case-{case}")).await })
    }

    fn draw(&self) -> (Duration, Fate) {
        let mut rng = rand::rng();
        let (min, max) = (self.profile.min_solve, self.profile.max_solve);
        let solve = if max > min {
            rng.random_range(min..=max)
        } else {
            min
        };
        let fate = if rng.random_bool(self.profile.crash_rate) {
            Fate::Crash
        } else if rng.random_bool(self.profile.error_rate) {
            Fate::Reject
        } else {
            Fate::Solve
        };
        (solve, fate)
    }

    async fn run(&mut self, label: String) -> Result<Solution, EngineError> {
        if !self.alive {
            return Err(EngineError::connection("engine is not running"));
        }

        let started = Instant::now();
        let (solve, fate) = self.draw();

        match fate {
            Fate::Crash => {
                // Die partway through, like a solver hitting a segfault.
                tokio::time::sleep(solve / 2).await;
                self.alive = false;
                tracing::debug!(slot = self.slot, generation = self.generation, %label, "simulated crash");
                Err(EngineError::connection(format!(
                    "engine {}:{} exited while solving {label}",
                    self.slot, self.generation
                )))
            }
            Fate::Reject => {
                tokio::time::sleep(solve / 4).await;
                Err(EngineError::execution(format!("{label} did not converge")))
            }
            Fate::Solve => {
                tokio::time::sleep(solve).await;
                self.solved += 1;
                Ok(Solution {
                    slot: self.slot,
                    generation: self.generation,
                    label,
                    elapsed: started.elapsed(),
                })
            }
        }
    }
}

impl Engine for SimulatedEngine {
    type Output = Solution;

    async fn submit(&mut self, input: &Path) -> Result<Solution, EngineError> {
        if !input.is_file() {
            return Err(EngineError::execution(format!(
                "{} is not a readable input deck",
                input.display()
            )));
        }
        self.run(input.display().to_string()).await
    }

    async fn is_alive(&mut self) -> bool {
        self.alive
    }

    async fn terminate(&mut self) -> Result<(), EngineError> {
        tracing::trace!(
            slot = self.slot,
            generation = self.generation,
            solved = self.solved,
            "engine terminated"
        );
        self.alive = false;
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), EngineError> {
        if self.alive {
            Ok(())
        } else {
            Err(EngineError::connection("engine is not running"))
        }
    }
}

pub struct SimulatedFactory {
    profile: Arc<Profile>,
}

impl SimulatedFactory {
    pub fn new(profile: Profile) -> Self {
        Self {
            profile: Arc::new(profile),
        }
    }
}

impl EngineFactory for SimulatedFactory {
    type Engine = SimulatedEngine;

    async fn connect(&self, ctx: SlotContext) -> Result<SimulatedEngine, EngineError> {
        tokio::time::sleep(self.profile.startup).await;

        let refused = rand::rng().random_bool(self.profile.startup_failure_rate);
        if refused {
            return Err(EngineError::launch(format!(
                "engine for slot {} failed to come up",
                ctx.index
            )));
        }

        if let Some(dir) = &ctx.run_dir {
            std::fs::write(dir.join("engine.lock"), format!("{}\n", ctx.generation))
                .map_err(|e| EngineError::launch(format!("cannot write lock file: {e}")))?;
        }

        tracing::debug!(
            slot = ctx.index,
            generation = ctx.generation,
            port = ?ctx.port,
            "simulated engine up"
        );

        Ok(SimulatedEngine {
            slot: ctx.index,
            generation: ctx.generation,
            alive: true,
            solved: 0,
            profile: Arc::clone(&self.profile),
        })
    }
}
