//! The seam between the pool and the external solver.
//!
//! The pool does not know how an engine is launched or what protocol it
//! speaks. It only needs a handle that can run an input, answer a heartbeat
//! and shut down, plus a factory that produces one such handle per slot.

use crate::error::EngineError;
use core::future::Future;
use std::path::{Path, PathBuf};

/// A connection to one running engine instance.
///
/// A pool owns each engine exclusively: at most one item runs against it at a
/// time, so implementations never need interior locking.
pub trait Engine: Send + 'static {
    /// What a successful `submit` returns (typically the engine's text output).
    type Output: Send + 'static;

    /// Runs one input file to completion.
    fn submit(
        &mut self,
        input: &Path,
    ) -> impl Future<Output = Result<Self::Output, EngineError>> + Send;

    /// Cheap liveness probe used for heartbeats and before each dispatch.
    fn is_alive(&mut self) -> impl Future<Output = bool> + Send;

    /// Shuts the engine down and releases its process.
    fn terminate(&mut self) -> impl Future<Output = Result<(), EngineError>> + Send;

    /// Clears engine state before an input file runs.
    fn reset(&mut self) -> impl Future<Output = Result<(), EngineError>> + Send {
        async { Ok(()) }
    }
}

/// Everything a factory is told about the slot it is filling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotContext {
    /// Fixed position of the slot in the pool.
    pub index: usize,
    /// Incremented every time the slot's engine is replaced. Starts at 0.
    pub generation: u64,
    /// Port reserved for this engine, when the pool allocates ports.
    pub port: Option<u16>,
    /// Private working directory, when the pool has a run location.
    pub run_dir: Option<PathBuf>,
}

/// Starts or attaches to engines on behalf of the pool.
///
/// Called once per slot at construction and again for every restart.
/// Any `Fn(SlotContext) -> impl Future<Output = Result<E, EngineError>>`
/// closure is a factory.
pub trait EngineFactory: Send + Sync + 'static {
    type Engine: Engine;

    fn connect(
        &self,
        ctx: SlotContext,
    ) -> impl Future<Output = Result<Self::Engine, EngineError>> + Send;
}

impl<F, Fut, E> EngineFactory for F
where
    F: Fn(SlotContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<E, EngineError>> + Send,
    E: Engine,
{
    type Engine = E;

    fn connect(&self, ctx: SlotContext) -> impl Future<Output = Result<E, EngineError>> + Send {
        self(ctx)
    }
}
