//! Error types for the worker pool.
//!
//! Errors are split by blast radius:
//!
//! - [`EngineError`]: raised by an [`Engine`](crate::Engine) or its factory.
//!   Crash-class variants take the worker down; execution-class variants only
//!   fail the item.
//! - [`ItemError`]: attached to a single item's result. Never aborts a batch.
//! - [`PoolError`]: pool-wide failures, raised synchronously from the call in
//!   flight.
//! - [`BatchError`]: a [`PoolError`] that interrupted a batch, carrying every
//!   result gathered up to that point.
//!
//! Teardown never raises. [`ExitReport`] aggregates whatever went wrong.

use core::fmt;
use core::time::Duration;
use std::path::PathBuf;

pub type Result<T, E = PoolError> = core::result::Result<T, E>;

/// Result of one work item.
pub type ItemResult<T> = core::result::Result<T, ItemError>;

/// Failure reported by an engine connection.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum EngineError {
    /// The engine could not be started or attached to.
    #[error("Launch failed: {0}")]
    Launch(String),

    /// The connection to the engine broke (process exit, transport error).
    #[error("Connection lost: {0}")]
    Connection(String),

    /// The engine is alive but rejected or failed the work.
    #[error("Execution failed: {0}")]
    Execution(String),

    /// The call did not finish within its deadline.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// User code panicked while holding the engine.
    #[error("Job panicked: {0}")]
    Panicked(String),
}

impl EngineError {
    pub fn launch(reason: impl Into<String>) -> Self {
        Self::Launch(reason.into())
    }

    pub fn connection(reason: impl Into<String>) -> Self {
        Self::Connection(reason.into())
    }

    pub fn execution(reason: impl Into<String>) -> Self {
        Self::Execution(reason.into())
    }

    /// Returns `true` when the error means the worker can no longer be
    /// trusted and must be torn down.
    pub const fn is_crash(&self) -> bool {
        !matches!(self, Self::Execution(_))
    }
}

/// Failure of a single work item.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum ItemError {
    /// The item used up its retry budget.
    #[error("Item {index} failed after {attempts} attempt(s): {source}")]
    Failed {
        index: usize,
        attempts: u32,
        #[source]
        source: EngineError,
    },

    /// The pool shut down while the item was queued or running.
    #[error("Item {index} cancelled: pool closed")]
    Cancelled { index: usize },

    /// A pool-wide failure stopped the batch before this item finished.
    #[error("Item {index} aborted: {reason}")]
    Aborted { index: usize, reason: String },
}

impl ItemError {
    /// Position of the item in the submitted sequence.
    pub const fn index(&self) -> usize {
        match self {
            Self::Failed { index, .. } | Self::Cancelled { index } | Self::Aborted { index, .. } => {
                *index
            }
        }
    }
}

/// Pool-wide failures.
#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    /// A slot could not be brought live within the startup budget.
    #[error("Failed to start worker {slot}: {source}")]
    Initialization {
        slot: usize,
        #[source]
        source: EngineError,
    },

    /// Every slot is dead and none can be restarted.
    #[error("Pool exhausted: no live workers remain")]
    Exhausted,

    /// The pool has been shut down.
    #[error("Pool is closed")]
    Closed,

    /// An input file handed to `run_batch` does not exist.
    #[error("Unable to locate input file {}", .0.display())]
    MissingInput(PathBuf),

    /// The configuration was rejected before any worker started.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Not enough free local ports for the requested pool size.
    #[error("There are not {requested} available ports between {start} and 65535")]
    NoAvailablePorts { requested: usize, start: u16 },

    /// The run location root could not be created.
    #[error("Unable to create run location {}: {source}", path.display())]
    RunLocation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The addressed slot does not exist or is permanently dead.
    #[error("Worker {0} is unavailable")]
    SlotUnavailable(usize),

    /// A call bound to a specific worker failed.
    #[error(transparent)]
    Item(#[from] ItemError),
}

/// A pool-wide failure that interrupted a batch.
///
/// `results` has one entry per submitted item, in input order. Items that
/// finished before the failure keep their real result; the rest are
/// [`ItemError::Aborted`] or [`ItemError::Cancelled`].
pub struct BatchError<T> {
    pub source: PoolError,
    pub results: Vec<ItemResult<T>>,
}

impl<T> BatchError<T> {
    pub(crate) const fn empty(source: PoolError) -> Self {
        Self {
            source,
            results: Vec::new(),
        }
    }

    /// Number of items that completed successfully before the failure.
    pub fn completed(&self) -> usize {
        self.results.iter().filter(|r| r.is_ok()).count()
    }

    /// Consumes the error, returning the successful results with their
    /// input positions.
    pub fn into_completed(self) -> Vec<(usize, T)> {
        self.results
            .into_iter()
            .enumerate()
            .filter_map(|(i, r)| r.ok().map(|v| (i, v)))
            .collect()
    }
}

impl<T> From<PoolError> for BatchError<T> {
    fn from(source: PoolError) -> Self {
        Self::empty(source)
    }
}

impl<T> fmt::Debug for BatchError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchError")
            .field("source", &self.source)
            .field("completed", &self.completed())
            .field("total", &self.results.len())
            .finish()
    }
}

impl<T> fmt::Display for BatchError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} of {} items completed)",
            self.source,
            self.completed(),
            self.results.len()
        )
    }
}

impl<T> std::error::Error for BatchError<T> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// A worker that could not be torn down cleanly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TeardownFailure {
    /// `None` when the failure is not tied to one slot (e.g. stuck tasks).
    pub slot: Option<usize>,
    pub reason: String,
}

impl fmt::Display for TeardownFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.slot {
            Some(slot) => write!(f, "worker {slot}: {}", self.reason),
            None => write!(f, "{}", self.reason),
        }
    }
}

/// Summary of [`WorkerPool::exit`](crate::WorkerPool::exit).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExitReport {
    /// Engines whose `terminate` completed successfully.
    pub terminated: usize,
    pub failures: Vec<TeardownFailure>,
}

impl ExitReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}
