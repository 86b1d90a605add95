//! Per-slot state machine.
//!
//! ```text
//! STARTING -> LIVE -> BUSY -> LIVE     (item finished)
//!             LIVE/BUSY -> STARTING    (engine lost, restart enabled)
//!             LIVE/BUSY -> DEAD        (engine lost, restart disabled)
//!             STARTING -> DEAD         (every start attempt failed)
//! any -> CLOSED                        (pool exit)
//! ```
//!
//! A lost engine whose slot will be refilled goes straight to `Starting`: the
//! slot keeps counting toward capacity while the old engine is torn down and
//! its replacement connects. `Dead` is only ever terminal, so a batch waiting
//! on a restarting slot never sees the pool as exhausted.
//!
//! A [`Slot`] is a stable handle: it outlives the engines that occupy it, so
//! `pool[i]` always describes whichever engine is currently bound to slot `i`.

use core::fmt;
use parking_lot::Mutex;
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SlotState {
    /// The factory is connecting an engine.
    Starting,
    /// Idle and ready for work.
    Live,
    /// Running exactly one item.
    Busy,
    /// Lost its engine for good: restarts are disabled or every start
    /// attempt failed. Terminal.
    Dead,
    /// The pool has shut down.
    Closed,
}

impl SlotState {
    /// Whether the slot still contributes to pool capacity.
    pub const fn has_capacity(self) -> bool {
        matches!(self, Self::Starting | Self::Live | Self::Busy)
    }

    /// Whether an engine is currently connected.
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Live | Self::Busy)
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Live => "live",
            Self::Busy => "busy",
            Self::Dead => "dead",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

pub(crate) struct SlotInner<E> {
    pub state: SlotState,
    /// Present only while the slot is `Live`. A `Busy` slot's engine is on
    /// lease to the task running its item.
    pub engine: Option<E>,
    pub generation: u64,
    /// Engines lost in a row without running an item (failed pings before
    /// dispatch or on heartbeat).
    pub idle_losses: u32,
    pub port: Option<u16>,
    pub run_dir: Option<PathBuf>,
}

/// A fixed position in the pool.
pub struct Slot<E> {
    index: usize,
    pub(crate) inner: Mutex<SlotInner<E>>,
}

impl<E> Slot<E> {
    pub(crate) fn new(index: usize, port: Option<u16>) -> Self {
        Self {
            index,
            inner: Mutex::new(SlotInner {
                state: SlotState::Starting,
                engine: None,
                generation: 0,
                idle_losses: 0,
                port,
                run_dir: None,
            }),
        }
    }

    pub const fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> SlotState {
        self.inner.lock().state
    }

    /// How many times this slot's engine has been replaced.
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    pub fn port(&self) -> Option<u16> {
        self.inner.lock().port
    }

    pub fn run_dir(&self) -> Option<PathBuf> {
        self.inner.lock().run_dir.clone()
    }

    pub fn is_live(&self) -> bool {
        self.state().is_active()
    }
}

impl<E> fmt::Debug for Slot<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Slot")
            .field("index", &self.index)
            .field("state", &inner.state)
            .field("generation", &inner.generation)
            .field("port", &inner.port)
            .field("run_dir", &inner.run_dir)
            .finish()
    }
}
