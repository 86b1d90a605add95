//! Units of work and the handles used to collect their results.

use crate::{
    engine::Engine,
    error::{EngineError, ItemError, ItemResult},
};
use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};
use futures::future::BoxFuture;
use std::{path::PathBuf, sync::Arc};
use tokio::sync::oneshot;

/// A callable run against an engine.
///
/// Shared rather than boxed: the pool may invoke it more than once when an
/// attempt is lost to a worker crash.
pub type Job<E, T> =
    Arc<dyn for<'a> Fn(&'a mut E) -> BoxFuture<'a, Result<T, EngineError>> + Send + Sync>;

/// Wraps a closure as a [`Job`].
///
/// Going through a function lets the compiler infer the higher-ranked
/// signature for closures that borrow the engine.
pub fn job<E, T, F>(f: F) -> Job<E, T>
where
    F: for<'a> Fn(&'a mut E) -> BoxFuture<'a, Result<T, EngineError>> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// One unit of work for [`WorkerPool::run_batch`](crate::WorkerPool::run_batch).
pub enum WorkItem<E: Engine> {
    /// An input file handed to [`Engine::submit`].
    Input(PathBuf),
    /// A callable run with exclusive access to the engine.
    Call(Job<E, E::Output>),
}

impl<E: Engine> WorkItem<E> {
    pub fn input(path: impl Into<PathBuf>) -> Self {
        Self::Input(path.into())
    }

    pub fn call<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a mut E) -> BoxFuture<'a, Result<E::Output, EngineError>>
            + Send
            + Sync
            + 'static,
    {
        Self::Call(job(f))
    }

    /// Lowers the item to the job the dispatcher runs.
    pub(crate) fn into_job(self, clear_at_start: bool) -> Job<E, E::Output> {
        match self {
            Self::Call(job) => job,
            Self::Input(path) => job(move |engine: &mut E| {
                let path = path.clone();
                Box::pin(async move {
                    if clear_at_start {
                        engine.reset().await?;
                    }
                    engine.submit(&path).await
                })
            }),
        }
    }
}

impl<E: Engine> Clone for WorkItem<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Input(path) => Self::Input(path.clone()),
            Self::Call(job) => Self::Call(Arc::clone(job)),
        }
    }
}

impl<E: Engine> core::fmt::Debug for WorkItem<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Input(path) => f.debug_tuple("Input").field(path).finish(),
            Self::Call(_) => f.write_str("Call(..)"),
        }
    }
}

/// Lifecycle of an item inside one dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ItemState {
    Pending,
    Running,
    Done,
    Failed,
}

impl ItemState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Snapshot handed to progress callbacks after every finished item.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Progress {
    pub total: usize,
    pub finished: usize,
    pub failed: usize,
    pub running: usize,
}

impl Progress {
    pub(crate) fn from_states(states: &[ItemState]) -> Self {
        let mut progress = Self {
            total: states.len(),
            ..Self::default()
        };
        for state in states {
            match state {
                ItemState::Done => progress.finished += 1,
                ItemState::Failed => {
                    progress.finished += 1;
                    progress.failed += 1;
                }
                ItemState::Running => progress.running += 1,
                ItemState::Pending => {}
            }
        }
        progress
    }
}

/// Deferred result of one item submitted with
/// [`WorkerPool::spawn_map`](crate::WorkerPool::spawn_map).
///
/// Resolves to [`ItemError::Cancelled`] if the pool drops the item without
/// reporting on it.
#[derive(Debug)]
pub struct ItemHandle<T> {
    index: usize,
    rx: oneshot::Receiver<ItemResult<T>>,
}

impl<T> ItemHandle<T> {
    pub(crate) const fn new(index: usize, rx: oneshot::Receiver<ItemResult<T>>) -> Self {
        Self { index, rx }
    }

    /// Position of the item in the submitted sequence.
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Takes the result if it is ready, without waiting.
    pub fn try_take(&mut self) -> Option<ItemResult<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                Some(Err(ItemError::Cancelled { index: self.index }))
            }
        }
    }
}

impl<T> Future for ItemHandle<T> {
    type Output = ItemResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let index = this.index;
        Pin::new(&mut this.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(ItemError::Cancelled { index })))
    }
}
