use super::{
    dispatch::dispatch,
    state::Shared,
    worker::{self, Outcome},
};
use crate::{
    config::{BatchOptions, PoolConfig},
    engine::{Engine, EngineFactory},
    error::{BatchError, EngineError, ExitReport, ItemError, ItemResult, PoolError, Result},
    item::{ItemHandle, Job, WorkItem, job},
    ports,
    slot::Slot,
    telemetry,
};
use core::{fmt, ops::Index};
use futures::future::{BoxFuture, join_all};
use std::sync::Arc;
use tokio::{
    sync::{mpsc, oneshot},
    time::timeout,
};
use tokio_stream::wrappers::UnboundedReceiverStream;

/// A fixed-size, self-healing pool of engines.
///
/// Every slot holds at most one engine and runs at most one item at a time.
/// When an engine dies the pool tears it down, requeues the item it was
/// running, and (if `restart_on_failure` is set) asks the factory for a
/// replacement in the background.
///
/// Dropping the pool without calling [`exit`](Self::exit) cancels all
/// background work and drops idle engines without terminating them.
pub struct WorkerPool<F: EngineFactory> {
    shared: Arc<Shared<F>>,
}

impl<F: EngineFactory> WorkerPool<F> {
    /// Starts `config.size` engines and waits until all are live.
    ///
    /// # Errors
    ///
    /// - [`PoolError::InvalidConfig`] if `config` fails validation.
    /// - [`PoolError::NoAvailablePorts`] if ports were requested and not
    ///   enough are free.
    /// - [`PoolError::RunLocation`] if the run location cannot be created.
    /// - [`PoolError::Initialization`] if any slot cannot be started within
    ///   its attempt budget. Engines that did start are torn down first.
    #[tracing::instrument(skip_all, fields(size = config.size))]
    pub async fn new(factory: F, config: PoolConfig) -> Result<Self> {
        config.validate()?;

        let ports = match config.starting_port {
            Some(start) => Some(ports::available_ports(config.size, start)?),
            None => None,
        };
        if let Some(root) = &config.run_location {
            std::fs::create_dir_all(root).map_err(|source| PoolError::RunLocation {
                path: root.clone(),
                source,
            })?;
        }

        let shared = Arc::new(Shared::new(factory, config, ports));
        let boots = join_all(
            (0..shared.slots.len()).map(|index| worker::boot_slot(&shared, index, false)),
        )
        .await;

        let mut engines = Vec::with_capacity(boots.len());
        let mut failure = None;
        for (index, boot) in boots.into_iter().enumerate() {
            match boot {
                Ok(engine) => engines.push((index, engine)),
                Err(source) if failure.is_none() => {
                    failure = Some(PoolError::Initialization {
                        slot: index,
                        source,
                    });
                }
                Err(_) => {}
            }
        }

        if let Some(err) = failure {
            tracing::error!("{err}");
            shared.close();
            let shared = &shared;
            join_all(engines.into_iter().map(|(index, engine)| async move {
                let run_dir = shared.slots[index].run_dir();
                if let Err(e) = shared.retire(index, engine, run_dir).await {
                    tracing::warn!(slot = index, "teardown after failed start: {e}");
                }
            }))
            .await;
            shared.mark_all_closed();
            return Err(err);
        }

        for (index, engine) in engines {
            shared.install(index, engine);
        }

        if let Some(period) = shared.config.heartbeat_interval {
            shared
                .tracker
                .spawn(worker::monitor(Arc::clone(&shared), period));
        }

        tracing::info!(
            size = shared.slots.len(),
            ports = ?shared.slots.iter().filter_map(Slot::port).collect::<Vec<_>>(),
            "worker pool started"
        );

        Ok(Self { shared })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shared.is_closed() {
            return Err(PoolError::Closed);
        }
        Ok(())
    }

    /// Runs every item and returns results in input order.
    ///
    /// # Errors
    ///
    /// Returns a [`BatchError`] if the pool is closed, an input file does not
    /// exist, or the pool lost every worker mid-batch. In the last case the
    /// error still carries the results of items that finished.
    pub async fn run_batch(
        &self,
        items: Vec<WorkItem<F::Engine>>,
    ) -> Result<Vec<ItemResult<<F::Engine as Engine>::Output>>, BatchError<<F::Engine as Engine>::Output>>
    {
        self.run_batch_with(items, BatchOptions::default()).await
    }

    /// [`run_batch`](Self::run_batch) with per-call options.
    pub async fn run_batch_with(
        &self,
        items: Vec<WorkItem<F::Engine>>,
        options: BatchOptions,
    ) -> Result<Vec<ItemResult<<F::Engine as Engine>::Output>>, BatchError<<F::Engine as Engine>::Output>>
    {
        let jobs = self.prepare_batch(items)?;
        self.collect(jobs, options).await
    }

    /// Submits every item without waiting, like [`spawn_map`](Self::spawn_map).
    /// Handles are in input order.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Closed`] if the pool has shut down, or
    /// [`PoolError::MissingInput`] if an input file does not exist. Nothing
    /// is submitted in either case.
    pub fn spawn_batch(
        &self,
        items: Vec<WorkItem<F::Engine>>,
    ) -> Result<Vec<ItemHandle<<F::Engine as Engine>::Output>>> {
        self.spawn_batch_with(items, BatchOptions::default())
    }

    /// [`spawn_batch`](Self::spawn_batch) with per-call options.
    pub fn spawn_batch_with(
        &self,
        items: Vec<WorkItem<F::Engine>>,
        options: BatchOptions,
    ) -> Result<Vec<ItemHandle<<F::Engine as Engine>::Output>>> {
        let jobs = self.prepare_batch(items)?;
        Ok(self.spawn_handles(jobs, options))
    }

    /// Checks that every input file exists and lowers the items to jobs.
    fn prepare_batch(
        &self,
        items: Vec<WorkItem<F::Engine>>,
    ) -> Result<Vec<Job<F::Engine, <F::Engine as Engine>::Output>>> {
        self.ensure_open()?;

        let missing = items.iter().find_map(|item| match item {
            WorkItem::Input(path) if !path.is_file() => Some(path.clone()),
            _ => None,
        });
        if let Some(path) = missing {
            return Err(PoolError::MissingInput(path));
        }

        let clear = self.shared.config.clear_at_start;
        Ok(items.into_iter().map(|item| item.into_job(clear)).collect())
    }

    /// Applies `f(engine, arg)` to every argument and returns results in
    /// argument order.
    ///
    /// # Errors
    ///
    /// Same as [`run_batch`](Self::run_batch), minus the input file check.
    pub async fn map<A, I, T, Func>(
        &self,
        f: Func,
        args: I,
    ) -> Result<Vec<ItemResult<T>>, BatchError<T>>
    where
        Func: for<'a> Fn(&'a mut F::Engine, A) -> BoxFuture<'a, Result<T, EngineError>>
            + Send
            + Sync
            + 'static,
        I: IntoIterator<Item = A>,
        A: Clone + Send + Sync + 'static,
        T: Send + 'static,
    {
        self.map_with(f, args, BatchOptions::default()).await
    }

    /// [`map`](Self::map) with per-call options.
    pub async fn map_with<A, I, T, Func>(
        &self,
        f: Func,
        args: I,
        options: BatchOptions,
    ) -> Result<Vec<ItemResult<T>>, BatchError<T>>
    where
        Func: for<'a> Fn(&'a mut F::Engine, A) -> BoxFuture<'a, Result<T, EngineError>>
            + Send
            + Sync
            + 'static,
        I: IntoIterator<Item = A>,
        A: Clone + Send + Sync + 'static,
        T: Send + 'static,
    {
        self.ensure_open()?;
        self.collect(bind(f, args), options).await
    }

    /// Submits every argument without waiting. The returned handles are in
    /// argument order and each resolves to that item's result.
    ///
    /// The batch runs in the background; it keeps running if the handles are
    /// dropped, and resolves to [`ItemError::Cancelled`] if the pool shuts
    /// down first.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Closed`] if the pool has shut down.
    pub fn spawn_map<A, I, T, Func>(&self, f: Func, args: I) -> Result<Vec<ItemHandle<T>>>
    where
        Func: for<'a> Fn(&'a mut F::Engine, A) -> BoxFuture<'a, Result<T, EngineError>>
            + Send
            + Sync
            + 'static,
        I: IntoIterator<Item = A>,
        A: Clone + Send + Sync + 'static,
        T: Send + 'static,
    {
        self.spawn_map_with(f, args, BatchOptions::default())
    }

    /// [`spawn_map`](Self::spawn_map) with per-call options.
    pub fn spawn_map_with<A, I, T, Func>(
        &self,
        f: Func,
        args: I,
        options: BatchOptions,
    ) -> Result<Vec<ItemHandle<T>>>
    where
        Func: for<'a> Fn(&'a mut F::Engine, A) -> BoxFuture<'a, Result<T, EngineError>>
            + Send
            + Sync
            + 'static,
        I: IntoIterator<Item = A>,
        A: Clone + Send + Sync + 'static,
        T: Send + 'static,
    {
        self.ensure_open()?;
        Ok(self.spawn_handles(bind(f, args), options))
    }

    fn spawn_handles<T: Send + 'static>(
        &self,
        jobs: Vec<Job<F::Engine, T>>,
        options: BatchOptions,
    ) -> Vec<ItemHandle<T>> {
        let (mut senders, handles): (Vec<_>, Vec<_>) = (0..jobs.len())
            .map(|index| {
                let (tx, rx) = oneshot::channel();
                (Some(tx), ItemHandle::new(index, rx))
            })
            .unzip();

        self.spawn_dispatch(jobs, options, move |index, result| {
            if let Some(tx) = senders[index].take() {
                let _ = tx.send(result);
            }
        });

        handles
    }

    /// Submits every argument and streams `(index, result)` pairs in
    /// completion order.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Closed`] if the pool has shut down.
    pub fn map_unordered<A, I, T, Func>(
        &self,
        f: Func,
        args: I,
    ) -> Result<UnboundedReceiverStream<(usize, ItemResult<T>)>>
    where
        Func: for<'a> Fn(&'a mut F::Engine, A) -> BoxFuture<'a, Result<T, EngineError>>
            + Send
            + Sync
            + 'static,
        I: IntoIterator<Item = A>,
        A: Clone + Send + Sync + 'static,
        T: Send + 'static,
    {
        self.map_unordered_with(f, args, BatchOptions::default())
    }

    /// [`map_unordered`](Self::map_unordered) with per-call options.
    pub fn map_unordered_with<A, I, T, Func>(
        &self,
        f: Func,
        args: I,
        options: BatchOptions,
    ) -> Result<UnboundedReceiverStream<(usize, ItemResult<T>)>>
    where
        Func: for<'a> Fn(&'a mut F::Engine, A) -> BoxFuture<'a, Result<T, EngineError>>
            + Send
            + Sync
            + 'static,
        I: IntoIterator<Item = A>,
        A: Clone + Send + Sync + 'static,
        T: Send + 'static,
    {
        self.ensure_open()?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.spawn_dispatch(bind(f, args), options, move |index, result| {
            let _ = tx.send((index, result));
        });

        Ok(UnboundedReceiverStream::new(rx))
    }

    fn spawn_dispatch<T, D>(&self, jobs: Vec<Job<F::Engine, T>>, options: BatchOptions, deliver: D)
    where
        T: Send + 'static,
        D: FnMut(usize, ItemResult<T>) + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        self.shared.tracker.spawn(async move {
            let outcome = dispatch(&shared, jobs, &options, deliver).await;
            if let Err(e) = outcome {
                tracing::warn!("background batch stopped early: {e}");
            }
            if options.close_when_finished {
                // Not tracked: shutdown waits for this task to finish.
                tokio::spawn(async move {
                    shutdown(&shared).await;
                });
            }
        });
    }

    async fn collect<T: Send + 'static>(
        &self,
        jobs: Vec<Job<F::Engine, T>>,
        options: BatchOptions,
    ) -> Result<Vec<ItemResult<T>>, BatchError<T>> {
        let mut results: Vec<Option<ItemResult<T>>> = (0..jobs.len()).map(|_| None).collect();

        let outcome = dispatch(&self.shared, jobs, &options, |index, result| {
            results[index] = Some(result);
        })
        .await;

        let results = results
            .into_iter()
            .enumerate()
            .map(|(index, result)| result.unwrap_or(Err(ItemError::Cancelled { index })))
            .collect();

        if options.close_when_finished {
            self.exit().await;
        }

        match outcome {
            Ok(()) => Ok(results),
            Err(source) => Err(BatchError { source, results }),
        }
    }

    /// Runs `f` once on every slot that still has an engine (or is getting
    /// one back). Results are `(slot index, result)` in slot order.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Closed`] if the pool has shut down, or
    /// [`PoolError::Exhausted`] if no slot has capacity left.
    pub async fn broadcast<T, Func>(&self, f: Func) -> Result<Vec<(usize, ItemResult<T>)>>
    where
        Func: for<'a> Fn(&'a mut F::Engine) -> BoxFuture<'a, Result<T, EngineError>>
            + Send
            + Sync
            + 'static,
        T: Send + 'static,
    {
        self.ensure_open()?;

        let targets: Vec<usize> = self
            .shared
            .slots
            .iter()
            .filter(|slot| slot.state().has_capacity())
            .map(Slot::index)
            .collect();
        if targets.is_empty() {
            return Err(PoolError::Exhausted);
        }

        let call = job(f);
        let runs = targets.into_iter().map(|index| {
            let call = Arc::clone(&call);
            async move {
                let result = self
                    .run_job(Some(index), call)
                    .await
                    .map(|(_, value)| value)
                    .map_err(|e| into_item_error(e, index));
                (index, result)
            }
        });

        Ok(join_all(runs).await)
    }

    /// Runs `f` on whichever engine currently occupies slot `index`, waiting
    /// for it to become idle. A crash is retried on the slot's replacement
    /// up to `item_retries` times.
    ///
    /// # Errors
    ///
    /// - [`PoolError::SlotUnavailable`] if the slot does not exist or is
    ///   permanently dead.
    /// - [`PoolError::Closed`] if the pool shuts down first.
    /// - [`PoolError::Item`] if the call itself failed. The error's index is
    ///   the slot index.
    pub async fn run_on<T, Func>(&self, index: usize, f: Func) -> Result<T>
    where
        Func: for<'a> Fn(&'a mut F::Engine) -> BoxFuture<'a, Result<T, EngineError>>
            + Send
            + Sync
            + 'static,
        T: Send + 'static,
    {
        self.ensure_open()?;
        let (_, value) = self.run_job(Some(index), job(f)).await?;
        Ok(value)
    }

    /// Runs `f` on the next worker to become idle, least recently used
    /// first. Returns the index of the slot that ran it alongside the result.
    /// A crash is retried on whichever worker frees up next, up to
    /// `item_retries` times.
    ///
    /// # Errors
    ///
    /// - [`PoolError::Exhausted`] if no worker can ever become idle again.
    /// - [`PoolError::Closed`] if the pool shuts down first.
    /// - [`PoolError::Item`] if the call itself failed. The error's index is
    ///   the slot that ran the last attempt.
    pub async fn run_on_next<T, Func>(&self, f: Func) -> Result<(usize, T)>
    where
        Func: for<'a> Fn(&'a mut F::Engine) -> BoxFuture<'a, Result<T, EngineError>>
            + Send
            + Sync
            + 'static,
        T: Send + 'static,
    {
        self.ensure_open()?;
        self.run_job(None, job(f)).await
    }

    /// Runs one call to completion on slot `target`, or on any idle slot.
    async fn run_job<T: Send + 'static>(
        &self,
        target: Option<usize>,
        call: Job<F::Engine, T>,
    ) -> Result<(usize, T)> {
        let retries = self.shared.config.item_retries;
        let item_timeout = self.shared.config.item_timeout;
        let mut attempts = 0_u32;

        loop {
            let lease = match target {
                Some(index) => self.shared.lease_slot(index).await?,
                None => self.shared.lease().await?,
            };
            let index = lease.slot;

            // Spawned so the engine finds its way back even if the caller
            // stops waiting.
            let task = worker::execute(
                Arc::clone(&self.shared),
                lease,
                Arc::clone(&call),
                item_timeout,
            );
            let outcome = self.shared.tracker.spawn(task).await.map_err(|e| {
                ItemError::Aborted {
                    index,
                    reason: e.to_string(),
                }
            })?;

            attempts += 1;
            let source = match outcome {
                Outcome::Done(value) => return Ok((index, value)),
                Outcome::Cancelled => return Err(PoolError::Closed),
                Outcome::Unavailable => {
                    attempts -= 1;
                    continue;
                }
                Outcome::Crashed(source) if attempts <= retries => {
                    tracing::debug!(slot = index, attempts, "worker lost mid-call, retrying: {source}");
                    continue;
                }
                Outcome::Crashed(source) | Outcome::Failed(source) => source,
            };

            telemetry::increment_items_failed();
            return Err(ItemError::Failed {
                index,
                attempts,
                source,
            }
            .into());
        }
    }

    /// Shuts the pool down and tears down every engine.
    ///
    /// Queued items are cancelled, running items are interrupted, and each
    /// engine gets `shutdown_grace` to terminate. Teardown failures are
    /// collected in the report, never raised. Calling `exit` again returns
    /// an empty report.
    pub async fn exit(&self) -> ExitReport {
        shutdown(&self.shared).await
    }

    /// Number of slots with a connected engine.
    pub fn len(&self) -> usize {
        self.shared.active()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots that are live, busy, or restarting.
    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    /// Configured number of slots.
    pub fn size(&self) -> usize {
        self.shared.slots.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn slots(&self) -> impl Iterator<Item = &Slot<F::Engine>> {
        self.shared.slots.iter()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }
}

/// Collects a map call's arguments into jobs that share one callable.
fn bind<E, A, I, T, Func>(f: Func, args: I) -> Vec<Job<E, T>>
where
    E: Engine,
    Func: for<'a> Fn(&'a mut E, A) -> BoxFuture<'a, Result<T, EngineError>> + Send + Sync + 'static,
    I: IntoIterator<Item = A>,
    A: Clone + Send + Sync + 'static,
    T: Send + 'static,
{
    let f = Arc::new(f);
    args.into_iter()
        .map(|arg| {
            let f = Arc::clone(&f);
            job(move |engine: &mut E| (*f)(engine, arg.clone()))
        })
        .collect()
}

fn into_item_error(err: PoolError, index: usize) -> ItemError {
    match err {
        PoolError::Item(e) => e,
        PoolError::Closed => ItemError::Cancelled { index },
        other => ItemError::Aborted {
            index,
            reason: other.to_string(),
        },
    }
}

async fn shutdown<F: EngineFactory>(shared: &Shared<F>) -> ExitReport {
    let Some(idle) = shared.close() else {
        return ExitReport::default();
    };
    tracing::debug!(idle = idle.len(), "shutting down worker pool");

    let retired = join_all(idle.into_iter().map(|(index, engine, run_dir)| async move {
        (index, shared.retire(index, engine, run_dir).await)
    }))
    .await;
    for (index, result) in retired {
        shared.record_teardown(Some(index), result);
    }

    // Interrupted items tear their own engines down, each bounded by the
    // grace period.
    shared.tracker.close();
    let grace = shared.config.shutdown_grace.saturating_mul(2);
    if timeout(grace, shared.tracker.wait()).await.is_err() {
        let stuck = shared.tracker.len();
        shared.record_teardown(
            None,
            Err(format!("{stuck} task(s) still running {grace:?} after shutdown")),
        );
    }
    shared.mark_all_closed();

    let report = core::mem::take(&mut *shared.teardown.lock());
    for failure in &report.failures {
        tracing::warn!("teardown failed: {failure}");
    }
    tracing::info!(
        terminated = report.terminated,
        failures = report.failures.len(),
        "worker pool closed"
    );
    report
}

impl<F: EngineFactory> Index<usize> for WorkerPool<F> {
    type Output = Slot<F::Engine>;

    fn index(&self, index: usize) -> &Self::Output {
        &self.shared.slots[index]
    }
}

impl<F: EngineFactory> fmt::Display for WorkerPool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Worker pool with {} active workers", self.len())
    }
}

impl<F: EngineFactory> fmt::Debug for WorkerPool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size())
            .field("active", &self.len())
            .field("closed", &self.is_closed())
            .field("slots", &self.shared.slots)
            .finish()
    }
}

impl<F: EngineFactory> Drop for WorkerPool<F> {
    fn drop(&mut self) {
        if let Some(idle) = self.shared.close() {
            tracing::debug!(
                idle = idle.len(),
                "worker pool dropped without exit, releasing engines"
            );
        }
    }
}
