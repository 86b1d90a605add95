use crate::{error::PoolError, item::Progress};
use core::{fmt, time::Duration};
use std::{path::PathBuf, sync::Arc};

/// Runtime configuration for a [`WorkerPool`](crate::WorkerPool).
///
/// Every field has a default suited to long-running external solver
/// processes: startup is slow, heartbeats are cheap, and a crashed engine is
/// worth restarting.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Number of slots. Fixed for the lifetime of the pool; must be at least 2.
    pub size: usize,

    /// Replace engines that die. When `false`, a dead slot stays dead and the
    /// pool continues with reduced capacity.
    pub restart_on_failure: bool,

    /// How many times an item is retried after its worker crashed under it.
    /// Execution errors reported by a live engine are never retried.
    pub item_retries: u32,

    /// Connection attempts per (re)start of a slot before giving up on it.
    pub restart_attempts: u32,

    /// Upper bound on a single `connect` call.
    pub startup_timeout: Duration,

    /// Upper bound on a single item. An item that overruns kills its worker.
    pub item_timeout: Option<Duration>,

    /// Period of the background liveness sweep over idle workers. `None`
    /// disables the sweep; dead engines are then only found at dispatch.
    pub heartbeat_interval: Option<Duration>,

    /// Upper bound on a single `is_alive` probe.
    pub ping_timeout: Duration,

    /// Grace period given to each engine's `terminate` during teardown.
    pub shutdown_grace: Duration,

    /// Call [`Engine::reset`](crate::Engine::reset) before running each
    /// input file.
    pub clear_at_start: bool,

    /// Reserve a distinct free local port for every engine, scanning upward
    /// from this value.
    pub starting_port: Option<u16>,

    /// Root under which every engine gets a private working directory.
    pub run_location: Option<PathBuf>,

    /// Delete an engine's working directory once it has been torn down.
    pub remove_run_dirs: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 2,
            restart_on_failure: true,
            item_retries: 1,
            restart_attempts: 3,
            startup_timeout: Duration::from_secs(30),
            item_timeout: None,
            heartbeat_interval: Some(Duration::from_secs(1)),
            ping_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
            clear_at_start: true,
            starting_port: None,
            run_location: None,
            remove_run_dirs: true,
        }
    }
}

impl PoolConfig {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            ..Self::default()
        }
    }

    /// Checks the configuration before any worker is started.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConfig`] if the pool is smaller than two
    /// workers, or if any timeout or interval is zero.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.size < 2 {
            return Err(PoolError::InvalidConfig(format!(
                "a pool needs at least 2 workers, got {}",
                self.size
            )));
        }
        if self.restart_attempts == 0 {
            return Err(PoolError::InvalidConfig(
                "restart_attempts must be greater than 0".to_string(),
            ));
        }

        let timeouts = [
            ("startup_timeout", Some(self.startup_timeout)),
            ("item_timeout", self.item_timeout),
            ("heartbeat_interval", self.heartbeat_interval),
            ("ping_timeout", Some(self.ping_timeout)),
            ("shutdown_grace", Some(self.shutdown_grace)),
        ];
        for (name, value) in timeouts {
            if value.is_some_and(|d| d.is_zero()) {
                return Err(PoolError::InvalidConfig(format!("{name} must be non-zero")));
            }
        }

        Ok(())
    }
}

/// Callback invoked after every finished item of a batch.
pub type ProgressFn = Arc<dyn Fn(Progress) + Send + Sync>;

/// Per-call overrides for a batch.
#[derive(Clone, Default)]
pub struct BatchOptions {
    /// Overrides [`PoolConfig::item_retries`]. `Some(0)` opts out of retry.
    pub retries: Option<u32>,
    /// Overrides [`PoolConfig::item_timeout`].
    pub item_timeout: Option<Duration>,
    /// Shut the pool down once the batch has finished.
    pub close_when_finished: bool,
    pub progress: Option<ProgressFn>,
}

impl BatchOptions {
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_item_timeout(mut self, timeout: Duration) -> Self {
        self.item_timeout = Some(timeout);
        self
    }

    pub fn close_when_finished(mut self) -> Self {
        self.close_when_finished = true;
        self
    }

    pub fn on_progress(mut self, f: impl Fn(Progress) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for BatchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchOptions")
            .field("retries", &self.retries)
            .field("item_timeout", &self.item_timeout)
            .field("close_when_finished", &self.close_when_finished)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}
