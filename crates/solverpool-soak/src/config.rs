use crate::engine::Profile;
use anyhow::{Context, bail};
use clap::Parser;
use solverpool::PoolConfig;
use std::{path::PathBuf, time::Duration};

#[derive(Parser, Debug)]
#[command(
    name = "solverpool-soak",
    version,
    about = "Soak-test a self-healing solver pool against simulated, crash-prone engines",
    after_help = "EXAMPLES:\n    \
        solverpool-soak --workers 8 --cases 2000 --crash-rate 0.05\n    \
        solverpool-soak --no-restart --crash-rate 0.2 --retries 0\n    \
        solverpool-soak --inputs decks/a.inp,decks/b.inp --run-location /tmp/runs"
)]
pub struct CliArgs {
    /// Number of engines kept alive by the pool.
    #[arg(short, long, env = "SOAK_WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Synthetic cases per round. Ignored when `--inputs` is given.
    #[arg(short, long, env = "SOAK_CASES", default_value_t = 256)]
    pub cases: u64,

    /// Batches to run back to back on the same pool.
    #[arg(short, long, env = "SOAK_ROUNDS", default_value_t = 1)]
    pub rounds: u32,

    /// Input decks to submit instead of synthetic cases.
    #[arg(long, env = "SOAK_INPUTS", value_delimiter = ',', value_name = "FILE")]
    pub inputs: Vec<PathBuf>,

    /// Probability that an engine dies while solving.
    #[arg(long, env = "SOAK_CRASH_RATE", default_value_t = 0.02)]
    pub crash_rate: f64,

    /// Probability that an engine rejects a case and stays alive.
    #[arg(long, env = "SOAK_ERROR_RATE", default_value_t = 0.01)]
    pub error_rate: f64,

    /// Probability that starting an engine fails.
    #[arg(long, env = "SOAK_STARTUP_FAILURE_RATE", default_value_t = 0.0)]
    pub startup_failure_rate: f64,

    #[arg(long, env = "SOAK_STARTUP_MS", default_value_t = 50)]
    pub startup_ms: u64,

    #[arg(long, env = "SOAK_MIN_SOLVE_MS", default_value_t = 5)]
    pub min_solve_ms: u64,

    #[arg(long, env = "SOAK_MAX_SOLVE_MS", default_value_t = 100)]
    pub max_solve_ms: u64,

    /// Retries granted to an item whose engine died under it.
    #[arg(long, env = "SOAK_RETRIES", default_value_t = 1)]
    pub retries: u32,

    /// Start attempts per engine (re)start.
    #[arg(long, env = "SOAK_RESTART_ATTEMPTS", default_value_t = 3)]
    pub restart_attempts: u32,

    /// Leave dead engines dead instead of replacing them.
    #[arg(long, env = "SOAK_NO_RESTART")]
    pub no_restart: bool,

    /// Per-item deadline. An item that overruns kills its engine.
    #[arg(long, env = "SOAK_ITEM_TIMEOUT_MS")]
    pub item_timeout_ms: Option<u64>,

    /// Heartbeat period over idle engines; 0 disables the heartbeat.
    #[arg(long, env = "SOAK_HEARTBEAT_MS", default_value_t = 1000)]
    pub heartbeat_ms: u64,

    #[arg(long, env = "SOAK_SHUTDOWN_GRACE_MS", default_value_t = 5000)]
    pub shutdown_grace_ms: u64,

    /// Reserve a local port per engine, scanning up from this value.
    #[arg(long, env = "SOAK_PORTS", num_args = 0..=1, default_missing_value = "50052")]
    pub starting_port: Option<u16>,

    /// Give every engine a private working directory under this root.
    #[arg(long, env = "SOAK_RUN_LOCATION", value_name = "DIR")]
    pub run_location: Option<PathBuf>,

    /// Keep engine working directories after teardown.
    #[arg(long, env = "SOAK_KEEP_RUN_DIRS")]
    pub keep_run_dirs: bool,

    /// Disable the progress bar.
    #[arg(short, long, env = "SOAK_QUIET")]
    pub quiet: bool,
}

#[derive(Clone, Debug)]
pub struct SoakConfig {
    pub pool: PoolConfig,
    pub profile: Profile,
    pub cases: u64,
    pub rounds: u32,
    pub inputs: Vec<PathBuf>,
    pub show_progress: bool,
}

impl SoakConfig {
    /// Items submitted per round.
    pub fn round_size(&self) -> u64 {
        if self.inputs.is_empty() {
            self.cases
        } else {
            self.inputs.len() as u64
        }
    }
}

fn probability(name: &str, value: f64) -> anyhow::Result<f64> {
    if !(0.0..=1.0).contains(&value) {
        bail!("{name} must be between 0 and 1, got {value}");
    }
    Ok(value)
}

impl TryFrom<CliArgs> for SoakConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.rounds == 0 {
            bail!("rounds must be at least 1");
        }
        if args.inputs.is_empty() && args.cases == 0 {
            bail!("nothing to run: pass --cases > 0 or --inputs");
        }
        if args.min_solve_ms > args.max_solve_ms {
            bail!(
                "min-solve-ms ({}) is larger than max-solve-ms ({})",
                args.min_solve_ms,
                args.max_solve_ms
            );
        }

        let profile = Profile {
            crash_rate: probability("crash-rate", args.crash_rate)?,
            error_rate: probability("error-rate", args.error_rate)?,
            startup_failure_rate: probability("startup-failure-rate", args.startup_failure_rate)?,
            startup: Duration::from_millis(args.startup_ms),
            min_solve: Duration::from_millis(args.min_solve_ms),
            max_solve: Duration::from_millis(args.max_solve_ms),
        };

        let pool = PoolConfig {
            size: args.workers,
            restart_on_failure: !args.no_restart,
            item_retries: args.retries,
            restart_attempts: args.restart_attempts,
            item_timeout: args.item_timeout_ms.map(Duration::from_millis),
            heartbeat_interval: (args.heartbeat_ms > 0).then(|| Duration::from_millis(args.heartbeat_ms)),
            shutdown_grace: Duration::from_millis(args.shutdown_grace_ms),
            starting_port: args.starting_port,
            run_location: args.run_location,
            remove_run_dirs: !args.keep_run_dirs,
            ..PoolConfig::default()
        };
        pool.validate().context("invalid pool settings")?;

        Ok(Self {
            pool,
            profile,
            cases: args.cases,
            rounds: args.rounds,
            inputs: args.inputs,
            show_progress: !args.quiet,
        })
    }
}
