use crate::{
    BatchOptions, EngineError, ItemError, PoolConfig, PoolError, Progress, SlotState, WorkItem,
    WorkerPool,
    test_support::{FakeEngine, FakeFactory, FakeState, SLOW_RESTART, reverse},
};
use futures::{StreamExt, future::join_all};
use parking_lot::Mutex;
use std::{
    collections::HashSet,
    path::PathBuf,
    sync::{Arc, atomic::Ordering},
    time::{Duration, Instant},
};

fn config(size: usize) -> PoolConfig {
    PoolConfig {
        heartbeat_interval: None,
        startup_timeout: Duration::from_secs(5),
        ping_timeout: Duration::from_secs(1),
        shutdown_grace: Duration::from_secs(1),
        ..PoolConfig::new(size)
    }
}

async fn start(state: &Arc<FakeState>, config: PoolConfig) -> WorkerPool<FakeFactory> {
    WorkerPool::new(FakeFactory::new(state), config)
        .await
        .unwrap()
}

fn jobs(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("job{i}")).collect()
}

fn reversed(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{i}boj")).collect()
}

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("solverpool-{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

async fn eventually(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn batch_results_follow_input_order() {
    let state = FakeState::new();
    let pool = start(&state, config(3)).await;

    let items = jobs(9)
        .into_iter()
        .map(|job| WorkItem::call(move |engine: &mut FakeEngine| engine.process(job.clone())))
        .collect();
    let results = pool.run_batch(items).await.unwrap();

    let results: Vec<String> = results.into_iter().map(Result::unwrap).collect();
    assert_eq!(results, reversed(9));
    assert_eq!(state.max_in_flight(), 3);

    let slots: HashSet<usize> = state.handled().iter().map(|(slot, _, _)| *slot).collect();
    assert_eq!(slots.len(), 3);

    assert!(pool.exit().await.is_clean());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn map_applies_function_per_argument() {
    let state = FakeState::new();
    let pool = start(&state, config(2)).await;

    let results = pool.map(reverse, jobs(5)).await.unwrap();
    assert_eq!(
        results.into_iter().collect::<Result<Vec<_>, _>>().unwrap(),
        reversed(5)
    );
    assert!(state.max_in_flight() <= 2);

    pool.exit().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn crashed_worker_is_replaced_and_item_retried() {
    let state = FakeState::new();
    state.crash_once("job4");
    let pool = start(&state, config(3)).await;

    let results = pool.map(reverse, jobs(9)).await.unwrap();
    assert_eq!(
        results.into_iter().collect::<Result<Vec<_>, _>>().unwrap(),
        reversed(9)
    );

    eventually(|| pool.slots().map(|slot| slot.generation()).sum::<u64>() == 1).await;
    let crashed = pool
        .slots()
        .position(|slot| slot.generation() == 1)
        .unwrap();
    eventually(|| pool[crashed].state() == SlotState::Live).await;
    assert_eq!(state.connects(), 4);

    // The slot handle now reaches the replacement engine.
    let identity = pool
        .run_on(crashed, |engine: &mut FakeEngine| engine.identity())
        .await
        .unwrap();
    assert_eq!(identity, (crashed, 1));

    pool.exit().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn without_restart_the_batch_finishes_on_fewer_workers() {
    let state = FakeState::new();
    state.crash_once("job2");
    let pool = start(
        &state,
        PoolConfig {
            restart_on_failure: false,
            ..config(3)
        },
    )
    .await;

    let results = pool.map(reverse, jobs(9)).await.unwrap();
    assert!(results.iter().all(Result::is_ok));

    assert_eq!(pool.capacity(), 2);
    assert_eq!(pool.len(), 2);
    let dead: Vec<usize> = pool
        .slots()
        .filter(|slot| slot.state() == SlotState::Dead)
        .map(|slot| slot.index())
        .collect();
    assert_eq!(dead.len(), 1);
    assert_eq!(state.connects(), 3);
    assert_eq!(pool.to_string(), "Worker pool with 2 active workers");

    pool.exit().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn losing_every_worker_exhausts_the_pool_but_keeps_results() {
    let state = FakeState::new();
    let pool = start(
        &state,
        PoolConfig {
            restart_on_failure: false,
            ..config(2)
        },
    )
    .await;

    let args = ["job0", "die1", "die2", "job3", "job4"].map(String::from);
    let err = pool
        .map_with(reverse, args, BatchOptions::default().with_retries(0))
        .await
        .unwrap_err();

    assert!(matches!(err.source, PoolError::Exhausted));
    assert_eq!(err.results.len(), 5);
    assert_eq!(err.completed(), 1);
    assert_eq!(err.results[0], Ok("0boj".to_string()));
    assert!(matches!(
        err.results[1],
        Err(ItemError::Failed { index: 1, attempts: 1, .. })
    ));
    assert!(matches!(err.results[3], Err(ItemError::Aborted { index: 3, .. })));
    assert!(matches!(err.results[4], Err(ItemError::Aborted { index: 4, .. })));
    assert_eq!(pool.capacity(), 0);

    pool.exit().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exit_is_idempotent_and_closes_the_pool() {
    let state = FakeState::new();
    let pool = start(&state, config(3)).await;

    let report = pool.exit().await;
    assert_eq!(report.terminated, 3);
    assert!(report.is_clean());
    assert_eq!(state.terminated.load(Ordering::SeqCst), 3);

    let again = pool.exit().await;
    assert_eq!(again.terminated, 0);
    assert!(again.is_clean());

    assert!(pool.is_closed());
    assert!(pool.is_empty());
    assert!(pool.slots().all(|slot| slot.state() == SlotState::Closed));

    let err = pool.run_batch(Vec::new()).await.unwrap_err();
    assert!(matches!(err.source, PoolError::Closed));
    assert!(matches!(
        pool.spawn_map(reverse, jobs(1)),
        Err(PoolError::Closed)
    ));
    assert!(matches!(
        pool.run_on(0, |engine: &mut FakeEngine| engine.identity()).await,
        Err(PoolError::Closed)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_start_tears_down_the_workers_that_did_start() {
    let state = FakeState::new();
    state.refuse_slot(1);

    let err = WorkerPool::new(
        FakeFactory::new(&state),
        PoolConfig {
            restart_attempts: 2,
            ..config(3)
        },
    )
    .await
    .unwrap_err();

    assert!(matches!(
        err,
        PoolError::Initialization {
            slot: 1,
            source: EngineError::Launch(_)
        }
    ));
    assert_eq!(state.connects(), 4);
    assert_eq!(state.terminated.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn invalid_config_is_rejected_before_any_connect() {
    let state = FakeState::new();
    let err = WorkerPool::new(FakeFactory::new(&state), config(1))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::InvalidConfig(_)));
    assert_eq!(state.connects(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn execution_errors_fail_only_their_item() {
    let state = FakeState::new();
    let pool = start(&state, config(2)).await;

    let args = ["job0", "bad1", "job2"].map(String::from);
    let results = pool.map(reverse, args).await.unwrap();

    assert_eq!(results[0], Ok("0boj".to_string()));
    assert!(matches!(
        &results[1],
        Err(ItemError::Failed {
            index: 1,
            attempts: 1,
            source: EngineError::Execution(_)
        })
    ));
    assert_eq!(results[2], Ok("2boj".to_string()));

    // The engine that rejected the job is still in service.
    assert!(pool.slots().all(|slot| slot.generation() == 0));
    assert_eq!(state.connects(), 2);

    pool.exit().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn crash_retries_are_bounded() {
    let state = FakeState::new();
    let pool = start(&state, config(2)).await;

    let args = ["job0", "die-always", "job2"].map(String::from);
    let results = pool.map(reverse, args).await.unwrap();

    assert_eq!(results[0], Ok("0boj".to_string()));
    assert!(matches!(
        &results[1],
        Err(ItemError::Failed {
            index: 1,
            attempts: 2,
            source: EngineError::Connection(_)
        })
    ));
    assert_eq!(results[2], Ok("2boj".to_string()));

    pool.exit().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn item_timeout_kills_the_worker_and_counts_as_an_attempt() {
    let state = FakeState::new();
    let pool = start(&state, config(2)).await;

    let limit = Duration::from_millis(100);
    let args = ["slow0", "job1"].map(String::from);
    let results = pool
        .map_with(reverse, args, BatchOptions::default().with_item_timeout(limit))
        .await
        .unwrap();

    assert_eq!(
        results[0],
        Err(ItemError::Failed {
            index: 0,
            attempts: 2,
            source: EngineError::Timeout(limit)
        })
    );
    assert_eq!(results[1], Ok("1boj".to_string()));
    eventually(|| pool.slots().map(|slot| slot.generation()).sum::<u64>() == 2).await;

    pool.exit().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dead_idle_worker_is_skipped_without_charging_the_item() {
    let state = FakeState::new();
    let pool = start(&state, config(2)).await;
    state.kill(0, 0);

    let results = pool
        .map_with(reverse, jobs(3), BatchOptions::default().with_retries(0))
        .await
        .unwrap();
    assert_eq!(
        results.into_iter().collect::<Result<Vec<_>, _>>().unwrap(),
        reversed(3)
    );
    eventually(|| pool[0].generation() == 1 && pool[0].state() == SlotState::Live).await;

    pool.exit().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn heartbeat_replaces_idle_workers_that_died() {
    let state = FakeState::new();
    let pool = start(
        &state,
        PoolConfig {
            heartbeat_interval: Some(Duration::from_millis(50)),
            ..config(2)
        },
    )
    .await;

    state.kill(1, 0);
    eventually(|| pool[1].generation() == 1 && pool[1].state() == SlotState::Live).await;
    assert_eq!(pool[0].generation(), 0);

    let identity = pool
        .run_on(1, |engine: &mut FakeEngine| engine.identity())
        .await
        .unwrap();
    assert_eq!(identity, (1, 1));

    pool.exit().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn spawn_map_returns_handles_in_input_order() {
    let state = FakeState::new();
    let pool = start(&state, config(3)).await;

    let handles = pool.spawn_map(reverse, jobs(7)).unwrap();
    assert_eq!(
        handles.iter().map(|h| h.index()).collect::<Vec<_>>(),
        (0..7).collect::<Vec<_>>()
    );

    let results = join_all(handles).await;
    assert_eq!(
        results.into_iter().collect::<Result<Vec<_>, _>>().unwrap(),
        reversed(7)
    );

    pool.exit().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn map_unordered_streams_every_result() {
    let state = FakeState::new();
    let pool = start(&state, config(3)).await;

    let mut results: Vec<(usize, String)> = pool
        .map_unordered(reverse, jobs(6))
        .unwrap()
        .map(|(index, result)| (index, result.unwrap()))
        .collect()
        .await;
    results.sort();

    let expected: Vec<(usize, String)> = reversed(6).into_iter().enumerate().collect();
    assert_eq!(results, expected);

    pool.exit().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn broadcast_reaches_every_slot() {
    let state = FakeState::new();
    let pool = start(&state, config(3)).await;

    let results = pool
        .broadcast(|engine: &mut FakeEngine| engine.identity())
        .await
        .unwrap();
    assert_eq!(
        results,
        vec![(0, Ok((0, 0))), (1, Ok((1, 0))), (2, Ok((2, 0)))]
    );

    pool.exit().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn run_on_rejects_unknown_slots() {
    let state = FakeState::new();
    let pool = start(&state, config(2)).await;

    let err = pool
        .run_on(5, |engine: &mut FakeEngine| engine.identity())
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::SlotUnavailable(5)));

    pool.exit().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn input_files_are_checked_and_reset_before_running() {
    let dir = scratch_dir("inputs");
    std::fs::create_dir_all(&dir).unwrap();
    let paths: Vec<PathBuf> = (0..3)
        .map(|i| {
            let path = dir.join(format!("input{i}.inp"));
            std::fs::write(&path, format!("deck{i}\n")).unwrap();
            path
        })
        .collect();

    let state = FakeState::new();
    let pool = start(&state, config(2)).await;

    let missing = dir.join("missing.inp");
    let err = pool
        .run_batch(vec![WorkItem::input(&paths[0]), WorkItem::input(&missing)])
        .await
        .unwrap_err();
    assert!(matches!(err.source, PoolError::MissingInput(ref path) if *path == missing));
    assert_eq!(state.resets.load(Ordering::SeqCst), 0);

    let items = paths.iter().map(WorkItem::input).collect();
    let results = pool.run_batch(items).await.unwrap();
    assert_eq!(
        results.into_iter().collect::<Result<Vec<_>, _>>().unwrap(),
        vec!["0kced", "1kced", "2kced"]
    );
    assert_eq!(state.resets.load(Ordering::SeqCst), 3);

    pool.exit().await;
    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn run_directories_follow_the_engine_lifecycle() {
    let root = scratch_dir("runs");
    let state = FakeState::new();
    let pool = start(
        &state,
        PoolConfig {
            run_location: Some(root.clone()),
            ..config(2)
        },
    )
    .await;

    for slot in pool.slots() {
        let dir = slot.run_dir().unwrap();
        assert_eq!(dir, root.join(format!("slot_{}_0", slot.index())));
        assert!(dir.is_dir());
    }

    pool.exit().await;
    assert!(!root.join("slot_0_0").exists());
    assert!(!root.join("slot_1_0").exists());
    std::fs::remove_dir_all(&root).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ports_are_distinct_per_slot() {
    let state = FakeState::new();
    let pool = start(
        &state,
        PoolConfig {
            starting_port: Some(41_000),
            ..config(3)
        },
    )
    .await;

    let ports: Vec<u16> = pool.slots().filter_map(|slot| slot.port()).collect();
    assert_eq!(ports.len(), 3);
    assert!(ports.windows(2).all(|pair| pair[0] < pair[1]));
    assert!(ports[0] >= 41_000);

    // Each engine was started on the port its slot reports.
    let reported = pool
        .broadcast(|engine: &mut FakeEngine| engine.port_of())
        .await
        .unwrap();
    for (index, port) in reported {
        assert_eq!(port.unwrap(), pool[index].port());
    }

    pool.exit().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn teardown_failures_are_reported_not_raised() {
    let state = FakeState::new();
    let pool = start(&state, config(3)).await;
    state.fail_terminate.store(true, Ordering::SeqCst);

    let report = pool.exit().await;
    assert_eq!(report.terminated, 0);
    assert_eq!(report.failures.len(), 3);
    assert!(!report.is_clean());

    let mut slots: Vec<Option<usize>> = report.failures.iter().map(|f| f.slot).collect();
    slots.sort();
    assert_eq!(slots, vec![Some(0), Some(1), Some(2)]);
    assert!(pool.slots().all(|slot| slot.state() == SlotState::Closed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exit_cancels_running_and_queued_items() {
    let state = FakeState::new();
    let pool = start(&state, config(3)).await;

    let args: Vec<String> = (0..6).map(|i| format!("slow{i}")).collect();
    let handles = pool.spawn_map(reverse, args).unwrap();
    eventually(|| pool.slots().all(|slot| slot.state() == SlotState::Busy)).await;

    let started = Instant::now();
    let report = pool.exit().await;
    assert!(started.elapsed() < crate::test_support::SLOW);
    assert_eq!(report.terminated, 3);

    for (index, result) in join_all(handles).await.into_iter().enumerate() {
        assert_eq!(result, Err(ItemError::Cancelled { index }));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn progress_is_reported_after_every_item() {
    let state = FakeState::new();
    let pool = start(&state, config(2)).await;

    let seen = Arc::new(Mutex::new(Vec::<Progress>::new()));
    let sink = Arc::clone(&seen);
    let options = BatchOptions::default().on_progress(move |p| sink.lock().push(p));

    let args = ["job0", "bad1", "job2", "job3"].map(String::from);
    pool.map_with(reverse, args, options).await.unwrap();

    let seen = seen.lock();
    assert_eq!(seen.len(), 4);
    assert!(seen.windows(2).all(|w| w[0].finished < w[1].finished));
    let last = seen[3];
    assert_eq!((last.total, last.finished, last.failed, last.running), (4, 4, 1, 0));

    pool.exit().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn close_when_finished_exits_after_the_batch() {
    let state = FakeState::new();
    let pool = start(&state, config(2)).await;

    let results = pool
        .map_with(reverse, jobs(3), BatchOptions::default().close_when_finished())
        .await
        .unwrap();
    assert_eq!(results.len(), 3);
    assert!(pool.is_closed());
    assert_eq!(state.terminated.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn engines_dead_on_arrival_exhaust_the_pool() {
    let state = FakeState::new();
    let pool = start(
        &state,
        PoolConfig {
            restart_attempts: 2,
            ..config(2)
        },
    )
    .await;
    state.dead_from_generation(1);
    state.kill(0, 0);
    state.kill(1, 0);

    let err = tokio::time::timeout(Duration::from_secs(5), pool.map(reverse, jobs(4)))
        .await
        .expect("batch should stop once no worker can start")
        .unwrap_err();

    assert!(matches!(err.source, PoolError::Exhausted));
    assert_eq!(err.completed(), 0);
    for (i, result) in err.results.iter().enumerate() {
        assert!(matches!(result, Err(ItemError::Aborted { index, .. }) if *index == i));
    }
    assert_eq!(pool.capacity(), 0);
    assert!(pool.slots().all(|slot| slot.state() == SlotState::Dead));
    // Two initial engines plus two start attempts per slot.
    assert_eq!(state.connects(), 6);

    pool.exit().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn workers_that_keep_dying_while_idle_are_given_up() {
    let state = FakeState::new();
    // Enough pings to pass the start check, then dead by dispatch.
    state.die_after_pings(1);
    let pool = start(
        &state,
        PoolConfig {
            restart_attempts: 2,
            ..config(2)
        },
    )
    .await;

    let err = tokio::time::timeout(Duration::from_secs(5), pool.map(reverse, jobs(3)))
        .await
        .expect("batch should stop once every slot gives up")
        .unwrap_err();

    assert!(matches!(err.source, PoolError::Exhausted));
    assert!(pool.slots().all(|slot| slot.state() == SlotState::Dead));
    assert!(pool.slots().all(|slot| slot.generation() == 1));
    assert_eq!(state.connects(), 4);

    pool.exit().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_restarts_shrink_capacity_until_the_pool_is_exhausted() {
    let state = FakeState::new();
    state.refuse_restarts.store(true, Ordering::SeqCst);
    let pool = start(
        &state,
        PoolConfig {
            restart_attempts: 2,
            ..config(2)
        },
    )
    .await;
    let no_retry = || BatchOptions::default().with_retries(0);

    let results = pool
        .map_with(reverse, ["die0".to_string()], no_retry())
        .await
        .unwrap();
    assert!(matches!(
        results[0],
        Err(ItemError::Failed { index: 0, attempts: 1, .. })
    ));

    eventually(|| pool.capacity() == 1).await;
    let dead = pool
        .slots()
        .filter(|slot| slot.state() == SlotState::Dead)
        .count();
    assert_eq!(dead, 1);
    assert_eq!(state.connects(), 4);

    let args = ["die1", "job2", "job3"].map(String::from);
    let err = pool.map_with(reverse, args, no_retry()).await.unwrap_err();
    assert!(matches!(err.source, PoolError::Exhausted));
    assert!(matches!(err.results[0], Err(ItemError::Failed { index: 0, .. })));
    assert!(matches!(err.results[1], Err(ItemError::Aborted { index: 1, .. })));
    assert!(matches!(err.results[2], Err(ItemError::Aborted { index: 2, .. })));
    assert_eq!(pool.capacity(), 0);

    pool.exit().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hung_terminate_is_cut_off_after_the_grace_period() {
    let state = FakeState::new();
    let grace = Duration::from_millis(200);
    let pool = start(
        &state,
        PoolConfig {
            shutdown_grace: grace,
            ..config(2)
        },
    )
    .await;
    state.hang_terminate.store(true, Ordering::SeqCst);

    let started = Instant::now();
    let report = pool.exit().await;
    assert!(started.elapsed() < grace * 5);

    assert_eq!(report.terminated, 0);
    assert_eq!(report.failures.len(), 2);
    for failure in &report.failures {
        assert!(failure.slot.is_some());
        assert!(failure.reason.contains("did not finish"), "{failure}");
    }
    assert!(pool.slots().all(|slot| slot.state() == SlotState::Closed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restarting_slot_keeps_counting_toward_capacity() {
    let state = FakeState::new();
    state.slow_restarts.store(true, Ordering::SeqCst);
    let pool = start(&state, config(2)).await;

    let results = pool
        .map_with(
            reverse,
            ["die0".to_string()],
            BatchOptions::default().with_retries(0),
        )
        .await
        .unwrap();
    assert!(results[0].is_err());

    // The replacement is still connecting.
    assert_eq!(pool[0].state(), SlotState::Starting);
    assert_eq!(pool.capacity(), 2);
    assert_eq!(pool.len(), 1);

    let started = Instant::now();
    eventually(|| pool[0].state() == SlotState::Live).await;
    assert!(started.elapsed() <= SLOW_RESTART + Duration::from_secs(1));
    assert_eq!(pool[0].generation(), 1);

    pool.exit().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn spawn_batch_returns_handles_for_input_files() {
    let dir = scratch_dir("spawned");
    std::fs::create_dir_all(&dir).unwrap();
    let paths: Vec<PathBuf> = (0..4)
        .map(|i| {
            let path = dir.join(format!("input{i}.inp"));
            std::fs::write(&path, format!("deck{i}\n")).unwrap();
            path
        })
        .collect();

    let state = FakeState::new();
    let pool = start(&state, config(2)).await;

    let err = pool
        .spawn_batch(vec![WorkItem::input(dir.join("missing.inp"))])
        .unwrap_err();
    assert!(matches!(err, PoolError::MissingInput(_)));

    let handles = pool
        .spawn_batch(paths.iter().map(WorkItem::input).collect())
        .unwrap();
    assert_eq!(
        handles.iter().map(|h| h.index()).collect::<Vec<_>>(),
        vec![0, 1, 2, 3]
    );

    let results = join_all(handles).await;
    assert_eq!(
        results.into_iter().collect::<Result<Vec<_>, _>>().unwrap(),
        vec!["0kced", "1kced", "2kced", "3kced"]
    );
    assert_eq!(state.resets.load(Ordering::SeqCst), 4);

    pool.exit().await;
    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn run_on_next_uses_the_least_recently_used_worker() {
    let state = FakeState::new();
    state.crash_once("once");
    let pool = start(&state, config(3)).await;

    let (slot, identity) = pool
        .run_on_next(|engine: &mut FakeEngine| engine.identity())
        .await
        .unwrap();
    assert_eq!((slot, identity), (0, (0, 0)));

    let (slot, _) = pool
        .run_on_next(|engine: &mut FakeEngine| engine.identity())
        .await
        .unwrap();
    assert_eq!(slot, 1);

    // Slot 2 is next and crashes; the retry goes to slot 0.
    let (slot, reversed) = pool
        .run_on_next(|engine: &mut FakeEngine| engine.process("once".to_string()))
        .await
        .unwrap();
    assert_eq!((slot, reversed.as_str()), (0, "ecno"));
    eventually(|| pool[2].generation() == 1).await;

    pool.exit().await;
}
