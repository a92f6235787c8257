//! End-to-end runs of the controller against a fake fio.
#![cfg(unix)]

mod common;

use common::{FakeFio, FakeJob, init_test_logging, is_process_alive};
use fiomark::bench::{
    BenchmarkController, BenchmarkError, BenchmarkEvent, BenchmarkProfile, RunOutcome, RunState,
    TEST_FILE_NAME,
};
use fiomark_common::{BlockSize, FiomarkConfig, Pattern};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::info;

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

fn config(fio: &FakeFio) -> FiomarkConfig {
    FiomarkConfig {
        fio_path: Some(fio.path.clone()),
        ioengine: "psync".to_string(),
        grace_period: Duration::from_secs(2),
        watchdog_slack: Duration::from_secs(30),
        ..FiomarkConfig::default()
    }
}

fn profile(dir: &std::path::Path, patterns: Vec<Pattern>, repeats: u32) -> BenchmarkProfile {
    BenchmarkProfile::for_directory(dir)
        .with_patterns(patterns)
        .with_block_sizes(vec![BlockSize::from_mib(1)])
        .with_repeat_count(repeats)
        .with_duration(Duration::from_secs(1))
        .with_interval(Duration::ZERO)
        .with_file_size(16 * 1024 * 1024)
}

/// Drain events until `pred` matches one.
async fn wait_for_event(
    rx: &mut broadcast::Receiver<BenchmarkEvent>,
    pred: impl Fn(&BenchmarkEvent) -> bool,
) -> BenchmarkEvent {
    timeout(TEST_TIMEOUT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn drain(rx: &mut broadcast::Receiver<BenchmarkEvent>) -> Vec<BenchmarkEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn two_job_run_ends_stopped_with_both_results() {
    init_test_logging();
    let fio = FakeFio::new(&[FakeJob::Complete]);
    let target = tempfile::tempdir().unwrap();
    let controller = BenchmarkController::new(config(&fio));
    let mut rx = controller.subscribe();

    let summary = timeout(
        TEST_TIMEOUT,
        controller.start(profile(
            target.path(),
            vec![Pattern::SequentialRead, Pattern::SequentialWrite],
            1,
        )),
    )
    .await
    .expect("run timed out")
    .expect("run failed");
    info!(
        test = "two_job_run_ends_stopped_with_both_results",
        phase = "verify",
        completed = summary.completed_jobs,
        "run finished"
    );

    assert_eq!(summary.state, RunState::Stopped);
    assert_eq!(controller.state(), RunState::Stopped);
    assert_eq!(summary.completed_jobs, 2);
    assert_eq!(summary.failed_jobs, 0);
    assert!(!summary.cancelled);
    assert_eq!(summary.results.len(), 2);

    let read = &summary.results[0];
    assert_eq!(read.pattern, Pattern::SequentialRead);
    assert_eq!(read.read.as_ref().unwrap().bandwidth_bytes_per_sec, 524_288_000.0);
    assert!(read.write.is_none());
    let write = &summary.results[1];
    assert_eq!(write.pattern, Pattern::SequentialWrite);
    assert_eq!(write.write.as_ref().unwrap().iops, 250.0);
    assert!(write.read.is_none());

    let invocations = fio.invocations();
    assert_eq!(invocations.len(), 3);
    assert!(invocations[0].contains("--create_only=1"));
    assert!(invocations[1].contains("--rw=read"));
    assert!(invocations[2].contains("--rw=write"));
    assert!(invocations[2].contains("--ioengine=psync"));
    assert!(!target.path().join(TEST_FILE_NAME).exists());

    let events = drain(&mut rx);
    let states: Vec<RunState> = events
        .iter()
        .filter_map(|e| match e {
            BenchmarkEvent::StateChanged { state } => Some(state.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            RunState::Preparing,
            RunState::Running { job_index: 0 },
            RunState::Running { job_index: 1 },
            RunState::Stopped,
        ]
    );
    let updates = events
        .iter()
        .filter(|e| matches!(e, BenchmarkEvent::ResultUpdated { .. }))
        .count();
    assert_eq!(updates, 2);
    assert!(events.iter().any(|e| matches!(
        e,
        BenchmarkEvent::Progress { label, .. } if label == "Sequential Write 2/2"
    )));
    assert!(matches!(
        events.last(),
        Some(BenchmarkEvent::Finished {
            outcome: RunOutcome::Stopped
        })
    ));
}

#[tokio::test]
async fn repeats_fold_into_one_row() {
    init_test_logging();
    let fio = FakeFio::new(&[FakeJob::Complete]);
    let target = tempfile::tempdir().unwrap();
    let controller = BenchmarkController::new(config(&fio));

    let summary = timeout(
        TEST_TIMEOUT,
        controller.start(profile(target.path(), vec![Pattern::RandomMix], 3)),
    )
    .await
    .expect("run timed out")
    .expect("run failed");

    assert_eq!(summary.results.len(), 1);
    let row = &summary.results[0];
    assert_eq!(row.repeats, 3);
    assert_eq!(row.read.as_ref().unwrap().latency.mean_ns, 16_000.0);
    assert_eq!(row.write.as_ref().unwrap().latency.mean_ns, 32_000.0);
    assert!(fio.job_invocations().iter().all(|l| l.contains("--rwmixread=70")));
}

#[tokio::test]
async fn cancel_during_first_of_three_jobs_leaves_nothing_behind() {
    init_test_logging();
    let fio = FakeFio::new(&[FakeJob::Hang]);
    let target = tempfile::tempdir().unwrap();
    let controller = BenchmarkController::new(config(&fio));
    let mut rx = controller.subscribe();

    let runner = controller.clone();
    let run_profile = profile(
        target.path(),
        vec![Pattern::SequentialRead, Pattern::RandomRead, Pattern::RandomWrite],
        1,
    );
    let run = tokio::spawn(async move { runner.start(run_profile).await });

    // Wait until job 0 has streamed a sample, so fio is certainly running.
    wait_for_event(&mut rx, |e| {
        matches!(e, BenchmarkEvent::Progress { job_index: 0, elapsed, .. } if !elapsed.is_zero())
    })
    .await;
    info!(
        test = "cancel_during_first_of_three_jobs_leaves_nothing_behind",
        phase = "execute",
        "cancelling during job 0"
    );
    controller.cancel();
    controller.cancel();

    let summary = timeout(TEST_TIMEOUT, run)
        .await
        .expect("cancel timed out")
        .expect("task panicked")
        .expect("run failed");

    assert_eq!(summary.state, RunState::Stopped);
    info!(
        test = "cancel_during_first_of_three_jobs_leaves_nothing_behind",
        phase = "verify",
        pids = ?fio.pids(),
        invocations = fio.invocations().len(),
        "run stopped"
    );
    assert!(summary.cancelled);
    assert_eq!(summary.completed_jobs, 0);
    assert!(summary.results.is_empty());
    assert!(controller.results().is_empty());
    assert_eq!(fio.job_invocations().len(), 1);
    for pid in fio.pids() {
        assert!(!is_process_alive(pid), "fio pid {pid} still alive");
    }
    assert!(!target.path().join(TEST_FILE_NAME).exists());

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        BenchmarkEvent::StateChanged {
            state: RunState::Stopping
        }
    )));
    assert!(!events.iter().any(|e| matches!(e, BenchmarkEvent::ResultUpdated { .. })));
}

#[tokio::test]
async fn cancel_keeps_results_of_finished_jobs() {
    init_test_logging();
    let fio = FakeFio::new(&[FakeJob::Complete, FakeJob::Hang]);
    let target = tempfile::tempdir().unwrap();
    let controller = BenchmarkController::new(config(&fio));
    let mut rx = controller.subscribe();

    let runner = controller.clone();
    let run_profile = profile(
        target.path(),
        vec![Pattern::SequentialRead, Pattern::SequentialWrite],
        1,
    );
    let run = tokio::spawn(async move { runner.start(run_profile).await });

    wait_for_event(&mut rx, |e| {
        matches!(e, BenchmarkEvent::Progress { job_index: 1, elapsed, .. } if !elapsed.is_zero())
    })
    .await;
    controller.cancel();

    let summary = timeout(TEST_TIMEOUT, run)
        .await
        .expect("cancel timed out")
        .expect("task panicked")
        .expect("run failed");

    assert!(summary.cancelled);
    assert_eq!(summary.completed_jobs, 1);
    assert_eq!(summary.results.len(), 1);
    assert_eq!(summary.results[0].pattern, Pattern::SequentialRead);
}

#[tokio::test]
async fn cancel_during_interval_stops_promptly() {
    init_test_logging();
    let fio = FakeFio::new(&[FakeJob::Complete]);
    let target = tempfile::tempdir().unwrap();
    let controller = BenchmarkController::new(config(&fio));
    let mut rx = controller.subscribe();

    let runner = controller.clone();
    let run_profile = profile(
        target.path(),
        vec![Pattern::SequentialRead, Pattern::SequentialWrite],
        1,
    )
    .with_interval(Duration::from_secs(60));
    let run = tokio::spawn(async move { runner.start(run_profile).await });

    wait_for_event(&mut rx, |e| matches!(e, BenchmarkEvent::Interval { .. })).await;
    controller.cancel();

    let summary = timeout(Duration::from_secs(10), run)
        .await
        .expect("interval wait was not cancelled")
        .expect("task panicked")
        .expect("run failed");
    assert!(summary.cancelled);
    assert_eq!(summary.results.len(), 1);
    assert_eq!(fio.job_invocations().len(), 1);
}

#[tokio::test]
async fn job_failure_is_reported_and_run_continues() {
    init_test_logging();
    let fio = FakeFio::new(&[FakeJob::Fail, FakeJob::Complete]);
    let target = tempfile::tempdir().unwrap();
    let controller = BenchmarkController::new(config(&fio));
    let mut rx = controller.subscribe();

    let summary = timeout(
        TEST_TIMEOUT,
        controller.start(profile(
            target.path(),
            vec![Pattern::RandomRead, Pattern::RandomWrite],
            1,
        )),
    )
    .await
    .expect("run timed out")
    .expect("a failing job must not fail the run");

    assert_eq!(summary.state, RunState::Stopped);
    assert_eq!(summary.failed_jobs, 1);
    assert_eq!(summary.completed_jobs, 1);
    assert_eq!(summary.results.len(), 1);
    assert_eq!(summary.results[0].pattern, Pattern::RandomWrite);

    let failed = drain(&mut rx)
        .into_iter()
        .find_map(|e| match e {
            BenchmarkEvent::JobFailed {
                job_index, reason, ..
            } => Some((job_index, reason)),
            _ => None,
        })
        .expect("job failed event");
    assert_eq!(failed.0, 0);
    assert!(failed.1.contains("failed to open file"), "{}", failed.1);
}

#[tokio::test]
async fn job_killed_by_signal_is_failed_despite_interim_samples() {
    init_test_logging();
    let fio = FakeFio::new(&[FakeJob::Crash, FakeJob::Complete]);
    let target = tempfile::tempdir().unwrap();
    let controller = BenchmarkController::new(config(&fio));
    let mut rx = controller.subscribe();

    let summary = timeout(
        TEST_TIMEOUT,
        controller.start(profile(
            target.path(),
            vec![Pattern::RandomRead, Pattern::RandomWrite],
            1,
        )),
    )
    .await
    .expect("run timed out")
    .expect("a crashed job must not fail the run");

    info!(
        test = "job_killed_by_signal_is_failed_despite_interim_samples",
        completed = summary.completed_jobs,
        failed = summary.failed_jobs,
        "run finished"
    );
    assert_eq!(summary.failed_jobs, 1);
    assert_eq!(summary.completed_jobs, 1);
    assert_eq!(summary.results.len(), 1);
    assert_eq!(summary.results[0].pattern, Pattern::RandomWrite);

    let events = drain(&mut rx);
    let reason = events
        .iter()
        .find_map(|e| match e {
            BenchmarkEvent::JobFailed {
                job_index: 0,
                reason,
                ..
            } => Some(reason.clone()),
            _ => None,
        })
        .expect("job failed event");
    assert!(reason.contains("signal"), "{reason}");
    assert!(!events.iter().any(|e| matches!(
        e,
        BenchmarkEvent::ResultUpdated { result } if result.pattern == Pattern::RandomRead
    )));
}

#[tokio::test]
async fn abort_on_job_failure_halts_the_queue() {
    init_test_logging();
    let fio = FakeFio::new(&[FakeJob::Fail, FakeJob::Complete]);
    let target = tempfile::tempdir().unwrap();
    let controller = BenchmarkController::new(FiomarkConfig {
        abort_on_job_failure: true,
        ..config(&fio)
    });

    let summary = timeout(
        TEST_TIMEOUT,
        controller.start(profile(
            target.path(),
            vec![Pattern::RandomRead, Pattern::RandomWrite],
            1,
        )),
    )
    .await
    .expect("run timed out")
    .expect("run failed");

    assert_eq!(summary.state, RunState::Stopped);
    assert_eq!(summary.failed_jobs, 1);
    assert!(summary.results.is_empty());
    assert_eq!(fio.job_invocations().len(), 1);
}

#[tokio::test]
async fn watchdog_terminates_a_stuck_job() {
    init_test_logging();
    let fio = FakeFio::new(&[FakeJob::Silent, FakeJob::Complete]);
    let target = tempfile::tempdir().unwrap();
    let controller = BenchmarkController::new(FiomarkConfig {
        watchdog_slack: Duration::from_millis(500),
        ..config(&fio)
    });
    let mut rx = controller.subscribe();

    let summary = timeout(
        TEST_TIMEOUT,
        controller.start(profile(
            target.path(),
            vec![Pattern::SequentialRead, Pattern::SequentialWrite],
            1,
        )),
    )
    .await
    .expect("watchdog did not fire")
    .expect("run failed");

    assert_eq!(summary.failed_jobs, 1);
    assert_eq!(summary.completed_jobs, 1);
    let reason = drain(&mut rx)
        .into_iter()
        .find_map(|e| match e {
            BenchmarkEvent::JobFailed { reason, .. } => Some(reason),
            _ => None,
        })
        .expect("job failed event");
    assert!(reason.contains("still running"), "{reason}");
    let first_pid = fio.pids()[1];
    assert!(!is_process_alive(first_pid));
}

#[tokio::test]
async fn enormous_duration_runs_without_overflow() {
    init_test_logging();
    let fio = FakeFio::new(&[FakeJob::Complete]);
    let target = tempfile::tempdir().unwrap();
    let controller = BenchmarkController::new(config(&fio));

    let run_profile = profile(
        target.path(),
        vec![Pattern::SequentialRead, Pattern::SequentialWrite],
        3,
    )
    .with_duration(Duration::MAX);

    let summary = timeout(TEST_TIMEOUT, controller.start(run_profile))
        .await
        .expect("run timed out")
        .expect("run failed");

    assert_eq!(summary.state, RunState::Stopped);
    assert_eq!(summary.completed_jobs, 6);
    assert_eq!(summary.failed_jobs, 0);
}

#[tokio::test]
async fn missing_tool_fails_and_spawns_nothing() {
    init_test_logging();
    let target = tempfile::tempdir().unwrap();
    let controller = BenchmarkController::new(FiomarkConfig {
        fio_path: Some(target.path().join("no-such-fio")),
        ..FiomarkConfig::default()
    });
    let mut rx = controller.subscribe();

    let err = controller
        .start(profile(target.path(), vec![Pattern::SequentialRead], 1))
        .await
        .unwrap_err();
    assert!(matches!(err, BenchmarkError::ToolNotFound(_)));
    assert!(matches!(controller.state(), RunState::Failed { .. }));
    assert!(!target.path().join(TEST_FILE_NAME).exists());

    let events = drain(&mut rx);
    assert!(!events.iter().any(|e| matches!(e, BenchmarkEvent::Progress { .. })));
    assert!(matches!(
        events.last(),
        Some(BenchmarkEvent::Finished {
            outcome: RunOutcome::Failed { .. }
        })
    ));
}

#[tokio::test]
async fn prepare_failure_fails_the_run() {
    init_test_logging();
    let fio = FakeFio::with_prepare(&[FakeJob::Complete], false);
    let target = tempfile::tempdir().unwrap();
    let controller = BenchmarkController::new(config(&fio));

    let err = controller
        .start(profile(target.path(), vec![Pattern::SequentialRead], 1))
        .await
        .unwrap_err();
    match err {
        BenchmarkError::PrepareFailed(reason) => {
            assert!(reason.contains("no space left"), "{reason}")
        }
        other => panic!("expected PrepareFailed, got {other:?}"),
    }
    assert!(matches!(controller.state(), RunState::Failed { .. }));
    assert!(fio.job_invocations().is_empty());
}

#[tokio::test]
async fn keep_test_file_leaves_it_in_place() {
    init_test_logging();
    let fio = FakeFio::new(&[FakeJob::Complete]);
    let target = tempfile::tempdir().unwrap();
    let controller = BenchmarkController::new(FiomarkConfig {
        keep_test_file: true,
        ..config(&fio)
    });

    timeout(
        TEST_TIMEOUT,
        controller.start(profile(target.path(), vec![Pattern::SequentialRead], 1)),
    )
    .await
    .expect("run timed out")
    .expect("run failed");
    assert!(target.path().join(TEST_FILE_NAME).exists());
}

#[tokio::test]
async fn second_start_while_running_is_rejected() {
    init_test_logging();
    let fio = FakeFio::new(&[FakeJob::Hang]);
    let target = tempfile::tempdir().unwrap();
    let controller = BenchmarkController::new(config(&fio));
    let mut rx = controller.subscribe();

    let runner = controller.clone();
    let run_profile = profile(target.path(), vec![Pattern::SequentialRead], 1);
    let run = tokio::spawn(async move { runner.start(run_profile).await });

    wait_for_event(&mut rx, |e| {
        matches!(e, BenchmarkEvent::StateChanged { state: RunState::Running { .. } })
    })
    .await;
    let err = controller
        .start(profile(target.path(), vec![Pattern::SequentialRead], 1))
        .await
        .unwrap_err();
    assert_eq!(err, BenchmarkError::AlreadyRunning);

    controller.cancel();
    let summary = timeout(TEST_TIMEOUT, run)
        .await
        .expect("cancel timed out")
        .expect("task panicked")
        .expect("run failed");
    assert!(summary.cancelled);

    // The controller is reusable once stopped.
    assert_eq!(controller.state(), RunState::Stopped);
}
