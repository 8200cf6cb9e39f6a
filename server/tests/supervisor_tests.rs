//! Supervisor lifecycle tests against scripted worker commands.

#![cfg(unix)]

use std::time::{Duration, Instant};

use protean_server::{Supervisor, WorkerCommand};

/// A worker that exits 0 promptly when terminated.
fn graceful_worker() -> WorkerCommand {
    WorkerCommand::new("/bin/sh").args(["-c", "trap 'exit 0' TERM; sleep 30 & wait $!"])
}

/// A worker that ignores SIGTERM entirely.
fn stubborn_worker() -> WorkerCommand {
    WorkerCommand::new("/bin/sh").args(["-c", "trap '' TERM; sleep 30"])
}

#[tokio::test]
async fn test_graceful_shutdown_within_grace() {
    let supervisor = Supervisor::new(3, graceful_worker()).with_grace(Duration::from_secs(5));
    let handle = supervisor.handle();

    let run = tokio::spawn(async move { supervisor.run().await });

    // Let the workers start, then terminate the pool.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let terminated_at = Instant::now();
    handle.terminate();

    let code = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("supervisor must exit")
        .unwrap();

    assert_eq!(code, 0, "clean worker exits aggregate to 0");
    assert!(
        terminated_at.elapsed() < Duration::from_secs(5),
        "well within the grace period"
    );
}

#[tokio::test]
async fn test_stubborn_worker_is_force_killed_after_grace() {
    let grace = Duration::from_millis(400);
    let supervisor = Supervisor::new(1, stubborn_worker()).with_grace(grace);
    let handle = supervisor.handle();

    let run = tokio::spawn(async move { supervisor.run().await });

    tokio::time::sleep(Duration::from_millis(300)).await;
    let terminated_at = Instant::now();
    handle.terminate();

    let code = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("supervisor must exit")
        .unwrap();

    let elapsed = terminated_at.elapsed();
    assert_eq!(code, 1, "a force-killed laggard is a failure");
    assert!(elapsed >= grace, "laggard got its full grace period");
    assert!(
        elapsed < grace + Duration::from_secs(3),
        "bounded shortly after the grace period"
    );
}

#[tokio::test]
async fn test_second_terminate_during_shutdown_is_ignored() {
    let supervisor = Supervisor::new(2, graceful_worker()).with_grace(Duration::from_secs(5));
    let handle = supervisor.handle();

    let run = tokio::spawn(async move { supervisor.run().await });

    tokio::time::sleep(Duration::from_millis(300)).await;
    handle.terminate();
    handle.terminate();
    handle.terminate();

    let code = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("supervisor must exit")
        .unwrap();
    assert_eq!(code, 0);
}

#[tokio::test]
async fn test_crashed_worker_sets_exit_code() {
    let crashing = WorkerCommand::new("/bin/sh").args(["-c", "exit 3"]);
    let supervisor = Supervisor::new(2, crashing).with_grace(Duration::from_secs(1));

    let code = tokio::time::timeout(Duration::from_secs(10), supervisor.run())
        .await
        .expect("supervisor must exit when the pool empties");
    assert_eq!(code, 1, "any non-zero worker exit aggregates to 1");
}

#[tokio::test]
async fn test_clean_worker_exits_aggregate_to_zero() {
    let clean = WorkerCommand::new("/bin/sh").args(["-c", "exit 0"]);
    let supervisor = Supervisor::new(2, clean);

    let code = tokio::time::timeout(Duration::from_secs(10), supervisor.run())
        .await
        .expect("supervisor must exit when the pool empties");
    assert_eq!(code, 0);
}
