//! Tests for one-shot execution with timeout and cancellation

use async_runtime_compat::CancellationToken;
use command_executor::{execute, Command, Error, ExecuteOptions};
use std::time::{Duration, Instant};

#[smol_potat::test]
async fn test_execute_collects_output() {
    let cmd = Command::new("sh").with_args(["-c", "echo out; echo err >&2; exit 4"]);

    let result = execute(&cmd, ExecuteOptions::default()).await.unwrap();
    assert_eq!(result.status.code, Some(4));
    assert!(!result.success());
    assert_eq!(result.stdout.trim(), "out");
    assert_eq!(result.stderr.trim(), "err");
}

#[smol_potat::test]
async fn test_execute_times_out() {
    let cmd = Command::new("sleep").with_args(["30"]);

    let started = Instant::now();
    let err = execute(&cmd, ExecuteOptions::with_timeout(Duration::from_millis(200)))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Timeout { .. }), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[smol_potat::test]
async fn test_execute_honours_cancellation() {
    let cmd = Command::new("sleep").with_args(["30"]);
    let token = CancellationToken::new();

    let canceller = token.clone();
    smol::spawn(async move {
        smol::Timer::after(Duration::from_millis(100)).await;
        canceller.cancel();
    })
    .detach();

    let started = Instant::now();
    let err = execute(&cmd, ExecuteOptions::default().cancel_on(token))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Cancelled { .. }), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[smol_potat::test]
async fn test_execute_missing_binary() {
    let cmd = Command::new("/no/such/tool");
    let err = execute(&cmd, ExecuteOptions::default()).await.unwrap_err();
    assert!(matches!(err, Error::SpawnFailed { .. }));
}
