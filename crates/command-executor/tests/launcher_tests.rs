//! Integration tests for the local launcher

use async_runtime_compat::smol::SmolSpawner;
use command_executor::{Command, Error, Launcher, LocalLauncher, LogSource, ServiceProcess};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn launcher() -> LocalLauncher {
    LocalLauncher::new(Arc::new(SmolSpawner))
}

fn sh(script: &str) -> Command {
    Command::new("sh").with_args(["-c", script])
}

async fn wait_for_line(process: &ServiceProcess, needle: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !process.output().contains(|l| l.contains(needle)) {
        assert!(Instant::now() < deadline, "never saw {needle:?} in output");
        smol::Timer::after(Duration::from_millis(20)).await;
    }
}

#[smol_potat::test]
async fn test_spawn_captures_both_streams() {
    let process = launcher()
        .spawn("echo", &sh("echo hello; echo oops >&2"), Some(8080))
        .await
        .unwrap();

    assert!(process.pid() > 0);
    assert_eq!(process.port(), Some(8080));
    assert!(!process.is_ready());

    let status = process.wait().await;
    assert!(status.success());

    wait_for_line(&process, "oops").await;
    let lines = process.output().snapshot();
    assert!(lines.iter().any(|l| l.source == LogSource::Stdout && l.line == "hello"));
    assert!(lines.iter().any(|l| l.source == LogSource::Stderr && l.line == "oops"));
}

#[smol_potat::test]
async fn test_spawn_applies_env_and_working_dir() {
    let dir = tempfile::tempdir().unwrap();
    let cmd = Command::new("sh")
        .with_args(["-c", "echo $GREETING; pwd -P"])
        .with_env("GREETING", "from-env")
        .in_dir(dir.path());

    let process = launcher().spawn("env", &cmd, None).await.unwrap();
    process.wait().await;
    wait_for_line(&process, "from-env").await;

    let expected = dir.path().canonicalize().unwrap();
    wait_for_line(&process, expected.to_str().unwrap()).await;
}

#[smol_potat::test]
async fn test_spawn_failure_is_reported() {
    let cmd = Command::new("/definitely/not/a/real/binary");
    let err = launcher().spawn("ghost", &cmd, None).await.unwrap_err();
    assert!(matches!(err, Error::SpawnFailed { .. }), "got {err:?}");
    assert!(err.to_string().contains("ghost"));
}

#[smol_potat::test]
async fn test_self_exit_is_observed_without_polling() {
    let process = launcher().spawn("crashy", &sh("exit 3"), None).await.unwrap();
    let watch = process.exit_watch();

    let status = watch.wait().await;
    assert_eq!(status.code, Some(3));
    assert_eq!(process.exit_status(), Some(status));
}

#[cfg(unix)]
#[smol_potat::test]
async fn test_stop_terminates_gracefully() {
    let launcher = launcher();
    let process = launcher.spawn("sleeper", &sh("exec sleep 30"), None).await.unwrap();

    let started = Instant::now();
    let status = launcher
        .stop(&process, Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(status.signal, Some(15));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[cfg(unix)]
#[smol_potat::test]
async fn test_stop_escalates_to_kill() {
    let launcher = launcher();
    let process = launcher
        .spawn(
            "stubborn",
            &sh("trap '' TERM; echo trapped; while :; do sleep 0.1; done"),
            None,
        )
        .await
        .unwrap();
    wait_for_line(&process, "trapped").await;

    let status = launcher
        .stop(&process, Duration::from_millis(300))
        .await
        .unwrap();
    assert_eq!(status.signal, Some(9));
}

#[smol_potat::test]
async fn test_stop_after_exit_returns_recorded_status() {
    let launcher = launcher();
    let process = launcher.spawn("done", &sh("exit 0"), None).await.unwrap();
    process.wait().await;

    let status = launcher.stop(&process, Duration::from_secs(1)).await.unwrap();
    assert!(status.success());
}

#[smol_potat::test]
async fn test_heavy_output_never_blocks_child() {
    let launcher = launcher().with_output_capacity(100);
    let process = launcher
        .spawn("chatty", &sh("seq 1 200000"), None)
        .await
        .unwrap();

    let status = async_runtime_compat::runtime_utils::timeout(
        Duration::from_secs(20),
        process.wait(),
    )
    .await
    .expect("child blocked on a full pipe");
    assert!(status.success());

    wait_for_line(&process, "200000").await;
    assert_eq!(process.output().snapshot().len(), 100);
}
