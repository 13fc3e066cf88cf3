#![cfg(unix)]

use std::path::PathBuf;
use std::time::Duration;

use app_server_client::{
    ExitReason, INHERITED_ENV_VARS, ProcessConfig, ProcessHandle, WriteError,
};
use tokio::io::{AsyncBufReadExt, BufReader};

fn shell(script: &str, cwd: PathBuf) -> ProcessConfig {
    ProcessConfig {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        cwd,
        ..ProcessConfig::default()
    }
}

#[tokio::test]
async fn write_after_exit_reports_process_exited() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (process, _output) = ProcessHandle::spawn(shell("exit 3", dir.path().to_path_buf()))?;

    assert_eq!(process.wait().await, ExitReason::Exited { code: 3 });
    assert!(!process.is_alive());
    let result = process.write(b"hello\n").await;
    assert!(matches!(result, Err(WriteError::ProcessExited)));
    Ok(())
}

#[tokio::test]
async fn every_waiter_sees_the_same_exit() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (process, _output) =
        ProcessHandle::spawn(shell("sleep 0.2; exit 7", dir.path().to_path_buf()))?;

    let (first, second) = tokio::join!(process.wait(), process.wait());
    assert_eq!(first, ExitReason::Exited { code: 7 });
    assert_eq!(first, second);
    assert_eq!(process.exit_reason(), Some(first));
    Ok(())
}

#[tokio::test]
async fn shutdown_kills_a_process_that_ignores_terminate() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (process, _output) = ProcessHandle::spawn(shell(
        "trap '' TERM; while true; do sleep 0.05; done",
        dir.path().to_path_buf(),
    ))?;

    let reason = tokio::time::timeout(
        Duration::from_secs(5),
        process.shutdown(Duration::from_millis(200)),
    )
    .await?;
    assert_eq!(reason, ExitReason::Killed);
    Ok(())
}

#[tokio::test]
async fn kill_is_idempotent() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (process, _output) = ProcessHandle::spawn(shell("sleep 30", dir.path().to_path_buf()))?;

    process.kill();
    process.kill();
    assert_eq!(process.wait().await, ExitReason::Killed);
    process.kill();
    process.terminate();
    assert!(!process.signal_interrupt());
    Ok(())
}

#[tokio::test]
async fn child_environment_is_filtered() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let home = dir.path().join("codex-home");
    let mut config = shell(
        "printf '%s|%s|%s\\n' \"$EXPLICIT\" \"$CODEX_HOME\" \"${CARGO_PKG_NAME:-unset}\"",
        dir.path().to_path_buf(),
    );
    config.env = vec![("EXPLICIT".to_string(), "yes".to_string())];
    config.home = Some(("CODEX_HOME".to_string(), home.clone()));

    let (process, output) = ProcessHandle::spawn(config)?;
    let mut lines = BufReader::new(output.stdout).lines();
    let line = lines
        .next_line()
        .await?
        .ok_or_else(|| anyhow::anyhow!("no output"))?;
    assert_eq!(line, format!("yes|{}|unset", home.display()));
    assert_eq!(process.wait().await, ExitReason::Exited { code: 0 });
    Ok(())
}

#[test]
fn agent_sockets_are_not_inherited_by_default() {
    assert!(!INHERITED_ENV_VARS.contains(&"SSH_AUTH_SOCK"));
    assert!(INHERITED_ENV_VARS.contains(&"HOME"));
}

#[tokio::test]
async fn opted_in_variables_pass_through() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = shell(
        "printf '%s\\n' \"${CARGO_PKG_NAME:-unset}\"",
        dir.path().to_path_buf(),
    );
    config.inherit_env = vec!["CARGO_PKG_NAME".to_string()];
    let expected = std::env::var("CARGO_PKG_NAME").unwrap_or_else(|_| "unset".to_string());

    let (process, output) = ProcessHandle::spawn(config)?;
    let mut lines = BufReader::new(output.stdout).lines();
    assert_eq!(lines.next_line().await?, Some(expected));
    assert_eq!(process.wait().await, ExitReason::Exited { code: 0 });
    Ok(())
}

#[tokio::test]
async fn stdin_reaches_the_child() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (process, output) =
        ProcessHandle::spawn(shell("read line; echo \"got:$line\"", dir.path().to_path_buf()))?;

    process.write(b"ping\n").await?;
    let mut lines = BufReader::new(output.stdout).lines();
    assert_eq!(lines.next_line().await?.as_deref(), Some("got:ping"));
    assert_eq!(process.wait().await, ExitReason::Exited { code: 0 });
    Ok(())
}
