//! Ctrl+C during a shell command. The interrupt flag is process-wide, so
//! this scenario has its own binary.

use std::time::Duration;

use mnemo_core::config::ShellConfig;
use mnemo_core::core::interrupt;
use mnemo_core::shell::{RunOutcome, ShellSession};
use tempfile::TempDir;

#[tokio::test]
async fn interrupted_command_stops_and_session_stays_usable() {
    if std::process::Command::new("bash").arg("--version").output().is_err() {
        eprintln!("bash not found; skipping");
        return;
    }
    let temp = TempDir::new().unwrap();
    let root = temp.path().canonicalize().unwrap();
    let mut shell = ShellSession::new(ShellConfig::default(), &root, &root);

    shell
        .run("export MARKER=kept", None, None)
        .await
        .unwrap();
    let pid = shell.pid();

    tokio::spawn(async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        interrupt::trigger_ctrl_c();
    });
    let stopped = shell.run("echo started; sleep 10", None, None).await.unwrap();
    assert_eq!(stopped.outcome, RunOutcome::Interrupted);
    assert_eq!(stopped.stdout.text, "started\n");
    assert!(stopped.duration < Duration::from_secs(5));
    assert!(stopped.warning.is_none());

    interrupt::reset();
    let next = shell.run("echo $MARKER", None, None).await.unwrap();
    assert!(next.success());
    assert_eq!(next.stdout.text, "kept\n");
    assert!(next.warning.is_none());
    assert_eq!(shell.pid(), pid);
    shell.shutdown().await;
}
