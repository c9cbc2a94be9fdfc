//! Ctrl+C at the chat prompt archives unsynced work before exiting.
#![cfg(unix)]


use std::fs;
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use fixtures::{sse_response, text_sse, tool_use_sse};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request};

fn can_bind_localhost() -> bool {
    std::net::TcpListener::bind("127.0.0.1:0").is_ok()
}

#[tokio::test]
async fn sigint_at_idle_prompt_archives_pending_calls() {
    if !can_bind_localhost() {
        eprintln!("Skipping: cannot bind localhost TCP port in this environment.");
        return;
    }
    let home = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let responses = [
        tool_use_sse("toolu_list_001", "list", r#"{"path": "."}"#),
        text_sse("listed"),
    ];
    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(move |_: &Request| {
            let index = counter.fetch_add(1, Ordering::SeqCst);
            sse_response(&responses[index.min(responses.len() - 1)])
        })
        .mount(&server)
        .await;

    let mut child = Command::new(env!("CARGO_BIN_EXE_mnemo"))
        .env("MNEMO_HOME", home.path())
        .env_remove("MNEMO_CONFIG")
        .env("MNEMO_BLOCK_REAL_API", "1")
        .env("ANTHROPIC_API_KEY", "test-api-key")
        .env("ANTHROPIC_BASE_URL", server.uri())
        .args(["--root", root.path().to_str().unwrap(), "chat"])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    // Stdin stays open so the session sits at the prompt.
    let mut stdin = child.stdin.take().unwrap();
    stdin.write_all(b"list the files\n").unwrap();
    stdin.flush().unwrap();

    let started = Instant::now();
    while count.load(Ordering::SeqCst) < 2 {
        assert!(started.elapsed() < Duration::from_secs(20), "turn never finished");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    // Let the turn finish rendering and return to the prompt.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(child.try_wait().unwrap().is_none());

    let sent = Command::new("kill")
        .args(["-INT", &child.id().to_string()])
        .status()
        .unwrap();
    assert!(sent.success());

    let started = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait().unwrap() {
            break status;
        }
        if started.elapsed() > Duration::from_secs(10) {
            child.kill().unwrap();
            panic!("chat did not exit after SIGINT");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    drop(stdin);
    assert_eq!(status.code(), Some(130));

    let history = root.path().join("agent_root/storage/history");
    let archives: Vec<_> = fs::read_dir(&history).unwrap().map(|e| e.unwrap().path()).collect();
    assert_eq!(archives.len(), 1);
    let record: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&archives[0]).unwrap()).unwrap();
    assert_eq!(record["reason"], "interrupt");
    assert_eq!(record["entries"][0]["invocation"]["name"], "list");
}
