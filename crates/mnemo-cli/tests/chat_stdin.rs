//! Chat mode reads one prompt per line until EOF or `exit`.


use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer};

fn can_bind_localhost() -> bool {
    std::net::TcpListener::bind("127.0.0.1:0").is_ok()
}

#[tokio::test]
async fn each_line_is_a_turn() {
    if !can_bind_localhost() {
        eprintln!("Skipping: cannot bind localhost TCP port in this environment.");
        return;
    }
    let home = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(fixtures::text_response("pong"))
        .expect(2)
        .mount(&server)
        .await;

    cargo_bin_cmd!("mnemo")
        .env("MNEMO_HOME", home.path())
        .env_remove("MNEMO_CONFIG")
        .env("MNEMO_BLOCK_REAL_API", "1")
        .env("ANTHROPIC_API_KEY", "test-api-key")
        .env("ANTHROPIC_BASE_URL", server.uri())
        .args(["--root", root.path().to_str().unwrap(), "chat"])
        .write_stdin("ping\n\nping again\nexit\nnever sent\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("pong").count(2));
}
