//! Smoke tests -- verify the binary runs and the CLI surface is wired up.

use assert_cmd::Command;

fn linkbench(dir: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("linkbench").unwrap();
    cmd.current_dir(dir).env_remove("LINKBENCH_CONFIG").env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_cli_help() {
    let dir = tempfile::TempDir::new().unwrap();
    linkbench(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("throughput benchmark"))
        .stdout(predicates::str::contains("--total-duration"));
}

#[test]
fn test_cli_version() {
    let dir = tempfile::TempDir::new().unwrap();
    linkbench(dir.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("linkbench"));
}

#[test]
fn test_gen_cert_writes_pem_files() {
    let dir = tempfile::TempDir::new().unwrap();
    linkbench(dir.path())
        .args(["gen-cert", "--cert", "c.pem", "--key", "k.pem", "--name", "bench.local"])
        .assert()
        .success();

    let cert = std::fs::read_to_string(dir.path().join("c.pem")).unwrap();
    let key = std::fs::read_to_string(dir.path().join("k.pem")).unwrap();
    assert!(cert.contains("BEGIN CERTIFICATE"));
    assert!(key.contains("PRIVATE KEY"));
}

#[test]
fn test_invalid_config_is_fatal() {
    let dir = tempfile::TempDir::new().unwrap();
    linkbench(dir.path())
        .args(["--hosts", "localhost", "--connections", "0"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("connections must be greater than zero"));
}

#[test]
fn test_bad_duration_flag_rejected() {
    let dir = tempfile::TempDir::new().unwrap();
    linkbench(dir.path())
        .args(["--hosts", "localhost", "--total-duration", "soon"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("soon"));
}

#[test]
fn test_config_file_is_read() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("linkbench.toml"), "connections = 0\nhosts = [\"x\"]\n").unwrap();
    linkbench(dir.path())
        .assert()
        .failure()
        .stderr(predicates::str::contains("connections"));
}

/// Grab a port nothing listens on.
fn closed_port() -> u16 {
    let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    l.local_addr().unwrap().port()
}

#[test]
fn test_client_with_unreachable_host_finishes() {
    let dir = tempfile::TempDir::new().unwrap();
    let host = format!("127.0.0.1:{}", closed_port());
    linkbench(dir.path())
        .args(["--hosts", &host, "--tls", "false", "--total-duration", "1s"])
        .assert()
        .success()
        .stdout(predicates::str::contains("no connection established"))
        .stdout(predicates::str::contains("aggregate reading"));
}

#[test]
fn test_client_json_summary() {
    let dir = tempfile::TempDir::new().unwrap();
    let host = format!("127.0.0.1:{}", closed_port());
    let output = linkbench(dir.path())
        .args(["--hosts", &host, "--tls", "false", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let summary: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(summary["connections"].as_array().map(Vec::len), Some(0));
    assert_eq!(summary["reader"]["contributions"], 0);
}

#[test]
fn test_unloadable_config_env_is_reported() {
    let dir = tempfile::TempDir::new().unwrap();
    let host = format!("127.0.0.1:{}", closed_port());
    linkbench(dir.path())
        .env("LINKBENCH_CONFIG", dir.path().join("missing.toml"))
        .args(["--hosts", &host, "--tls", "false", "--total-duration", "1s"])
        .assert()
        .success()
        .stderr(predicates::str::contains("LINKBENCH_CONFIG set but file could not be loaded"))
        .stderr(predicates::str::contains("missing.toml"));
}

#[test]
fn test_loaded_config_file_is_logged() {
    let dir = tempfile::TempDir::new().unwrap();
    let host = format!("127.0.0.1:{}", closed_port());
    std::fs::write(dir.path().join("bench.toml"), "total_duration = \"1s\"\n").unwrap();
    linkbench(dir.path())
        .args(["--config", "bench.toml", "--hosts", &host, "--tls", "false"])
        .assert()
        .success()
        .stderr(predicates::str::contains("loaded configuration"));
}
