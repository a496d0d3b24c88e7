//! Integration tests for the sidecar binary
//!
//! These tests drive the agent through its command-line interface.

use std::fs;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command;
use tokio::time;

const BINARY: &str = env!("CARGO_BIN_EXE_sidecar");

/// Write a config with one generic backend reading its configuration from a
/// local file instead of the server
fn create_local_config(dir: &Path) -> std::path::PathBuf {
    let collectors = dir.join("collectors.yml");
    fs::write(
        &collectors,
        r#"
snippets:
  - backend_id: gen-1
    name: main
    text: "node={{ node_name }}"
"#,
    )
    .unwrap();

    let config = format!(
        r#"
node_id: integration-node
node_name: integration-host
update_interval: 1
send_status: false
log_path: {dir}/logs
collector_configuration_directory: {dir}/generated
collector_shutdown_timeout: 2
local_configuration: {collectors}
backends:
  - id: gen-1
    name: generic
    type: generic
    executable_path: /bin/sh
    execute_parameters: "-c 'exec sleep 30'"
"#,
        dir = dir.display(),
        collectors = collectors.display()
    );
    let path = dir.join("sidecar.yml");
    fs::write(&path, config).unwrap();
    path
}

#[tokio::test]
async fn test_cli_help() {
    let output = Command::new(BINARY)
        .arg("--help")
        .output()
        .await
        .expect("Failed to run --help");

    assert!(output.status.success(), "Help should work");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("run"));
    assert!(stdout.contains("check-config"));
    assert!(stdout.contains("service"));
}

#[tokio::test]
async fn test_check_config_accepts_valid_config() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_local_config(temp_dir.path());

    let output = Command::new(BINARY)
        .arg("--config")
        .arg(&config)
        .arg("check-config")
        .output()
        .await
        .expect("Failed to run check-config");

    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(String::from_utf8_lossy(&output.stdout).contains("Configuration OK"));
}

#[tokio::test]
async fn test_check_config_rejects_invalid_config() {
    let temp_dir = TempDir::new().unwrap();

    // Syntax error
    let broken = temp_dir.path().join("broken.yml");
    fs::write(&broken, "invalid: yaml: content:\n  - with syntax errors\n").unwrap();
    let output = Command::new(BINARY)
        .arg("--config")
        .arg(&broken)
        .arg("check-config")
        .output()
        .await
        .unwrap();
    assert!(!output.status.success());

    // Unknown backend type
    let unknown = temp_dir.path().join("unknown.yml");
    fs::write(
        &unknown,
        "node_id: n1\nbackends:\n  - id: x\n    name: x\n    type: not-a-collector\n    executable_path: /bin/true\n",
    )
    .unwrap();
    let output = Command::new(BINARY)
        .arg("--config")
        .arg(&unknown)
        .arg("check-config")
        .output()
        .await
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("not-a-collector"));

    // Missing file
    let output = Command::new(BINARY)
        .arg("--config")
        .arg(temp_dir.path().join("missing.yml"))
        .arg("check-config")
        .output()
        .await
        .unwrap();
    assert!(!output.status.success());
}

#[tokio::test]
async fn test_backends_lists_builtin_types() {
    let output = Command::new(BINARY).arg("backends").output().await.unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let names: Vec<&str> = stdout.lines().collect();
    assert_eq!(names, vec!["filebeat", "generic"]);
}

#[tokio::test]
async fn test_service_rejects_unknown_action() {
    let output = Command::new(BINARY)
        .arg("service")
        .arg("bogus")
        .output()
        .await
        .unwrap();

    assert_eq!(output.status.code(), Some(2));
}

#[cfg(unix)]
#[tokio::test]
async fn test_run_renders_local_configuration() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_local_config(temp_dir.path());
    let rendered = temp_dir.path().join("generated/generic.conf");

    let mut child = Command::new(BINARY)
        .arg("--config")
        .arg(&config)
        .arg("run")
        .kill_on_drop(true)
        .spawn()
        .expect("Failed to start sidecar");

    let wait_for_render = async {
        loop {
            if fs::read_to_string(&rendered).ok().as_deref() == Some("node=integration-host") {
                return;
            }
            time::sleep(Duration::from_millis(100)).await;
        }
    };
    let result = time::timeout(Duration::from_secs(15), wait_for_render).await;

    // SIGTERM asks the agent to stop its collectors and exit
    let pid = child.id().expect("sidecar exited early") as i32;
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid),
        nix::sys::signal::Signal::SIGTERM,
    )
    .unwrap();
    let status = time::timeout(Duration::from_secs(10), child.wait())
        .await
        .expect("sidecar did not exit after SIGTERM")
        .unwrap();

    assert!(result.is_ok(), "configuration was never rendered");
    assert!(status.success());
    assert!(temp_dir.path().join("logs/generic_stdout.log").exists());
}
