//! Integration tests that drive the `runbox` binary.

use std::process::{Command, Output};

use tempfile::TempDir;

/// Run the binary with an isolated config directory.
fn runbox(config_home: &TempDir, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_runbox"))
        .args(args)
        .env("XDG_CONFIG_HOME", config_home.path())
        .env_remove("RUNBOX_DEFAULT_ENGINE")
        .env_remove("RUNBOX_AGENT_SERVER")
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run runbox")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn engines_lists_every_backend() {
    let home = TempDir::new().unwrap();
    let output = runbox(&home, &["engines"]);
    assert!(output.status.success());
    let names: Vec<String> = stdout(&output).lines().map(str::to_string).collect();
    assert_eq!(
        names,
        vec!["caas", "dind", "docker", "host", "k8s", "podman", "ssh", "wsl"]
    );
}

#[cfg(unix)]
#[test]
fn exec_prints_command_output() {
    let home = TempDir::new().unwrap();
    let output = runbox(&home, &["exec", "-c", "echo hello world"]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(stdout(&output), "hello world\n");
}

#[cfg(unix)]
#[test]
fn exec_propagates_exit_code() {
    let home = TempDir::new().unwrap();
    let output = runbox(&home, &["exec", "-c", "exit 42"]);
    assert_eq!(output.status.code(), Some(42));
}

#[cfg(unix)]
#[test]
fn exec_passes_env_flags() {
    let home = TempDir::new().unwrap();
    let output = runbox(
        &home,
        &["exec", "-c", "printf '%s' \"$COLOR\"", "--env", "COLOR=teal"],
    );
    assert!(output.status.success());
    assert_eq!(stdout(&output), "teal");
}

#[cfg(unix)]
#[test]
fn exec_timeout_fails_with_status_one() {
    let home = TempDir::new().unwrap();
    let output = runbox(&home, &["exec", "-c", "sleep 30", "--timeout", "1"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("timed out"));
}

#[test]
fn exec_sandbox_on_host_is_rejected() {
    let home = TempDir::new().unwrap();
    let output = runbox(&home, &["exec", "-c", "true", "-e", "host", "--sandbox"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("sandbox"));
}

#[test]
fn unknown_engine_is_reported() {
    let home = TempDir::new().unwrap();
    let output = runbox(&home, &["exec", "-c", "true", "-e", "mainframe"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("engine not found: mainframe"));
}

#[test]
fn init_writes_config_and_refuses_overwrite() {
    let home = TempDir::new().unwrap();
    let output = runbox(&home, &["init"]);
    assert!(output.status.success());

    let path = home.path().join("runbox").join("config.toml");
    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.contains("[defaults]"));
    assert!(contents.contains("[agent]"));

    let again = runbox(&home, &["init"]);
    assert!(!again.status.success());
    assert!(String::from_utf8_lossy(&again.stderr).contains("already exists"));

    let forced = runbox(&home, &["init", "--force"]);
    assert!(forced.status.success());
}

#[cfg(unix)]
#[test]
fn config_file_default_engine_is_used() {
    let home = TempDir::new().unwrap();
    let dir = home.path().join("runbox");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("config.toml"), "[defaults]\nengine = \"host\"\n").unwrap();

    let output = runbox(&home, &["exec", "-c", "printf '%s' \"$RUNBOX_ENGINE\""]);
    assert!(output.status.success());
    assert_eq!(stdout(&output), "host");
}

#[test]
fn completions_are_generated() {
    let home = TempDir::new().unwrap();
    let output = runbox(&home, &["completions", "bash"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("runbox"));
}

#[cfg(unix)]
#[tokio::test]
async fn agent_client_runs_through_a_server() {
    let server = runbox_test_utils::spawn_agent_server().await;
    let home = TempDir::new().unwrap();
    let url = server.url();

    let output = tokio::task::spawn_blocking(move || {
        runbox(&home, &["agent", "client", "-s", &url, "-c", "echo remote; exit 3"])
    })
    .await
    .unwrap();

    assert_eq!(stdout(&output), "remote\n");
    assert_eq!(output.status.code(), Some(3));
}
