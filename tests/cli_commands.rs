//! End-to-end checks of the commands that need no network access.

use std::path::PathBuf;
use std::process::Command;

fn mindforge_bin() -> PathBuf {
    std::env::var("CARGO_BIN_EXE_mindforge")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("target/debug/mindforge"))
}

#[test]
fn providers_lists_the_catalogue() {
    let output = Command::new(mindforge_bin())
        .arg("providers")
        .output()
        .expect("mindforge providers");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for name in ["OpenAI", "Groq", "Anthropic", "Google Gemini", "OPENAI_API_KEY"] {
        assert!(stdout.contains(name), "missing {} in {}", name, stdout);
    }
}

#[test]
fn status_without_configured_servers_is_not_connected() {
    let tmp = tempfile::tempdir().expect("temp dir");
    let output = Command::new(mindforge_bin())
        .args(["status", "--config"])
        .arg(tmp.path().join("mcp.json"))
        .output()
        .expect("mindforge status");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("MCP not connected"), "stdout: {}", stdout);
}

#[test]
fn run_without_credentials_fails_before_any_request() {
    let output = Command::new(mindforge_bin())
        .args(["run", "--provider", "anthropic", "hello"])
        .env_remove("AI_API_KEY")
        .env_remove("ANTHROPIC_API_KEY")
        .output()
        .expect("mindforge run");
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("ANTHROPIC_API_KEY"), "stderr: {}", stderr);
}

#[test]
fn unknown_provider_is_rejected() {
    let output = Command::new(mindforge_bin())
        .args(["run", "--provider", "nope", "hello"])
        .output()
        .expect("mindforge run");
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Unknown provider 'nope'"));
}
