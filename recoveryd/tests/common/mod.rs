use std::path::Path;
use std::process::{Command, Output};

pub use recovery_common::testing::init_test_logging;

pub fn assert_contains(haystack: &str, needle: &str) {
    assert!(
        haystack.contains(needle),
        "Expected to find '{needle}' in output, got: {haystack}"
    );
}

/// Run the `recovery` binary with a scratch state directory and no ambient config.
pub fn recovery(state_dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_recovery"))
        .args(args)
        .env_remove("VLLM_RECOVERY_CONFIG")
        .env_remove("RUST_LOG")
        .env("VLLM_RECOVERY_STATE_FILE", state_dir.join("state.json"))
        .env("VLLM_RECOVERY_HISTORY_FILE", state_dir.join("history.jsonl"))
        .env("VLLM_RECOVERY_LOG_LEVEL", "warn")
        .output()
        .expect("Failed to run recovery")
}

pub fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

pub fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}
