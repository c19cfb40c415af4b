//! Test logging.
//!
//! Events go through the libtest writer, so they are shown only for failing
//! tests. The level defaults to `debug` for this workspace's crates and can
//! be changed with `VLLM_RECOVERY_TEST_LOG_LEVEL` or `RUST_LOG`.

use tracing_subscriber::EnvFilter;

const CRATES: [&str; 3] = ["recovery_common", "recoveryd", "recovery"];

fn test_filter() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = std::env::var("VLLM_RECOVERY_TEST_LOG_LEVEL").unwrap_or_else(|_| "debug".into());
    let directives = CRATES
        .iter()
        .map(|krate| format!("{krate}={level}"))
        .collect::<Vec<_>>()
        .join(",");
    EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install a test-writer subscriber. Safe to call from every test.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_target(true)
        .with_env_filter(test_filter())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_test_logging();
        init_test_logging();
        tracing::debug!(target: "recovery_common", "logging initialized twice");
    }

    #[test]
    fn filter_covers_every_workspace_crate() {
        let rendered = test_filter().to_string();
        if std::env::var("RUST_LOG").is_err() {
            for krate in CRATES {
                assert!(rendered.contains(krate), "{rendered}");
            }
        }
    }
}
