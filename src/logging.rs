//! Logging setup shared by both binaries.
//!
//! File-piped `env_logger`, matching the teacher convention of keeping
//! daemon stdout free for interactive use: logs go to a file resolved from
//! an explicit override, the config dir, or a test-mode tmp path, in that
//! order. Level is controlled by `RUST_LOG`, defaulting to `info`.

use std::fs;
use std::path::PathBuf;

/// Initialize logging for a binary named `bin_name` (used to pick the log
/// file name, e.g. `overlord-agent.log`).
///
/// # Panics
///
/// Panics if the log file cannot be created — without a log sink a daemon
/// silently losing its diagnostics is worse than failing fast at startup.
pub fn init(bin_name: &str) {
    let log_path = log_file_path(bin_name);
    let log_file = fs::File::create(&log_path)
        .unwrap_or_else(|e| panic!("failed to create log file at {log_path:?}: {e}"));

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Pipe(Box::new(log_file)))
        .format_timestamp_secs()
        .init();

    log::info!("{bin_name} logging to {log_path:?}");
}

fn log_file_path(bin_name: &str) -> PathBuf {
    if let Ok(path) = std::env::var("OVERLORD_LOG_FILE") {
        return PathBuf::from(path);
    }
    if crate::env::is_test_mode() {
        return PathBuf::from(env!("CARGO_MANIFEST_DIR")).join(format!("tmp/{bin_name}.log"));
    }
    match crate::config::config_dir() {
        Ok(dir) => dir.join(format!("{bin_name}.log")),
        Err(_) => PathBuf::from(format!("/tmp/{bin_name}.log")),
    }
}
