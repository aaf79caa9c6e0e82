//! Process-wide defaults and environment knobs.

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE_NAME: &str = ".habitat";

/// 20 MiB parts for ranged downloads.
pub const FILE_PART_SIZE: u64 = 20 * 1024 * 1024;

const DEFAULT_HTTP_CONCURRENCY: usize = 50;
const DEFAULT_MAX_DEPENDENCY_WAIT_SECS: u64 = 1200;

pub fn debug_enabled() -> bool {
    std::env::var("HABITAT_DEBUG").map(|v| v == "true").unwrap_or(false)
}

pub fn compatible_check_enabled() -> bool {
    std::env::var("HABITAT_COMPATIBLE_CHECK").map(|v| v != "false").unwrap_or(true)
}

pub fn http_concurrency() -> usize {
    std::env::var("HABITAT_CONCURRENCY")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_HTTP_CONCURRENCY)
}

pub fn max_dependency_wait() -> Duration {
    let secs = std::env::var("HABITAT_MAX_DEPENDENCY_WAIT_TIME")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_MAX_DEPENDENCY_WAIT_SECS);
    Duration::from_secs(secs)
}

/// `$HOME/.habitat_cache`, falling back to the system temp dir when no home
/// directory can be resolved.
pub fn default_cache_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join(".habitat_cache")
}

pub fn user_config_storage_path() -> PathBuf {
    default_cache_dir().join("meta").join("config")
}
