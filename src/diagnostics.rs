//! Diagnostics for the dashboard.
//!
//! Provides:
//! - **About info**: version, build timestamp, git SHA, platform
//! - **Health**: backend configuration, session, sync loops, cached snapshots
//! - **Log rotation helpers**: used by `lib.rs` to configure rolling log files.

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::context::AppContext;
use crate::db::{self, SnapshotInfo};
use crate::storage;
use crate::sync::{self, SyncStatus};

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// File name prefix of the rolling log files.
pub const LOG_FILE_PREFIX: &str = "dashboard";

const APP_DIR_NAME: &str = "com.bellaflor.dashboard";

// ---------------------------------------------------------------------------
// About info
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AboutInfo {
    pub version: &'static str,
    pub build_timestamp: &'static str,
    pub git_sha: &'static str,
    pub platform: &'static str,
    pub arch: &'static str,
}

/// Returns version, build timestamp, git SHA, and platform info.
pub fn about_info() -> AboutInfo {
    AboutInfo {
        version: env!("CARGO_PKG_VERSION"),
        build_timestamp: env!("BUILD_TIMESTAMP"),
        git_sha: env!("BUILD_GIT_SHA"),
        platform: std::env::consts::OS,
        arch: std::env::consts::ARCH,
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub backend_url: String,
    pub credentials_stored: bool,
    pub signed_in_as: Option<String>,
    pub sync: SyncStatus,
    pub cache_schema_version: Option<i32>,
    pub cached: Vec<SnapshotInfo>,
}

pub fn health(ctx: &AppContext) -> HealthReport {
    let (cache_schema_version, cached) = match ctx.cache.as_ref() {
        Some(cache) => {
            let version = db::schema_version(cache)
                .map_err(|e| warn!(error = %e, "cannot read cache schema version"))
                .ok();
            let cached = db::snapshot_summaries(cache).unwrap_or_else(|e| {
                warn!(error = %e, "cannot read cached snapshots");
                Vec::new()
            });
            (version, cached)
        }
        None => (None, Vec::new()),
    };
    HealthReport {
        backend_url: ctx.config.supabase_url.clone(),
        credentials_stored: storage::is_configured(),
        signed_in_as: ctx.auth.email(),
        sync: sync::status(ctx),
        cache_schema_version,
        cached,
    }
}

// ---------------------------------------------------------------------------
// Log rotation
// ---------------------------------------------------------------------------

/// Returns the log directory path (same location used by lib.rs).
pub fn log_dir() -> PathBuf {
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join(APP_DIR_NAME).join("logs")
}

/// Prune old log files in the default log directory.
pub fn prune_old_logs() {
    prune_logs_in(&log_dir(), MAX_LOG_FILES);
}

/// Keep only the `keep` most recently modified log files in `dir`.
pub fn prune_logs_in(dir: &Path, keep: usize) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = entries
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            let name = path.file_name()?.to_str()?;
            if !path.is_file() || !name.starts_with(LOG_FILE_PREFIX) {
                return None;
            }
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(std::time::UNIX_EPOCH);
            Some((path, modified))
        })
        .collect();

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
        }
    }
    removed
}
