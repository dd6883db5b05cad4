//! Keeps an authenticated session on disk so the next run can skip the login.
//!
//! A cron job racing an opening window loses seconds to the password and TOTP
//! round trips. The snapshot is only a head start: the engine still replaces
//! a stale one through its normal re-authentication path.

use chrono::Duration as ChronoDuration;
use std::fs;
use std::path::{Path, PathBuf};

use crate::api::session_cache_dto::CachedSessionDto;
use crate::domain::clock::Clock;
use crate::error::Result;
use crate::loader::parser::parse_json_file;

pub const DEFAULT_SESSION_CACHE: &str = ".session_cache.json";

/// Portal sessions stay valid for a working day; older snapshots are ignored.
pub const SESSION_CACHE_MAX_AGE_HOURS: i64 = 6;

#[derive(Debug, Clone)]
pub struct SessionCache {
    path: PathBuf,
    max_age: ChronoDuration,
}

impl SessionCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SessionCache { path: path.into(), max_age: ChronoDuration::hours(SESSION_CACHE_MAX_AGE_HOURS) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the stored snapshot if it is younger than the maximum age.
    /// A missing or unreadable file is a cache miss.
    pub fn load(&self, clock: &dyn Clock) -> Option<CachedSessionDto> {
        if !self.path.exists() {
            log::debug!("No cached session at '{}'.", self.path.display());
            return None;
        }

        let cached: CachedSessionDto = match parse_json_file(&self.path) {
            Ok(cached) => cached,
            Err(e) => {
                log::warn!("Ignoring unreadable session cache '{}': {}", self.path.display(), e);
                return None;
            }
        };

        let age = clock.now().timestamp() - cached.saved_at;
        if age < 0 || age > self.max_age.num_seconds() {
            log::info!("Cached session is {}s old, logging in again.", age);
            return None;
        }

        log::info!("Using cached session from {}s ago.", age);
        Some(cached)
    }

    pub fn save(&self, cached: &CachedSessionDto) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(cached)?)?;
        log::debug!("Session cached at '{}'.", self.path.display());
        Ok(())
    }

    /// Removes the snapshot; a missing file is not an error.
    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
