use chrono::{DateTime, FixedOffset, NaiveTime, TimeDelta, Utc};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::aggregator::AcquisitionResult;
use crate::domain::candidate::{Candidate, CandidateGenerator};
use crate::domain::clock::{Clock, SystemClock};
use crate::domain::config::{BookingConfig, Credentials, EngineConfig, load_booking_config};
use crate::domain::engine::acquisition_engine::AcquisitionEngine;
use crate::domain::session::SessionClient;
use crate::domain::session::session_cache::SessionCache;
use crate::error::Result;

pub mod api;
pub mod domain;
pub mod error;
pub mod loader;
pub mod logger;

/// Loads and validates a config file and expands it into candidates.
///
/// No network activity happens here, every `ConfigError` surfaces before the
/// first request.
pub fn prepare_run(config_path: impl AsRef<Path>, clock: &dyn Clock) -> Result<(BookingConfig, CandidateGenerator)> {
    let config = load_booking_config(config_path.as_ref())?;
    log::info!("Configuration '{}' parsed successfully.", config_path.as_ref().display());

    let generator = CandidateGenerator::new(&config.booking, clock)?;
    let (start, end) = generator.window();
    log::info!("Generated {} candidate(s) for {} - {}.", generator.len(), start.format("%Y-%m-%d %H:%M UTC"), end.format("%H:%M UTC"));

    Ok((config, generator))
}

/// How far ahead a `--start-at` time that lies just behind "now" is still
/// taken to mean tomorrow, e.g. 00:00:05 asked for at 23:58.
pub const START_AT_ROLLOVER_MINUTES: i64 = 15;

/// Wall-clock time at which the race starts, read in the booking's UTC offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartAt {
    pub time: NaiveTime,
    pub utc_offset: FixedOffset,
}

impl StartAt {
    pub fn new(time: NaiveTime, utc_offset: FixedOffset) -> Self {
        StartAt { time, utc_offset }
    }

    /// Time to wait from `now`. A time earlier today is zero, unless its next
    /// occurrence is at most [`START_AT_ROLLOVER_MINUTES`] away.
    pub fn wait_from(&self, now: DateTime<Utc>) -> Duration {
        let local_now = now.with_timezone(&self.utc_offset).naive_local();
        let today = local_now.date().and_time(self.time);
        if today >= local_now {
            return (today - local_now).to_std().unwrap_or(Duration::ZERO);
        }

        let until_tomorrow = today + TimeDelta::days(1) - local_now;
        if until_tomorrow <= TimeDelta::minutes(START_AT_ROLLOVER_MINUTES) { until_tomorrow.to_std().unwrap_or(Duration::ZERO) } else { Duration::ZERO }
    }
}

/// Knobs of [`book`] beyond the engine configuration.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub start_at: Option<StartAt>,
    /// Reuse and refresh the session stored here instead of always logging in.
    pub session_cache: Option<SessionCache>,
    /// Log in even if the cache holds a usable session. The new one is still cached.
    pub force_login: bool,
}

/// Authenticates (or restores a cached session), optionally waits for the
/// booking window, then races for a seat.
///
/// Only a failed initial login is returned as `Err`; everything that happens
/// during the race ends up in the [`AcquisitionResult`].
pub async fn book<C: SessionClient>(
    client: Arc<C>,
    credentials: Credentials,
    engine_config: EngineConfig,
    candidates: Vec<Candidate>,
    options: &RunOptions,
) -> Result<AcquisitionResult> {
    let cache = options.session_cache.as_ref();

    let cached = cache.filter(|_| !options.force_login).and_then(|cache| restore_cached_session(client.as_ref(), cache));
    let (session, restored) = match cached {
        Some(session) => (session, true),
        None => {
            log::info!("Authenticating as '{}'...", credentials.username);
            let session = client.authenticate(&credentials).await?;
            if let Some(cache) = cache {
                store_session(client.as_ref(), cache, &session);
            }
            (session, false)
        }
    };

    if let Some(start_at) = options.start_at {
        let wait = start_at.wait_from(Utc::now());
        if wait.is_zero() {
            log::info!("Start time {} has already passed, starting immediately.", start_at.time.format("%H:%M:%S"));
        } else {
            log::info!("Session ready, waiting {:.1}s until {} ({}).", wait.as_secs_f64(), start_at.time.format("%H:%M:%S"), start_at.utc_offset);
            tokio::time::sleep(wait).await;
        }
    }

    let engine = AcquisitionEngine::new(client, credentials, engine_config);
    let result = if restored { engine.run_restored(candidates, session).await } else { engine.run(candidates, session).await };

    // The cached session was rejected twice, the next run has to log in.
    if let Some(cache) = cache.filter(|_| result.is_fatal()) {
        if let Err(e) = cache.clear() {
            log::warn!("Could not remove stale session cache '{}': {}", cache.path().display(), e);
        }
    }

    Ok(result)
}

fn restore_cached_session<C: SessionClient>(client: &C, cache: &SessionCache) -> Option<C::Session> {
    let cached = cache.load(&SystemClock)?;
    match client.restore_session(&cached) {
        Ok(session) => Some(session),
        Err(e) => {
            log::warn!("Cached session can not be used, logging in instead: {}", e);
            None
        }
    }
}

fn store_session<C: SessionClient>(client: &C, cache: &SessionCache, session: &C::Session) {
    let Some(cached) = client.export_session(session) else {
        return;
    };
    if let Err(e) = cache.save(&cached) {
        log::warn!("Could not cache session at '{}': {}", cache.path().display(), e);
    }
}
