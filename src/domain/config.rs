use chrono::{FixedOffset, NaiveTime};
use reqwest::Url;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::api::booking_config_dto::{BookingConfigDto, BookingDto, EngineDto, PortalDto, TimeOfDayDto};
use crate::domain::engine::retry_policy::BackoffPolicy;
use crate::error::{Error, Result};
use crate::loader::parser::parse_json_file;

pub const ENV_USERNAME: &str = "UZH_USERNAME";
pub const ENV_PASSWORD: &str = "UZH_PASSWORD";
pub const ENV_TOTP_SECRET: &str = "UZH_TOTP_SECRET";

/// Credentials file in the working directory unless told otherwise.
pub const DEFAULT_ENV_FILE: &str = ".env";

/// A run races an opening booking window; a day is far beyond any useful deadline.
pub const MAX_RUN_DEADLINE_SECS: u64 = 24 * 60 * 60;

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.3.1 Safari/605.1.15";

/// Validated booking configuration, the explicit context every run is built from.
#[derive(Debug, Clone)]
pub struct BookingConfig {
    pub portal: PortalConfig,
    pub booking: BookingTarget,
    pub engine: EngineConfig,
}

/// Where the portal lives and how to talk to it.
#[derive(Debug, Clone)]
pub struct PortalConfig {
    /// Always ends with a `/`.
    pub base_url: Url,
    pub browser_timezone: String,
    pub request_timeout: Duration,
    pub user_agent: String,
}

/// What to book: which resources, at which time of day, for whom.
#[derive(Debug, Clone)]
pub struct BookingTarget {
    pub owner_id: i64,
    pub resources: ResourceSelection,
    pub preferred_start: NaiveTime,
    pub preferred_end: NaiveTime,
    pub booking_horizon_days: u32,
    pub utc_offset: FixedOffset,
    pub opens: NaiveTime,
    pub closes: NaiveTime,
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceSelection {
    /// Inclusive on both ends.
    Range { start: i64, end: i64 },
    /// Operator-chosen ids, tried in the listed order.
    Explicit(Vec<i64>),
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_concurrency: usize,
    pub max_transient_retries: u32,
    pub backoff: BackoffPolicy,
    pub run_deadline: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_concurrency: 4,
            max_transient_retries: 3,
            backoff: BackoffPolicy::default(),
            run_deadline: Duration::from_secs(120),
        }
    }
}

/// Loads and validates a booking configuration file.
pub fn load_booking_config(path: impl AsRef<Path>) -> Result<BookingConfig> {
    let dto: BookingConfigDto = parse_json_file(path.as_ref())?;
    let config = BookingConfig::try_from(dto)?;
    log::debug!("Booking configuration loaded from '{}'.", path.as_ref().display());
    Ok(config)
}

impl TryFrom<BookingConfigDto> for BookingConfig {
    type Error = Error;

    fn try_from(dto: BookingConfigDto) -> Result<Self> {
        Ok(BookingConfig {
            portal: PortalConfig::try_from(dto.portal)?,
            booking: BookingTarget::try_from(dto.booking)?,
            engine: EngineConfig::try_from(dto.engine)?,
        })
    }
}

impl TryFrom<PortalDto> for PortalConfig {
    type Error = Error;

    fn try_from(dto: PortalDto) -> Result<Self> {
        let mut raw_url = dto.base_url.trim().to_string();
        if !raw_url.ends_with('/') {
            raw_url.push('/');
        }
        let base_url = Url::parse(&raw_url).map_err(|e| Error::config(format!("portal.baseUrl '{}' is not a valid URL: {}", dto.base_url, e)))?;

        if dto.request_timeout_secs == 0 {
            return Err(Error::config("portal.requestTimeoutSecs must be at least 1"));
        }

        Ok(PortalConfig {
            base_url,
            browser_timezone: dto.browser_timezone,
            request_timeout: Duration::from_secs(dto.request_timeout_secs),
            user_agent: dto.user_agent.unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
        })
    }
}

impl PortalConfig {
    fn endpoint(&self, relative: &str) -> Result<Url> {
        self.base_url.join(relative).map_err(|e| Error::config(format!("cannot build portal URL for '{}': {}", relative, e)))
    }

    pub fn login_page_url(&self) -> Result<Url> {
        self.endpoint("index.php")
    }

    pub fn login_action_url(&self) -> Result<Url> {
        self.endpoint("index.php")
    }

    pub fn tfa_validate_url(&self) -> Result<Url> {
        self.endpoint("auth/confirm-account.php?action=Confirm")
    }

    pub fn reservation_create_url(&self) -> Result<Url> {
        self.endpoint("api/reservation.php?action=create")
    }

    pub fn schedule_url(&self) -> Result<Url> {
        self.endpoint("schedule.php")
    }

    pub fn schedule_resources_url(&self, schedule_id: i64) -> Result<Url> {
        self.endpoint(&format!("schedule.php?sid={}", schedule_id))
    }

    /// Value of the `Origin` header, the base URL without trailing slash.
    pub fn origin(&self) -> String {
        self.base_url.as_str().trim_end_matches('/').to_string()
    }

    /// Scheme and host only, sent as `Origin` by the reservation form.
    pub fn site_origin(&self) -> String {
        self.base_url.origin().ascii_serialization()
    }
}

impl TryFrom<BookingDto> for BookingTarget {
    type Error = Error;

    fn try_from(dto: BookingDto) -> Result<Self> {
        let resources = if !dto.selected_resource_ids.is_empty() {
            let mut ids = Vec::with_capacity(dto.selected_resource_ids.len());
            for id in dto.selected_resource_ids {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
            ResourceSelection::Explicit(ids)
        } else if let Some(range) = dto.resource_range {
            ResourceSelection::Range { start: range.start, end: range.end }
        } else {
            return Err(Error::config("booking needs either resourceRange or selectedResourceIds"));
        };

        let utc_offset = dto
            .utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| Error::config(format!("booking.utcOffsetMinutes {} is out of range", dto.utc_offset_minutes)))?;

        let mut attributes = BTreeMap::new();
        for attribute in dto.attribute_values {
            if attributes.insert(attribute.id.clone(), attribute.value).is_some() {
                return Err(Error::config(format!("attribute id '{}' is configured more than once", attribute.id)));
            }
        }

        Ok(BookingTarget {
            owner_id: dto.owner_id,
            resources,
            preferred_start: to_naive_time(dto.preferred_start, "booking.preferredStart")?,
            preferred_end: to_naive_time(dto.preferred_end, "booking.preferredEnd")?,
            booking_horizon_days: dto.booking_horizon_days,
            utc_offset,
            opens: to_naive_time(dto.openable_hours.opens, "booking.openableHours.opens")?,
            closes: to_naive_time(dto.openable_hours.closes, "booking.openableHours.closes")?,
            attributes,
        })
    }
}

impl TryFrom<EngineDto> for EngineConfig {
    type Error = Error;

    fn try_from(dto: EngineDto) -> Result<Self> {
        if dto.max_concurrency == 0 {
            return Err(Error::config("engine.maxConcurrency must be at least 1"));
        }
        if dto.run_deadline_secs == 0 || dto.run_deadline_secs > MAX_RUN_DEADLINE_SECS {
            return Err(Error::config(format!(
                "engine.runDeadlineSecs must be between 1 and {}, got {}",
                MAX_RUN_DEADLINE_SECS, dto.run_deadline_secs
            )));
        }

        Ok(EngineConfig {
            max_concurrency: dto.max_concurrency,
            max_transient_retries: dto.max_transient_retries,
            backoff: BackoffPolicy::new(Duration::from_millis(dto.backoff_initial_ms), Duration::from_millis(dto.backoff_max_ms)),
            run_deadline: Duration::from_secs(dto.run_deadline_secs),
        })
    }
}

fn to_naive_time(dto: TimeOfDayDto, field: &str) -> Result<NaiveTime> {
    NaiveTime::from_hms_opt(dto.hour, dto.minute, 0)
        .ok_or_else(|| Error::config(format!("{} {:02}:{:02} is not a valid time of day", field, dto.hour, dto.minute)))
}

/// Portal login credentials, read once at startup.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub totp_secret: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>, totp_secret: impl Into<String>) -> Self {
        Credentials { username: username.into(), password: password.into(), totp_secret: totp_secret.into() }
    }

    /// Reads `UZH_USERNAME`, `UZH_PASSWORD` and `UZH_TOTP_SECRET` from the
    /// environment, with the dotenv file `env_file` as fallback.
    ///
    /// Variables already set in the process environment take precedence over
    /// the file. A missing file is not an error, a malformed one is.
    pub fn from_env_file(env_file: impl AsRef<Path>) -> Result<Self> {
        Self::from_file_and_lookup(env_file, |key| std::env::var(key).ok())
    }

    /// Values from `lookup` win over the file's, blank ones count as unset.
    pub fn from_file_and_lookup(env_file: impl AsRef<Path>, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let file_values = read_env_file(env_file.as_ref())?;
        Self::from_lookup(|key| lookup(key).filter(|value| !value.trim().is_empty()).or_else(|| file_values.get(key).cloned()))
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .ok_or_else(|| Error::config(format!("credential {} is not set", key)))
        };

        Ok(Credentials { username: read(ENV_USERNAME)?, password: read(ENV_PASSWORD)?, totp_secret: read(ENV_TOTP_SECRET)? })
    }
}

fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    if !path.exists() {
        log::debug!("No credentials file at '{}'.", path.display());
        return Ok(HashMap::new());
    }

    let malformed = |e: dotenvy::Error| Error::config(format!("cannot read credentials file '{}': {}", path.display(), e));
    let values = dotenvy::from_path_iter(path).map_err(malformed)?.collect::<std::result::Result<HashMap<_, _>, _>>().map_err(malformed)?;
    log::debug!("Read {} variable(s) from '{}'.", values.len(), path.display());
    Ok(values)
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials").field("username", &self.username).field("password", &"***").field("totp_secret", &"***").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn minimal_dto() -> BookingConfigDto {
        serde_json::from_str(
            r#"{
                "booking": {
                    "ownerId": 1843,
                    "resourceRange": { "start": 231, "end": 262 },
                    "preferredStart": { "hour": 6, "minute": 30 },
                    "preferredEnd": { "hour": 16, "minute": 30 },
                    "attributeValues": [ { "id": "1", "value": "WWF" } ]
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_defaults_are_applied() {
        let config = BookingConfig::try_from(minimal_dto()).unwrap();

        assert_eq!(config.portal.base_url.as_str(), "https://ubbooked01.ub.uzh.ch/ub/Web/");
        assert_eq!(config.portal.request_timeout, Duration::from_secs(15));
        assert_eq!(config.booking.booking_horizon_days, 7);
        assert_eq!(config.booking.utc_offset, FixedOffset::east_opt(0).unwrap());
        assert_eq!(config.booking.resources, ResourceSelection::Range { start: 231, end: 262 });
        assert_eq!(config.booking.attributes.get("1").map(String::as_str), Some("WWF"));
        assert_eq!(config.engine.max_concurrency, 4);
        assert_eq!(config.engine.max_transient_retries, 3);
        assert_eq!(config.engine.run_deadline, Duration::from_secs(120));
    }

    #[test]
    fn test_portal_urls_are_joined_onto_base() {
        let mut dto = minimal_dto();
        dto.portal.base_url = "http://127.0.0.1:8080/ub/Web".to_string();
        let portal = PortalConfig::try_from(dto.portal).unwrap();

        assert_eq!(portal.reservation_create_url().unwrap().as_str(), "http://127.0.0.1:8080/ub/Web/api/reservation.php?action=create");
        assert_eq!(portal.tfa_validate_url().unwrap().as_str(), "http://127.0.0.1:8080/ub/Web/auth/confirm-account.php?action=Confirm");
        assert_eq!(portal.schedule_resources_url(12).unwrap().as_str(), "http://127.0.0.1:8080/ub/Web/schedule.php?sid=12");
        assert_eq!(portal.origin(), "http://127.0.0.1:8080/ub/Web");
    }

    #[test]
    fn test_selected_ids_override_range_and_drop_duplicates() {
        let mut dto = minimal_dto();
        dto.booking.selected_resource_ids = vec![240, 233, 240, 250];
        let target = BookingTarget::try_from(dto.booking).unwrap();

        assert_eq!(target.resources, ResourceSelection::Explicit(vec![240, 233, 250]));
    }

    #[test]
    fn test_missing_resources_is_config_error() {
        let mut dto = minimal_dto();
        dto.booking.resource_range = None;
        assert!(matches!(BookingTarget::try_from(dto.booking), Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_invalid_time_of_day_is_config_error() {
        let mut dto = minimal_dto();
        dto.booking.preferred_end = TimeOfDayDto { hour: 25, minute: 0 };
        assert!(matches!(BookingTarget::try_from(dto.booking), Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_duplicate_attribute_is_config_error() {
        let mut dto = minimal_dto();
        dto.booking.attribute_values.push(crate::api::booking_config_dto::AttributeValueDto { id: "1".to_string(), value: "MNF".to_string() });
        assert!(matches!(BookingTarget::try_from(dto.booking), Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_zero_concurrency_is_config_error() {
        let mut dto = minimal_dto();
        dto.engine.max_concurrency = 0;
        assert!(matches!(BookingConfig::try_from(dto), Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_run_deadline_outside_bounds_is_config_error() {
        for secs in [0, MAX_RUN_DEADLINE_SECS + 1, u64::MAX] {
            let mut dto = minimal_dto();
            dto.engine.run_deadline_secs = secs;
            assert!(matches!(BookingConfig::try_from(dto), Err(Error::ConfigError(_))), "{} should be rejected", secs);
        }

        let mut dto = minimal_dto();
        dto.engine.run_deadline_secs = MAX_RUN_DEADLINE_SECS;
        assert_eq!(BookingConfig::try_from(dto).unwrap().engine.run_deadline, Duration::from_secs(MAX_RUN_DEADLINE_SECS));
    }

    #[test]
    fn test_huge_utc_offset_is_config_error() {
        for minutes in [40_000_000, i32::MIN, 24 * 60] {
            let mut dto = minimal_dto();
            dto.booking.utc_offset_minutes = minutes;
            assert!(matches!(BookingTarget::try_from(dto.booking), Err(Error::ConfigError(_))), "{} should be rejected", minutes);
        }
    }

    #[test]
    fn test_refresh_budget_key_is_ignored() {
        let dto: BookingConfigDto = serde_json::from_str(
            r#"{
                "booking": { "ownerId": 1, "resourceRange": { "start": 1, "end": 2 },
                    "preferredStart": { "hour": 8, "minute": 0 }, "preferredEnd": { "hour": 9, "minute": 0 } },
                "engine": { "maxSessionRefreshes": 3 }
            }"#,
        )
        .unwrap();
        assert!(BookingConfig::try_from(dto).is_ok());
    }

    #[test]
    fn test_credentials_from_lookup() {
        let env: HashMap<&str, &str> = HashMap::from([(ENV_USERNAME, "jdoe"), (ENV_PASSWORD, "hunter2"), (ENV_TOTP_SECRET, " JBSWY3DPEHPK3PXP ")]);
        let credentials = Credentials::from_lookup(|key| env.get(key).map(|v| v.to_string())).unwrap();

        assert_eq!(credentials.username, "jdoe");
        assert_eq!(credentials.totp_secret, "JBSWY3DPEHPK3PXP");
        assert!(!format!("{:?}", credentials).contains("hunter2"));
        assert!(!format!("{:?}", credentials).contains("JBSWY3DPEHPK3PXP"));
    }

    #[test]
    fn test_credentials_from_env_file() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join(".env");
        fs::write(&env_file, format!("# portal login\n{}=jdoe\n{}=\"hunter2\"\n{}=JBSWY3DPEHPK3PXP\n", ENV_USERNAME, ENV_PASSWORD, ENV_TOTP_SECRET))
            .unwrap();

        let from_file = Credentials::from_file_and_lookup(&env_file, |_| None).unwrap();
        assert_eq!(from_file.username, "jdoe");
        assert_eq!(from_file.password, "hunter2");
        assert_eq!(from_file.totp_secret, "JBSWY3DPEHPK3PXP");

        let overridden = Credentials::from_file_and_lookup(&env_file, |key| (key == ENV_USERNAME).then(|| "admin".to_string())).unwrap();
        assert_eq!(overridden.username, "admin");
        assert_eq!(overridden.password, "hunter2");
    }

    #[test]
    fn test_missing_env_file_falls_back_to_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let env: HashMap<&str, &str> = HashMap::from([(ENV_USERNAME, "jdoe"), (ENV_PASSWORD, "hunter2"), (ENV_TOTP_SECRET, "JBSWY3DPEHPK3PXP")]);

        let credentials = Credentials::from_file_and_lookup(dir.path().join(".env"), |key| env.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(credentials.username, "jdoe");
    }

    #[test]
    fn test_malformed_env_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join(".env");
        fs::write(&env_file, "UZH_USERNAME='unterminated\n").unwrap();

        assert!(matches!(Credentials::from_file_and_lookup(&env_file, |_| None), Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_missing_credential_is_config_error() {
        let env: HashMap<&str, &str> = HashMap::from([(ENV_USERNAME, "jdoe"), (ENV_PASSWORD, "")]);
        let credentials = Credentials::from_lookup(|key| env.get(key).map(|v| v.to_string()));

        match credentials {
            Err(Error::ConfigError(message)) => assert!(message.contains(ENV_PASSWORD)),
            other => panic!("expected config error, got {:?}", other),
        }
    }
}
