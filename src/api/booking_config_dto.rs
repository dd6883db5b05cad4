use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_URL: &str = "https://ubbooked01.ub.uzh.ch/ub/Web/";
pub const DEFAULT_BROWSER_TIMEZONE: &str = "Europe/Zurich";

/// Root of a booking configuration file.
#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingConfigDto {
    #[serde(default)]
    pub portal: PortalDto,
    pub booking: BookingDto,
    #[serde(default)]
    pub engine: EngineDto,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortalDto {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_browser_timezone")]
    pub browser_timezone: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl Default for PortalDto {
    fn default() -> Self {
        PortalDto {
            base_url: default_base_url(),
            browser_timezone: default_browser_timezone(),
            request_timeout_secs: default_request_timeout_secs(),
            user_agent: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingDto {
    pub owner_id: i64,
    #[serde(default)]
    pub resource_range: Option<ResourceRangeDto>,
    /// Explicit resource ids in preference order. Takes precedence over `resource_range`.
    #[serde(default)]
    pub selected_resource_ids: Vec<i64>,
    pub preferred_start: TimeOfDayDto,
    pub preferred_end: TimeOfDayDto,
    #[serde(default = "default_booking_horizon_days")]
    pub booking_horizon_days: u32,
    #[serde(default)]
    pub utc_offset_minutes: i32,
    #[serde(default)]
    pub openable_hours: OpenableHoursDto,
    #[serde(default)]
    pub attribute_values: Vec<AttributeValueDto>,
}

/// Inclusive range of resource ids, e.g. all seats of one reading room.
#[derive(Debug, Deserialize, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRangeDto {
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Deserialize, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TimeOfDayDto {
    pub hour: u32,
    #[serde(default)]
    pub minute: u32,
}

#[derive(Debug, Deserialize, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenableHoursDto {
    pub opens: TimeOfDayDto,
    pub closes: TimeOfDayDto,
}

impl Default for OpenableHoursDto {
    fn default() -> Self {
        OpenableHoursDto { opens: TimeOfDayDto { hour: 6, minute: 0 }, closes: TimeOfDayDto { hour: 23, minute: 0 } }
    }
}

/// Custom attribute of the portal's reservation form, e.g. the department (`{"id": "1", "value": "WWF"}`).
#[derive(Debug, Deserialize, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AttributeValueDto {
    pub id: String,
    pub value: String,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineDto {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_max_transient_retries")]
    pub max_transient_retries: u32,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_run_deadline_secs")]
    pub run_deadline_secs: u64,
}

impl Default for EngineDto {
    fn default() -> Self {
        EngineDto {
            max_concurrency: default_max_concurrency(),
            max_transient_retries: default_max_transient_retries(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            run_deadline_secs: default_run_deadline_secs(),
        }
    }
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_browser_timezone() -> String {
    DEFAULT_BROWSER_TIMEZONE.to_string()
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_booking_horizon_days() -> u32 {
    7
}

fn default_max_concurrency() -> usize {
    4
}

fn default_max_transient_retries() -> u32 {
    3
}

fn default_backoff_initial_ms() -> u64 {
    250
}

fn default_backoff_max_ms() -> u64 {
    2000
}

fn default_run_deadline_secs() -> u64 {
    120
}

