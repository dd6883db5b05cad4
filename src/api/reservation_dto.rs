use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::booking_config_dto::AttributeValueDto;

/// Body of the `request` part sent to `api/reservation.php?action=create`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationRequestDto {
    pub reservation: ReservationDetailsDto,
    pub retry_parameters: Vec<Value>,
    pub update_scope: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationDetailsDto {
    pub reference_number: Option<String>,
    pub owner_id: i64,
    pub resource_ids: Vec<String>,
    pub accessories: Vec<Value>,
    pub title: String,
    pub description: String,
    pub start: String,
    pub end: String,
    pub recurrence: RecurrenceDto,
    pub start_reminder: Option<Value>,
    pub end_reminder: Option<Value>,
    pub invitee_ids: Vec<i64>,
    pub co_owner_ids: Vec<i64>,
    pub participant_ids: Vec<i64>,
    pub guest_emails: Vec<String>,
    pub participant_emails: Vec<String>,
    pub allow_self_join: bool,
    pub attachments: Vec<Value>,
    pub requires_approval: bool,
    pub checkin_date: Option<String>,
    pub checkout_date: Option<String>,
    pub terms_accepted_date: String,
    pub attribute_values: Vec<AttributeValueDto>,
    pub meeting_link: Option<String>,
    pub display_color: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurrenceDto {
    #[serde(rename = "type")]
    pub typ: String,
    pub interval: u32,
    pub weekdays: Option<Vec<u32>>,
    pub monthly_type: Option<String>,
    pub week_of_month: Option<u32>,
    pub termination_date: Option<String>,
    pub repeat_dates: Vec<String>,
}

impl RecurrenceDto {
    pub fn none() -> Self {
        RecurrenceDto {
            typ: "none".to_string(),
            interval: 1,
            weekdays: None,
            monthly_type: None,
            week_of_month: None,
            termination_date: None,
            repeat_dates: Vec::new(),
        }
    }
}

/// JSON answer of the reservation endpoint.
///
/// A booking only went through if both the outer `success` and `data.success` are true.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationResponseDto {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub data: Option<ReservationResponseDataDto>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationResponseDataDto {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub reference_number: Option<String>,
    #[serde(default)]
    pub errors: Option<Value>,
}

impl ReservationResponseDto {
    pub fn is_booked(&self) -> bool {
        self.success && self.data.as_ref().is_some_and(|data| data.success)
    }

    pub fn reference_number(&self) -> Option<&str> {
        self.data.as_ref().and_then(|data| data.reference_number.as_deref()).filter(|reference| !reference.is_empty())
    }

    /// All error strings the portal reported, `data.errors` first, then `message`.
    pub fn error_messages(&self) -> Vec<String> {
        let mut messages = Vec::new();

        if let Some(errors) = self.data.as_ref().and_then(|data| data.errors.as_ref()) {
            collect_strings(errors, &mut messages);
        }
        if let Some(message) = self.message.as_ref().filter(|m| !m.trim().is_empty()) {
            messages.push(message.clone());
        }

        messages
    }
}

fn collect_strings(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.push(s.clone()),
        Value::Array(items) => items.iter().for_each(|item| collect_strings(item, out)),
        Value::Object(map) => map.values().for_each(|item| collect_strings(item, out)),
        Value::Null => {}
        other => out.push(other.to_string()),
    }
}
