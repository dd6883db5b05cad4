//! Turns the portal's answers into [`Outcome`]s.
//!
//! Everything here depends on the exact wording of the portal (German and
//! English UI). When the portal changes a message, classification silently
//! falls back to `Conflict(Other)`; keep the phrase lists below in sync.

use scraper::Html;

use crate::api::reservation_dto::ReservationResponseDto;
use crate::domain::outcome::{ConflictReason, Outcome};
use crate::domain::utils::id::BookingReference;

const ALREADY_RESERVED_PHRASES: &[&str] = &[
    "nur eine reservierung zur selben zeit",
    "only one reservation at the same time",
    "only one reservation per time slot",
    "only one reservation is allowed at the same time",
    "you already have a reservation",
    "you have already reserved",
    "sie haben bereits eine reservierung",
];

const SLOT_TAKEN_PHRASES: &[&str] = &[
    "in konflikt stehende reservierungen",
    "conflicting reservations",
    "ist bereits reserviert",
    "ist bereits gebucht",
    "is already reserved",
    "is already booked",
    "already reserved by another",
    "already booked by another",
    "nicht verfügbar",
    "not available",
];

const CSRF_PHRASES: &[&str] = &["csrf"];

const LOGIN_PAGE_MARKERS: &[&str] = &["passcode", "name=\"password\"", "name='password'", "login_token"];

const MAX_DETAIL_CHARS: usize = 200;

/// Classifies one HTTP answer of the reservation endpoint.
pub fn classify_response(status: u16, body: &str) -> Outcome {
    match status {
        401 | 403 => return Outcome::AuthError(format!("HTTP {}: session or CSRF token rejected", status)),
        408 | 425 | 429 | 500..=599 => return Outcome::TransientError(format!("HTTP {}", status)),
        _ => {}
    }

    if let Ok(response) = serde_json::from_str::<ReservationResponseDto>(body) {
        return classify_json(status, &response);
    }

    classify_text(status, body)
}

/// Classifies a failure that happened before any HTTP answer arrived.
pub fn classify_transport_error(error: &reqwest::Error) -> Outcome {
    if error.is_timeout() {
        Outcome::TransientError(format!("request timed out: {}", error))
    } else if error.is_connect() {
        Outcome::TransientError(format!("connection failed: {}", error))
    } else {
        Outcome::TransientError(error.to_string())
    }
}

fn classify_json(status: u16, response: &ReservationResponseDto) -> Outcome {
    if (200..300).contains(&status) && response.is_booked() {
        let reference = response.reference_number().unwrap_or("unknown");
        return Outcome::Success { booking_reference: BookingReference::new(reference) };
    }

    let messages = response.error_messages();
    let joined = messages.join(" | ");

    if let Some(outcome) = classify_message(&joined) {
        return outcome;
    }

    if joined.trim().is_empty() {
        Outcome::Conflict(ConflictReason::Other(format!("HTTP {}: portal refused the reservation without a reason", status)))
    } else {
        Outcome::Conflict(ConflictReason::Other(truncate(&joined)))
    }
}

fn classify_text(status: u16, body: &str) -> Outcome {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Outcome::TransientError(format!("HTTP {}: empty response body", status));
    }

    let lowered = trimmed.to_lowercase();
    if LOGIN_PAGE_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        return Outcome::AuthError("portal answered with the login page".to_string());
    }

    let text = if trimmed.starts_with('<') { visible_text(trimmed) } else { trimmed.to_string() };

    if let Some(outcome) = classify_message(&text) {
        return outcome;
    }

    Outcome::Conflict(ConflictReason::Other(format!("HTTP {}: {}", status, truncate(&text))))
}

/// Matches a human readable portal message against the known phrases.
///
/// The "one reservation per time slot" check runs first: it ends the whole run,
/// so it must win when a message mentions both.
pub fn classify_message(message: &str) -> Option<Outcome> {
    let normalized = normalize(message);

    if ALREADY_RESERVED_PHRASES.iter().any(|phrase| normalized.contains(phrase)) {
        return Some(Outcome::Conflict(ConflictReason::AlreadyReservedThisTime));
    }
    if SLOT_TAKEN_PHRASES.iter().any(|phrase| normalized.contains(phrase)) {
        return Some(Outcome::Conflict(ConflictReason::SlotTaken));
    }
    if CSRF_PHRASES.iter().any(|phrase| normalized.contains(phrase)) {
        return Some(Outcome::AuthError(truncate(message)));
    }

    None
}

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

fn visible_text(html: &str) -> String {
    let document = Html::parse_document(html);
    document.root_element().text().map(str::trim).filter(|chunk| !chunk.is_empty()).collect::<Vec<_>>().join(" ")
}

fn truncate(text: &str) -> String {
    let cleaned = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.chars().count() <= MAX_DETAIL_CHARS {
        cleaned
    } else {
        format!("{}...", cleaned.chars().take(MAX_DETAIL_CHARS).collect::<String>())
    }
}
