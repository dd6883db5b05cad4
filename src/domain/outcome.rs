use std::fmt;

use crate::domain::utils::id::BookingReference;

/// Classified result of exactly one reservation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The portal confirmed the reservation.
    Success { booking_reference: BookingReference },

    /// The portal refused the reservation for a business reason.
    Conflict(ConflictReason),

    /// Network trouble, timeouts or server-side hiccups. The same candidate may be tried again.
    TransientError(String),

    /// The session (cookie or CSRF token) is no longer accepted.
    AuthError(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictReason {
    /// Someone else holds this resource for the window. Other resources may still be free.
    SlotTaken,

    /// The owner already has a reservation overlapping this window. No resource can succeed.
    AlreadyReservedThisTime,

    /// Any other refusal, carrying the portal's text.
    Other(String),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    /// Short, stable label used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Outcome::Success { .. } => "success",
            Outcome::Conflict(ConflictReason::SlotTaken) => "slot_taken",
            Outcome::Conflict(ConflictReason::AlreadyReservedThisTime) => "already_reserved_this_time",
            Outcome::Conflict(ConflictReason::Other(_)) => "conflict",
            Outcome::TransientError(_) => "transient_error",
            Outcome::AuthError(_) => "auth_error",
        }
    }

    pub fn detail(&self) -> String {
        match self {
            Outcome::Success { booking_reference } => booking_reference.to_string(),
            Outcome::Conflict(reason) => reason.to_string(),
            Outcome::TransientError(cause) | Outcome::AuthError(cause) => cause.clone(),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success { booking_reference } => write!(f, "booked (reference {})", booking_reference),
            Outcome::Conflict(reason) => write!(f, "conflict: {}", reason),
            Outcome::TransientError(cause) => write!(f, "transient error: {}", cause),
            Outcome::AuthError(cause) => write!(f, "authentication error: {}", cause),
        }
    }
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictReason::SlotTaken => write!(f, "slot already taken by another user"),
            ConflictReason::AlreadyReservedThisTime => write!(f, "only one reservation per time slot allowed"),
            ConflictReason::Other(text) => write!(f, "{}", text),
        }
    }
}
