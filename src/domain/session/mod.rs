use async_trait::async_trait;

use crate::api::session_cache_dto::CachedSessionDto;
use crate::domain::candidate::Candidate;
use crate::domain::config::Credentials;
use crate::domain::outcome::Outcome;
use crate::error::{Error, Result};

pub mod csrf;
pub mod portal_client;
pub mod response_classifier;
pub mod session_cache;
pub mod spot_fetcher;
pub mod totp;

/// Everything the acquisition engine needs from the booking portal.
///
/// The session type is opaque to callers: the engine only stores it and hands
/// it back. Implementations must not retry inside `attempt_reservation`; one
/// call is one round trip.
#[async_trait]
pub trait SessionClient: Send + Sync {
    type Session: Send + Sync;

    /// Logs in (password plus TOTP second factor) and fetches a fresh CSRF token.
    ///
    /// Fails with `Error::AuthError` on rejected credentials or codes.
    async fn authenticate(&self, credentials: &Credentials) -> Result<Self::Session>;

    /// Submits one reservation and classifies the answer.
    async fn attempt_reservation(&self, session: &Self::Session, candidate: &Candidate) -> Outcome;

    /// Snapshot of `session` for the on-disk cache, `None` if this client
    /// can not persist sessions.
    fn export_session(&self, _session: &Self::Session) -> Option<CachedSessionDto> {
        None
    }

    /// Rebuilds a session from a snapshot without contacting the portal.
    fn restore_session(&self, _cached: &CachedSessionDto) -> Result<Self::Session> {
        Err(Error::auth("this client can not restore cached sessions"))
    }
}
