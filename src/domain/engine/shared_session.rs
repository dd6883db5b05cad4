use std::sync::Arc;
use tokio::sync::Mutex;

use crate::domain::config::Credentials;
use crate::domain::session::SessionClient;
use crate::error::Error;

struct SessionSlot<S> {
    current: Arc<S>,
    generation: u64,
    refreshes_left: u32,
}

/// Answer of [`SharedSession::refresh`].
#[derive(Debug)]
pub enum Refresh<S> {
    /// A session newer than the rejected one is available, either because
    /// this call re-authenticated or because another lane already did.
    Ready { session: Arc<S>, generation: u64 },
    /// The refresh budget of the run is used up.
    BudgetExhausted,
    /// Re-authentication itself failed.
    Failed(Error),
}

/// The one session of a run, shared by all lanes.
///
/// Each re-authentication bumps a generation counter. A lane reports the
/// generation it saw rejected; if a newer one exists it is reused instead of
/// logging in again. The slot lock is held across the login so concurrent
/// lanes wait for one refresh instead of starting their own.
pub struct SharedSession<S> {
    slot: Mutex<SessionSlot<S>>,
}

/// A run re-authenticates once; a refreshed session that is rejected again ends it.
pub const SESSION_REFRESHES_PER_RUN: u32 = 1;

impl<S> SharedSession<S> {
    /// Starts from a session that was just logged in.
    pub fn new(session: S) -> Self {
        Self::with_budget(session, SESSION_REFRESHES_PER_RUN)
    }

    /// Starts from a session restored from disk. Replacing a stale restored
    /// session stands in for the initial login and does not use up the run's
    /// refresh.
    pub fn restored(session: S) -> Self {
        Self::with_budget(session, SESSION_REFRESHES_PER_RUN + 1)
    }

    fn with_budget(session: S, refreshes: u32) -> Self {
        SharedSession { slot: Mutex::new(SessionSlot { current: Arc::new(session), generation: 0, refreshes_left: refreshes }) }
    }

    pub async fn current(&self) -> (Arc<S>, u64) {
        let slot = self.slot.lock().await;
        (Arc::clone(&slot.current), slot.generation)
    }

    pub async fn refresh<C>(&self, rejected_generation: u64, client: &C, credentials: &Credentials) -> Refresh<S>
    where
        C: SessionClient<Session = S> + ?Sized,
    {
        let mut slot = self.slot.lock().await;

        if slot.generation > rejected_generation {
            log::debug!("Session generation {} was already replaced by {}, reusing it.", rejected_generation, slot.generation);
            return Refresh::Ready { session: Arc::clone(&slot.current), generation: slot.generation };
        }

        if slot.refreshes_left == 0 {
            return Refresh::BudgetExhausted;
        }
        slot.refreshes_left -= 1;

        log::info!("Session rejected, re-authenticating ({} refresh(es) left afterwards)...", slot.refreshes_left);
        match client.authenticate(credentials).await {
            Ok(session) => {
                slot.current = Arc::new(session);
                slot.generation += 1;
                log::info!("Session refreshed, now at generation {}.", slot.generation);
                Refresh::Ready { session: Arc::clone(&slot.current), generation: slot.generation }
            }
            Err(e) => Refresh::Failed(e),
        }
    }
}
