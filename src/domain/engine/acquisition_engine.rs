//! The race for a seat.
//!
//! Every candidate runs in its own lane, a small state machine that attempts
//! the reservation, backs off on transient errors and refreshes the shared
//! session on authentication errors. Lanes are started in candidate order with
//! at most `max_concurrency` of them active at once. The first lane whose
//! outcome decides the run cancels all others; requests already on the wire
//! are allowed to finish and their outcomes end up in the discarded list.

use futures::StreamExt;
use futures::stream;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::domain::aggregator::{AcquisitionResult, Decision, OutcomeAggregator};
use crate::domain::candidate::Candidate;
use crate::domain::config::{Credentials, EngineConfig};
use crate::domain::engine::shared_session::{Refresh, SharedSession};
use crate::domain::outcome::Outcome;
use crate::domain::session::SessionClient;
use crate::domain::utils::id::RunId;

/// Life cycle of one candidate inside a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateState {
    /// Never attempted, the run was decided or timed out first.
    Pending,
    InFlight,
    /// Failed transiently or with a rejected session, will be tried again.
    Retryable,
    Succeeded,
    /// Refused, out of retries, or stopped because the run was decided.
    Terminal,
}

enum LaneStep {
    Attempt,
    Backoff { retry: u32 },
    Reauthenticate { rejected_generation: u64 },
    Done(CandidateState),
}

pub struct AcquisitionEngine<C: SessionClient> {
    client: Arc<C>,
    credentials: Credentials,
    config: EngineConfig,
}

impl<C: SessionClient> AcquisitionEngine<C> {
    pub fn new(client: Arc<C>, credentials: Credentials, config: EngineConfig) -> Self {
        AcquisitionEngine { client, credentials, config }
    }

    /// Races through `candidates` with an already authenticated `session`.
    pub async fn run(&self, candidates: Vec<Candidate>, session: C::Session) -> AcquisitionResult {
        self.run_with_id(RunId::generate(), candidates, session).await
    }

    pub async fn run_with_id(&self, run_id: RunId, candidates: Vec<Candidate>, session: C::Session) -> AcquisitionResult {
        self.race(run_id, candidates, SharedSession::new(session)).await
    }

    /// Like [`run`](Self::run), for a session restored from the on-disk cache
    /// that may already have expired.
    pub async fn run_restored(&self, candidates: Vec<Candidate>, session: C::Session) -> AcquisitionResult {
        self.race(RunId::generate(), candidates, SharedSession::restored(session)).await
    }

    async fn race(&self, run_id: RunId, candidates: Vec<Candidate>, session: SharedSession<C::Session>) -> AcquisitionResult {
        log::info!(
            "Run {}: starting with {} candidate(s), concurrency {}, {} transient retries, deadline {:?}.",
            run_id.as_str(),
            candidates.len(),
            self.config.max_concurrency,
            self.config.max_transient_retries,
            self.config.run_deadline
        );

        let run = RunContext {
            client: self.client.as_ref(),
            credentials: &self.credentials,
            config: &self.config,
            session,
            aggregator: Mutex::new(OutcomeAggregator::new(run_id)),
            cancel: CancellationToken::new(),
            deadline: deadline_after(Instant::now(), self.config.run_deadline),
        };

        let lanes = candidates.into_iter().map(|candidate| run.run_lane(candidate));
        let states: Vec<CandidateState> = stream::iter(lanes).buffer_unordered(self.config.max_concurrency.max(1)).collect().await;

        let untouched = states.iter().filter(|state| **state == CandidateState::Pending).count();
        if untouched > 0 {
            log::info!("{} candidate(s) were never attempted.", untouched);
        }

        let result = run.into_aggregator().finish();
        log::info!("{}", result.summary());
        result
    }
}

/// `start + run_deadline`, saturating far in the future instead of overflowing.
fn deadline_after(start: Instant, run_deadline: Duration) -> Instant {
    start.checked_add(run_deadline).unwrap_or_else(|| start + FAR_FUTURE)
}

const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

struct RunContext<'a, C: SessionClient> {
    client: &'a C,
    credentials: &'a Credentials,
    config: &'a EngineConfig,
    session: SharedSession<C::Session>,
    aggregator: Mutex<OutcomeAggregator>,
    cancel: CancellationToken,
    deadline: Instant,
}

impl<C: SessionClient> RunContext<'_, C> {
    fn aggregator(&self) -> MutexGuard<'_, OutcomeAggregator> {
        // A panicking lane can not leave the aggregator half-updated, every
        // mutation is a single push or assignment.
        self.aggregator.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn into_aggregator(self) -> OutcomeAggregator {
        self.aggregator.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn deadline_passed(&self) -> bool {
        Instant::now() >= self.deadline
    }

    fn expire(&self) {
        let mut aggregator = self.aggregator();
        if !aggregator.is_decided() {
            aggregator.mark_deadline_expired();
        }
        drop(aggregator);

        if !self.cancel.is_cancelled() {
            log::warn!("Run deadline of {:?} expired, no further attempts will be started.", self.config.run_deadline);
            self.cancel.cancel();
        }
    }

    fn abort_auth(&self, reason: &str) {
        log::error!("Giving up, the portal session can not be restored: {}", reason);
        self.aggregator().abort_auth();
        self.cancel.cancel();
    }

    async fn run_lane(&self, candidate: Candidate) -> CandidateState {
        let mut attempt = 0u32;
        let mut transient_retries = 0u32;
        let mut state = CandidateState::Pending;
        let mut step = LaneStep::Attempt;

        loop {
            step = match step {
                LaneStep::Done(final_state) => return final_state,

                LaneStep::Attempt => {
                    let stopped = if state == CandidateState::Pending { state } else { CandidateState::Terminal };
                    // The session lock may be held by another lane's re-login,
                    // so cancellation and the deadline are raced against it.
                    let current = if self.may_start_attempt() { self.session_for_attempt().await } else { None };

                    if let Some((session, generation)) = current {
                        attempt += 1;
                        state = CandidateState::InFlight;

                        log::info!("Attempt {} for {}...", attempt, candidate);
                        let outcome = self.client.attempt_reservation(&session, &candidate).await;
                        log::info!("Attempt {} for {}: {}", attempt, candidate, outcome);

                        let decision = self.aggregator().record(candidate.clone(), attempt, outcome.clone());
                        match decision {
                            Decision::Stop => {
                                self.cancel.cancel();
                                LaneStep::Done(if outcome.is_success() { CandidateState::Succeeded } else { CandidateState::Terminal })
                            }
                            Decision::Discarded => LaneStep::Done(CandidateState::Terminal),
                            Decision::Continue => match outcome {
                                Outcome::TransientError(_) if transient_retries < self.config.max_transient_retries => {
                                    transient_retries += 1;
                                    LaneStep::Backoff { retry: transient_retries }
                                }
                                Outcome::TransientError(_) => {
                                    log::warn!("Giving up on {} after {} transient failure(s).", candidate, transient_retries + 1);
                                    LaneStep::Done(CandidateState::Terminal)
                                }
                                Outcome::AuthError(_) => LaneStep::Reauthenticate { rejected_generation: generation },
                                Outcome::Conflict(_) | Outcome::Success { .. } => LaneStep::Done(CandidateState::Terminal),
                            },
                        }
                    } else {
                        LaneStep::Done(stopped)
                    }
                }

                LaneStep::Backoff { retry } => {
                    state = CandidateState::Retryable;
                    let delay = self.config.backoff.delay_for(retry);
                    log::debug!("Retrying {} in {:?} (retry {}/{}).", candidate, delay, retry, self.config.max_transient_retries);
                    if self.pause(delay).await { LaneStep::Attempt } else { LaneStep::Done(CandidateState::Terminal) }
                }

                LaneStep::Reauthenticate { rejected_generation } => {
                    state = CandidateState::Retryable;
                    match self.session.refresh(rejected_generation, self.client, self.credentials).await {
                        Refresh::Ready { .. } => LaneStep::Attempt,
                        Refresh::BudgetExhausted => {
                            self.abort_auth("the refreshed session was rejected as well");
                            LaneStep::Done(CandidateState::Terminal)
                        }
                        Refresh::Failed(e) => {
                            self.abort_auth(&e.to_string());
                            LaneStep::Done(CandidateState::Terminal)
                        }
                    }
                }
            };
        }
    }

    /// `false` once the run was decided or the deadline passed.
    fn may_start_attempt(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        if self.deadline_passed() {
            self.expire();
            return false;
        }
        true
    }

    /// Waits for the current session. Gives up with `None` when the run is
    /// decided or the deadline passes while the slot is busy re-authenticating.
    async fn session_for_attempt(&self) -> Option<(Arc<C::Session>, u64)> {
        let current = tokio::select! {
            _ = self.cancel.cancelled() => None,
            _ = tokio::time::sleep_until(self.deadline) => None,
            current = self.session.current() => Some(current),
        };
        if self.may_start_attempt() { current } else { None }
    }

    /// Sleeps for `delay`; returns `false` when the run was decided or the
    /// deadline hit first.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep_until(self.deadline) => {
                self.expire();
                false
            }
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
