use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::domain::candidate::Candidate;
use crate::domain::outcome::{ConflictReason, Outcome};
use crate::domain::utils::id::{BookingReference, RunId};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortCause {
    /// The portal allows one reservation per time slot and the user already holds one.
    TerminalConflict,
    /// The session could not be (re-)established.
    Auth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalStatus {
    Succeeded,
    Exhausted,
    Aborted(AbortCause),
}

impl fmt::Display for FinalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinalStatus::Succeeded => write!(f, "SUCCEEDED"),
            FinalStatus::Exhausted => write!(f, "EXHAUSTED"),
            FinalStatus::Aborted(AbortCause::TerminalConflict) => write!(f, "ABORTED (already reserved for this time)"),
            FinalStatus::Aborted(AbortCause::Auth) => write!(f, "ABORTED (authentication failed)"),
        }
    }
}

/// One finished round trip against the portal.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    pub candidate: Candidate,
    /// 1-based attempt number for this candidate.
    pub attempt: u32,
    pub outcome: Outcome,
    /// Time since run start when the outcome arrived.
    pub elapsed: Duration,
}

/// What the engine should do after an outcome was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The run is still open; the lane handles the outcome itself.
    Continue,
    /// This outcome decided the run.
    Stop,
    /// The run was already decided; the outcome was set aside.
    Discarded,
}

/// Collects outcomes in arrival order and decides when the run is over.
///
/// Precedence is `Succeeded > Aborted > Exhausted`: a success that lands after
/// an abort still wins, because the portal did book the seat. Anything else
/// arriving after the decision goes to the discarded list.
#[derive(Debug)]
pub struct OutcomeAggregator {
    run_id: RunId,
    started_at: Instant,
    decided: Option<FinalStatus>,
    winner: Option<(Candidate, BookingReference)>,
    attempts: Vec<AttemptRecord>,
    discarded: Vec<AttemptRecord>,
    deadline_expired: bool,
}

impl OutcomeAggregator {
    pub fn new(run_id: RunId) -> Self {
        OutcomeAggregator {
            run_id,
            started_at: Instant::now(),
            decided: None,
            winner: None,
            attempts: Vec::new(),
            discarded: Vec::new(),
            deadline_expired: false,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_decided(&self) -> bool {
        self.decided.is_some()
    }

    pub fn status(&self) -> Option<FinalStatus> {
        self.decided
    }

    pub fn record(&mut self, candidate: Candidate, attempt: u32, outcome: Outcome) -> Decision {
        let record = AttemptRecord { candidate, attempt, outcome, elapsed: self.elapsed() };

        match self.decided {
            None => self.record_open(record),
            Some(FinalStatus::Aborted(_)) if record.outcome.is_success() => {
                log::warn!("Run {}: {} succeeded after the run was aborted; keeping the booking.", self.run_id.as_str(), record.candidate);
                self.accept_success(record);
                Decision::Stop
            }
            Some(_) => {
                if let Outcome::Success { booking_reference } = &record.outcome {
                    log::warn!(
                        "Run {}: discarding late success for {} (booking reference {}). Check the portal, this booking may need to be cancelled.",
                        self.run_id.as_str(),
                        record.candidate,
                        booking_reference.as_str()
                    );
                } else {
                    log::debug!("Run {}: discarding late outcome {} for {}.", self.run_id.as_str(), record.outcome, record.candidate);
                }
                self.discarded.push(record);
                Decision::Discarded
            }
        }
    }

    fn record_open(&mut self, record: AttemptRecord) -> Decision {
        match &record.outcome {
            Outcome::Success { .. } => {
                self.accept_success(record);
                Decision::Stop
            }
            Outcome::Conflict(ConflictReason::AlreadyReservedThisTime) => {
                self.decided = Some(FinalStatus::Aborted(AbortCause::TerminalConflict));
                self.attempts.push(record);
                Decision::Stop
            }
            _ => {
                self.attempts.push(record);
                Decision::Continue
            }
        }
    }

    fn accept_success(&mut self, record: AttemptRecord) {
        if let Outcome::Success { booking_reference } = &record.outcome {
            self.winner = Some((record.candidate.clone(), booking_reference.clone()));
        }
        self.decided = Some(FinalStatus::Succeeded);
        self.attempts.push(record);
    }

    /// Fatal authentication failure. Has no effect once the run is decided.
    pub fn abort_auth(&mut self) {
        if self.decided.is_none() {
            self.decided = Some(FinalStatus::Aborted(AbortCause::Auth));
        }
    }

    pub fn mark_deadline_expired(&mut self) {
        self.deadline_expired = true;
    }

    pub fn finish(self) -> AcquisitionResult {
        let elapsed = self.elapsed();
        let (winning_candidate, booking_reference) = match self.winner {
            Some((candidate, reference)) => (Some(candidate), Some(reference)),
            None => (None, None),
        };

        AcquisitionResult {
            run_id: self.run_id,
            final_status: self.decided.unwrap_or(FinalStatus::Exhausted),
            winning_candidate,
            booking_reference,
            attempts_log: self.attempts,
            discarded: self.discarded,
            deadline_expired: self.deadline_expired,
            elapsed,
        }
    }
}

/// Final report of one run.
#[derive(Debug, Clone)]
pub struct AcquisitionResult {
    pub run_id: RunId,
    pub final_status: FinalStatus,
    pub winning_candidate: Option<Candidate>,
    pub booking_reference: Option<BookingReference>,
    pub attempts_log: Vec<AttemptRecord>,
    pub discarded: Vec<AttemptRecord>,
    pub deadline_expired: bool,
    pub elapsed: Duration,
}

#[derive(Debug, Serialize)]
struct AttemptRow<'a> {
    run_id: &'a str,
    resource_id: i64,
    start: String,
    end: String,
    attempt: u32,
    outcome: &'static str,
    detail: String,
    elapsed_ms: u64,
    discarded: bool,
}

impl AcquisitionResult {
    pub fn is_success(&self) -> bool {
        self.final_status == FinalStatus::Succeeded
    }

    /// Only a failed authentication makes the process exit non-zero.
    pub fn is_fatal(&self) -> bool {
        self.final_status == FinalStatus::Aborted(AbortCause::Auth)
    }

    /// Distinct refusal reasons in the order they were first seen.
    pub fn conflict_reasons(&self) -> Vec<String> {
        let mut reasons: Vec<String> = Vec::new();
        for record in &self.attempts_log {
            let reason = match &record.outcome {
                Outcome::Conflict(reason) => reason.to_string(),
                Outcome::TransientError(cause) => format!("transient error: {}", cause),
                Outcome::AuthError(cause) => format!("authentication error: {}", cause),
                Outcome::Success { .. } => continue,
            };
            if !reasons.contains(&reason) {
                reasons.push(reason);
            }
        }
        reasons
    }

    pub fn summary(&self) -> String {
        let mut lines = vec![format!("Run {} finished: {} after {} attempt(s) in {:.1}s", self.run_id.as_str(), self.final_status, self.attempts_log.len(), self.elapsed.as_secs_f64())];

        match (&self.winning_candidate, &self.booking_reference) {
            (Some(candidate), Some(reference)) => lines.push(format!("Booked {} (reference {})", candidate, reference.as_str())),
            _ => {
                let reasons = self.conflict_reasons();
                if reasons.is_empty() {
                    lines.push("No attempt was answered by the portal.".to_string());
                } else {
                    lines.push("Reasons:".to_string());
                    lines.extend(reasons.into_iter().map(|reason| format!("  - {}", reason)));
                }
            }
        }

        if self.deadline_expired {
            lines.push("The run deadline expired before all candidates were tried.".to_string());
        }
        if !self.discarded.is_empty() {
            lines.push(format!("{} late outcome(s) were discarded.", self.discarded.len()));
        }

        lines.join("\n")
    }

    /// Writes the attempts log, discarded outcomes last, as `;`-separated CSV.
    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = File::create(path.as_ref())?;
        let mut writer = csv::WriterBuilder::new().delimiter(b';').from_writer(file);

        let rows = self.attempts_log.iter().map(|record| (record, false)).chain(self.discarded.iter().map(|record| (record, true)));
        for (record, discarded) in rows {
            writer.serialize(AttemptRow {
                run_id: self.run_id.as_str(),
                resource_id: record.candidate.resource_id(),
                start: record.candidate.start().to_rfc3339(),
                end: record.candidate.end().to_rfc3339(),
                attempt: record.attempt,
                outcome: record.outcome.kind(),
                detail: record.outcome.detail(),
                elapsed_ms: u64::try_from(record.elapsed.as_millis()).unwrap_or(u64::MAX),
                discarded,
            })?;
        }

        writer.flush()?;
        log::info!("Attempt report written to '{}'.", path.as_ref().display());
        Ok(())
    }
}
