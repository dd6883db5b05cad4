use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use library_seat_booker::api::session_cache_dto::CachedSessionDto;
use library_seat_booker::domain::candidate::Candidate;
use library_seat_booker::domain::config::Credentials;
use library_seat_booker::domain::outcome::Outcome;
use library_seat_booker::domain::session::SessionClient;
use library_seat_booker::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockSession {
    pub generation: u32,
}

/// In-memory portal: answers come from per-resource scripts, sessions older
/// than `valid_from` are rejected with an authentication error.
#[derive(Debug)]
pub struct ScriptedClient {
    scripts: Mutex<HashMap<i64, VecDeque<Outcome>>>,
    default_outcome: Outcome,
    valid_from: u32,
    fail_login: bool,
    attempt_delay: Duration,
    login_delay: Duration,
    logins: AtomicU32,
    calls: Mutex<Vec<(i64, u32)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedClient {
    pub fn new(default_outcome: Outcome) -> Self {
        ScriptedClient {
            scripts: Mutex::new(HashMap::new()),
            default_outcome,
            valid_from: 0,
            fail_login: false,
            attempt_delay: Duration::ZERO,
            login_delay: Duration::ZERO,
            logins: AtomicU32::new(0),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Outcomes returned for `resource_id`, in order, before falling back to the default.
    pub fn script(self, resource_id: i64, outcomes: Vec<Outcome>) -> Self {
        self.scripts.lock().unwrap().insert(resource_id, outcomes.into());
        self
    }

    pub fn valid_from(mut self, generation: u32) -> Self {
        self.valid_from = generation;
        self
    }

    pub fn failing_login(mut self) -> Self {
        self.fail_login = true;
        self
    }

    pub fn attempt_delay(mut self, delay: Duration) -> Self {
        self.attempt_delay = delay;
        self
    }

    pub fn login_delay(mut self, delay: Duration) -> Self {
        self.login_delay = delay;
        self
    }

    pub fn logins(&self) -> u32 {
        self.logins.load(Ordering::SeqCst)
    }

    /// (resource id, session generation) of every attempt, in call order.
    pub fn calls(&self) -> Vec<(i64, u32)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, resource_id: i64) -> usize {
        self.calls().iter().filter(|(id, _)| *id == resource_id).count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionClient for ScriptedClient {
    type Session = MockSession;

    async fn authenticate(&self, _credentials: &Credentials) -> Result<MockSession> {
        let generation = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.login_delay).await;

        if self.fail_login {
            return Err(Error::auth("invalid passcode"));
        }
        Ok(MockSession { generation })
    }

    async fn attempt_reservation(&self, session: &MockSession, candidate: &Candidate) -> Outcome {
        self.calls.lock().unwrap().push((candidate.resource_id(), session.generation));
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        tokio::time::sleep(self.attempt_delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if session.generation < self.valid_from {
            return Outcome::AuthError("session expired".to_string());
        }

        let scripted = self.scripts.lock().unwrap().get_mut(&candidate.resource_id()).and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| self.default_outcome.clone())
    }

    fn export_session(&self, session: &MockSession) -> Option<CachedSessionDto> {
        Some(cached_session(session.generation, Utc::now().timestamp()))
    }

    fn restore_session(&self, cached: &CachedSessionDto) -> Result<MockSession> {
        let generation = cached.csrf_token.strip_prefix("generation-").and_then(|g| g.parse().ok());
        generation.map(|generation| MockSession { generation }).ok_or_else(|| Error::auth("not a mock session"))
    }
}

/// Snapshot the mock would export for a session of `generation`.
pub fn cached_session(generation: u32, saved_at: i64) -> CachedSessionDto {
    CachedSessionDto {
        saved_at,
        base_url: "mock://portal/".to_string(),
        csrf_token: format!("generation-{}", generation),
        cookies: vec!["login_token=mock".to_string()],
    }
}

pub fn credentials() -> Credentials {
    Credentials::new("student", "hunter2", "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ")
}

pub fn candidates(resource_ids: impl IntoIterator<Item = i64>) -> Vec<Candidate> {
    let start = Utc.with_ymd_and_hms(2024, 5, 20, 6, 30, 0).unwrap();
    let end = Utc.with_ymd_and_hms(2024, 5, 20, 16, 30, 0).unwrap();
    resource_ids.into_iter().map(|id| Candidate::new(id, start, end, 1843, BTreeMap::new())).collect()
}
