use chrono::{DateTime, Days, NaiveDate, NaiveTime, TimeZone, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::domain::clock::Clock;
use crate::domain::config::{BookingTarget, ResourceSelection};
use crate::error::{Error, Result};

/// Upper bound on the number of resources a single run may try.
pub const MAX_CANDIDATES: usize = 1_000;

/// One (resource, time window) pair that may be reserved.
///
/// Fields are private so a generated candidate can not be altered on its way
/// through the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    resource_id: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    owner_id: i64,
    attributes: Arc<BTreeMap<String, String>>,
}

impl Candidate {
    pub fn new(resource_id: i64, start: DateTime<Utc>, end: DateTime<Utc>, owner_id: i64, attributes: BTreeMap<String, String>) -> Self {
        Candidate { resource_id, start, end, owner_id, attributes: Arc::new(attributes) }
    }

    pub fn resource_id(&self) -> i64 {
        self.resource_id
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn owner_id(&self) -> i64 {
        self.owner_id
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "resource {} [{} - {}]", self.resource_id, self.start.format("%Y-%m-%d %H:%M"), self.end.format("%H:%M"))
    }
}

/// Expands a [`BookingTarget`] into the ordered list of candidates to try.
///
/// All candidates share the same window: the preferred wall-clock times on
/// `today + booking_horizon_days`, where "today" and the wall-clock times are
/// read in the configured UTC offset. Iteration can be restarted any number of
/// times and always yields the same sequence.
#[derive(Debug, Clone)]
pub struct CandidateGenerator {
    resource_ids: Vec<i64>,
    owner_id: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    attributes: Arc<BTreeMap<String, String>>,
}

impl CandidateGenerator {
    pub fn new(target: &BookingTarget, clock: &dyn Clock) -> Result<Self> {
        let resource_ids = match &target.resources {
            ResourceSelection::Range { start, end } => {
                if start > end {
                    return Err(Error::config(format!("resource range {}..={} is empty", start, end)));
                }
                let size = end.checked_sub(*start).and_then(|span| usize::try_from(span).ok()).and_then(|span| span.checked_add(1));
                if size.is_none_or(|size| size > MAX_CANDIDATES) {
                    return Err(Error::config(format!("resource range {}..={} exceeds {} resources", start, end, MAX_CANDIDATES)));
                }
                (*start..=*end).collect::<Vec<i64>>()
            }
            ResourceSelection::Explicit(ids) => {
                if ids.is_empty() {
                    return Err(Error::config("selected resource list is empty"));
                }
                if ids.len() > MAX_CANDIDATES {
                    return Err(Error::config(format!("{} selected resources exceed the limit of {}", ids.len(), MAX_CANDIDATES)));
                }
                ids.clone()
            }
        };

        check_window(target)?;

        let today = clock.now().with_timezone(&target.utc_offset).date_naive();
        let booking_day = today
            .checked_add_days(Days::new(u64::from(target.booking_horizon_days)))
            .ok_or_else(|| Error::config(format!("booking horizon of {} days overflows the calendar", target.booking_horizon_days)))?;

        let start = to_utc(target, booking_day, target.preferred_start)?;
        let end = to_utc(target, booking_day, target.preferred_end)?;

        Ok(CandidateGenerator { resource_ids, owner_id: target.owner_id, start, end, attributes: Arc::new(target.attributes.clone()) })
    }

    pub fn len(&self) -> usize {
        self.resource_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resource_ids.is_empty()
    }

    pub fn window(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.start, self.end)
    }

    pub fn candidates(&self) -> impl Iterator<Item = Candidate> + '_ {
        self.resource_ids.iter().map(move |&resource_id| Candidate {
            resource_id,
            start: self.start,
            end: self.end,
            owner_id: self.owner_id,
            attributes: Arc::clone(&self.attributes),
        })
    }

    pub fn to_vec(&self) -> Vec<Candidate> {
        self.candidates().collect()
    }
}

fn check_window(target: &BookingTarget) -> Result<()> {
    if target.preferred_start >= target.preferred_end {
        return Err(Error::config(format!(
            "preferred start {} must be before preferred end {}",
            target.preferred_start.format("%H:%M"),
            target.preferred_end.format("%H:%M")
        )));
    }

    let openable = target.opens..=target.closes;
    for (label, time) in [("start", target.preferred_start), ("end", target.preferred_end)] {
        if !openable.contains(&time) {
            return Err(Error::config(format!(
                "preferred {} {} is outside the portal's openable hours {} - {}",
                label,
                time.format("%H:%M"),
                target.opens.format("%H:%M"),
                target.closes.format("%H:%M")
            )));
        }
    }

    Ok(())
}

fn to_utc(target: &BookingTarget, day: NaiveDate, time: NaiveTime) -> Result<DateTime<Utc>> {
    target
        .utc_offset
        .from_local_datetime(&day.and_time(time))
        .single()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| Error::config(format!("{} {} can not be mapped to UTC", day, time.format("%H:%M"))))
}
