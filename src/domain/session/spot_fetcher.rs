//! Discovery of schedules (libraries) and bookable spots, used by the `spots`
//! command to help operators pick resource ids.

use regex::Regex;
use scraper::{Html, Selector};
use std::collections::HashMap;
use std::sync::LazyLock;

use crate::domain::session::portal_client::{PortalSession, PortalSessionClient};
use crate::error::{Error, Result};

static RESOURCE_PUSH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)reservationResources\.push\(\{([^}]+)\}\);").expect("static regex is valid"));

static JS_PROPERTY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^\s*["']?([A-Za-z_][A-Za-z0-9_]*)["']?\s*:\s*(.*?)\s*,?\s*$"#).expect("static regex is valid"));

const UNKNOWN_SCHEDULE: &str = "Unknown";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    pub id: i64,
    pub name: String,
    pub selected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingSpot {
    pub id: i64,
    pub name: String,
    pub schedule_id: i64,
    pub schedule_name: String,
    pub href: String,
    pub can_book: bool,
}

/// Reads schedule pages with an authenticated session.
pub struct SpotFetcher<'a> {
    client: &'a PortalSessionClient,
    session: &'a PortalSession,
}

impl<'a> SpotFetcher<'a> {
    pub fn new(client: &'a PortalSessionClient, session: &'a PortalSession) -> Self {
        SpotFetcher { client, session }
    }

    async fn get_page(&self, url: reqwest::Url) -> Result<String> {
        Ok(self.session.http.get(url).send().await?.error_for_status()?.text().await?)
    }

    pub async fn fetch_schedules(&self) -> Result<Vec<Schedule>> {
        let html = self.get_page(self.client.portal().schedule_url()?).await?;
        parse_schedules(&html)
    }

    pub async fn fetch_spots_for_schedule(&self, schedule_id: i64) -> Result<Vec<BookingSpot>> {
        let html = self.get_page(self.client.portal().schedule_resources_url(schedule_id)?).await?;
        parse_spots(&html, schedule_id)
    }

    /// Spots of every schedule, keyed by schedule name. Schedules that fail to
    /// load are logged and skipped.
    pub async fn fetch_all_spots(&self) -> Result<HashMap<String, Vec<BookingSpot>>> {
        let mut all_spots = HashMap::new();

        for schedule in self.fetch_schedules().await? {
            match self.fetch_spots_for_schedule(schedule.id).await {
                Ok(spots) if !spots.is_empty() => {
                    all_spots.insert(schedule.name, spots);
                }
                Ok(_) => log::debug!("Schedule {} ({}) lists no spots.", schedule.id, schedule.name),
                Err(e) => log::warn!("Could not fetch spots for schedule {} ({}): {}", schedule.id, schedule.name, e),
            }
        }

        Ok(all_spots)
    }

    /// Case-insensitive substring search over spot names of all schedules.
    pub async fn search_spots(&self, term: &str) -> Result<Vec<BookingSpot>> {
        let all_spots = self.fetch_all_spots().await?;
        Ok(filter_spots(all_spots.into_values().flatten(), term))
    }
}

pub fn filter_spots(spots: impl IntoIterator<Item = BookingSpot>, term: &str) -> Vec<BookingSpot> {
    let needle = term.to_lowercase();
    let mut matching: Vec<BookingSpot> = spots.into_iter().filter(|spot| spot.name.to_lowercase().contains(&needle)).collect();
    matching.sort_by(|a, b| (&a.schedule_name, &a.name).cmp(&(&b.schedule_name, &b.name)));
    matching
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| Error::config(format!("invalid selector '{}': {}", css, e)))
}

/// Options of the `#schedules` drop-down; entries without a positive id are skipped.
pub fn parse_schedules(html: &str) -> Result<Vec<Schedule>> {
    let document = Html::parse_document(html);
    let options = selector("select#schedules option")?;

    Ok(document
        .select(&options)
        .filter_map(|option| {
            let id = option.value().attr("value")?.trim().parse::<i64>().ok().filter(|id| *id > 0)?;
            let name = option.text().collect::<String>().trim().to_string();
            Some(Schedule { id, name, selected: option.value().attr("selected").is_some() })
        })
        .collect())
}

/// Spots declared through `reservationResources.push({...});` calls, sorted by name.
pub fn parse_spots(html: &str, schedule_id: i64) -> Result<Vec<BookingSpot>> {
    let schedule_name = parse_schedules(html)?
        .into_iter()
        .find(|schedule| schedule.selected)
        .map(|schedule| schedule.name)
        .unwrap_or_else(|| UNKNOWN_SCHEDULE.to_string());

    let mut spots: Vec<BookingSpot> = RESOURCE_PUSH
        .captures_iter(html)
        .filter_map(|captures| {
            let properties = parse_js_object(captures.get(1)?.as_str());
            let id = properties.get("id")?.parse::<i64>().ok()?;
            let name = properties.get("name")?.clone();

            Some(BookingSpot {
                id,
                name,
                schedule_id,
                schedule_name: schedule_name.clone(),
                href: properties.get("href").cloned().unwrap_or_default(),
                can_book: properties.get("canBook").is_none_or(|value| value.eq_ignore_ascii_case("true")),
            })
        })
        .collect();

    spots.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(spots)
}

/// Flat `key: value` pairs, one per line, with surrounding quotes removed.
fn parse_js_object(body: &str) -> HashMap<String, String> {
    body.lines()
        .filter_map(|line| {
            let captures = JS_PROPERTY.captures(line)?;
            let key = captures.get(1)?.as_str().to_string();
            let value = unquote(captures.get(2)?.as_str()).to_string();
            Some((key, value))
        })
        .collect()
}

fn unquote(value: &str) -> &str {
    let trimmed = value.trim();
    ['"', '\'']
        .iter()
        .find_map(|quote| trimmed.strip_prefix(*quote).and_then(|rest| rest.strip_suffix(*quote)))
        .unwrap_or(trimmed)
}
