use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue, ORIGIN, REFERER};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Url};
use std::fmt;
use std::sync::Arc;

use crate::api::booking_config_dto::AttributeValueDto;
use crate::api::session_cache_dto::CachedSessionDto;
use crate::api::reservation_dto::{RecurrenceDto, ReservationDetailsDto, ReservationRequestDto};
use crate::domain::candidate::Candidate;
use crate::domain::clock::SharedClock;
use crate::domain::config::{Credentials, PortalConfig};
use crate::domain::outcome::{ConflictReason, Outcome};
use crate::domain::session::SessionClient;
use crate::domain::session::csrf::extract_csrf_token;
use crate::domain::session::response_classifier::{classify_response, classify_transport_error};
use crate::domain::session::totp::generate_totp;
use crate::error::{Error, Result};

const HTML_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
const LOGIN_COOKIE: &str = "login_token";

/// Authenticated state: its own cookie jar plus the CSRF token of the schedule page.
pub struct PortalSession {
    pub(crate) http: Client,
    pub(crate) jar: Arc<Jar>,
    pub(crate) csrf_token: String,
    pub(crate) established_at: DateTime<Utc>,
}

impl PortalSession {
    pub fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }
}

impl fmt::Debug for PortalSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let preview: String = self.csrf_token.chars().take(6).collect();
        f.debug_struct("PortalSession").field("csrf_token", &format!("{}...", preview)).field("established_at", &self.established_at).finish()
    }
}

/// [`SessionClient`] talking to the real booking portal over HTTPS.
#[derive(Debug, Clone)]
pub struct PortalSessionClient {
    portal: PortalConfig,
    clock: SharedClock,
}

impl PortalSessionClient {
    pub fn new(portal: PortalConfig, clock: SharedClock) -> Self {
        PortalSessionClient { portal, clock }
    }

    pub fn portal(&self) -> &PortalConfig {
        &self.portal
    }

    /// Every session gets a fresh client so a refresh never inherits stale cookies.
    fn build_http_client(&self) -> Result<(Client, Arc<Jar>)> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(HTML_ACCEPT));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));

        let jar = Arc::new(Jar::default());
        let http = Client::builder()
            .default_headers(headers)
            .user_agent(self.portal.user_agent.clone())
            .cookie_provider(Arc::clone(&jar))
            .timeout(self.portal.request_timeout)
            .build()?;

        Ok((http, jar))
    }

    async fn submit_credentials(&self, http: &Client, credentials: &Credentials) -> Result<(Url, String)> {
        let login_page_url = self.portal.login_page_url()?;

        log::info!("Accessing login page...");
        http.get(login_page_url.clone()).send().await?.error_for_status()?;

        log::info!("Submitting username and password...");
        let login_form = [
            ("email", credentials.username.as_str()),
            ("password", credentials.password.as_str()),
            ("captcha", ""),
            ("login", "submit"),
            ("resume", ""),
            ("language", "en_us"),
        ];

        let response = http
            .post(self.portal.login_action_url()?)
            .header(REFERER, login_page_url.as_str())
            .header(ORIGIN, self.portal.origin())
            .form(&login_form)
            .send()
            .await?
            .error_for_status()?;

        log::info!("Login submission to {}, status: {}", response.url(), response.status());
        let landing_url = response.url().clone();
        let body = response.text().await?;

        Ok((landing_url, body))
    }

    async fn submit_second_factor(&self, http: &Client, login_url: &Url, login_body: &str, credentials: &Credentials) -> Result<()> {
        log::info!("2FA step detected.");
        let csrf_token = extract_csrf_token(login_body)?;

        let unix_time = u64::try_from(self.clock.now().timestamp()).map_err(|_| Error::TotpError("clock is before 1970".to_string()))?;
        let code = generate_totp(&credentials.totp_secret, unix_time)?;

        log::info!("Submitting TOTP code...");
        let response = http
            .post(self.portal.tfa_validate_url()?)
            .header(REFERER, login_url.as_str())
            .header(ORIGIN, self.portal.origin())
            .form(&[("CSRF_TOKEN", csrf_token.as_str()), ("OTP", code.as_str())])
            .send()
            .await?
            .error_for_status()?;

        log::info!("2FA submission to {}, status: {}", response.url(), response.status());
        Ok(())
    }

    async fn fetch_csrf_token(&self, http: &Client) -> Result<String> {
        log::info!("Fetching CSRF token from schedule page...");
        let body = http.get(self.portal.base_url.clone()).send().await?.error_for_status()?.text().await?;
        let token = extract_csrf_token(&body)?;
        log::info!("Fetched CSRF token: {}...", token.chars().take(10).collect::<String>());
        Ok(token)
    }

    /// `name=value` pairs the jar would send to the portal.
    fn portal_cookies(&self, jar: &Jar) -> Vec<String> {
        jar.cookies(&self.portal.base_url)
            .and_then(|header| header.to_str().map(str::to_string).ok())
            .map(|cookies| cookies.split(';').map(str::trim).filter(|cookie| !cookie.is_empty()).map(str::to_string).collect())
            .unwrap_or_default()
    }

    fn has_login_cookie(&self, jar: &Jar) -> bool {
        self.portal_cookies(jar).iter().any(|cookie| cookie.starts_with(&format!("{}=", LOGIN_COOKIE)))
    }

    fn build_form(&self, session: &PortalSession, candidate: &Candidate) -> Result<Form> {
        let payload = build_reservation_request(candidate, self.clock.now());
        let request_part = Part::text(serde_json::to_string(&payload)?).mime_str("application/json")?;

        Ok(Form::new()
            .part("request", request_part)
            .text("CSRF_TOKEN", session.csrf_token.clone())
            .text("BROWSER_TIMEZONE", self.portal.browser_timezone.clone()))
    }
}

#[async_trait]
impl SessionClient for PortalSessionClient {
    type Session = PortalSession;

    async fn authenticate(&self, credentials: &Credentials) -> Result<PortalSession> {
        let (http, jar) = self.build_http_client()?;

        let (landing_url, body) = self.submit_credentials(&http, credentials).await?;

        if body.to_lowercase().contains("passcode") {
            self.submit_second_factor(&http, &landing_url, &body, credentials).await?;
        } else {
            log::info!("2FA not required.");
        }

        if !self.has_login_cookie(&jar) {
            log::warn!("Login may have failed - {} not found in cookies.", LOGIN_COOKIE);
            return Err(Error::auth(format!("login rejected for user '{}': no {} cookie was issued", credentials.username, LOGIN_COOKIE)));
        }
        log::info!("Login successful!");

        let csrf_token = self.fetch_csrf_token(&http).await?;

        Ok(PortalSession { http, jar, csrf_token, established_at: self.clock.now() })
    }

    async fn attempt_reservation(&self, session: &PortalSession, candidate: &Candidate) -> Outcome {
        let url = match self.portal.reservation_create_url() {
            Ok(url) => url,
            Err(e) => return Outcome::Conflict(ConflictReason::Other(e.to_string())),
        };
        let form = match self.build_form(session, candidate) {
            Ok(form) => form,
            Err(e) => return Outcome::Conflict(ConflictReason::Other(format!("could not build reservation request: {}", e))),
        };

        let referer = self.portal.schedule_url().map(String::from).unwrap_or_else(|_| self.portal.origin());

        let request = session
            .http
            .post(url)
            .header("X-Csrf-Token", session.csrf_token.as_str())
            .header("X-Requested-With", "XMLHttpRequest")
            .header(ORIGIN, self.portal.site_origin())
            .header(REFERER, referer)
            .multipart(form);

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return classify_transport_error(&e),
        };

        let status = response.status().as_u16();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return classify_transport_error(&e),
        };
        log::debug!("Reservation response for {}: HTTP {} {}", candidate, status, body.chars().take(500).collect::<String>());

        classify_response(status, &body)
    }

    fn export_session(&self, session: &PortalSession) -> Option<CachedSessionDto> {
        let cookies = self.portal_cookies(&session.jar);
        if cookies.is_empty() {
            return None;
        }
        Some(CachedSessionDto {
            saved_at: session.established_at.timestamp(),
            base_url: self.portal.base_url.to_string(),
            csrf_token: session.csrf_token.clone(),
            cookies,
        })
    }

    fn restore_session(&self, cached: &CachedSessionDto) -> Result<PortalSession> {
        if cached.base_url != self.portal.base_url.as_str() {
            return Err(Error::auth(format!("cached session belongs to {}", cached.base_url)));
        }

        let (http, jar) = self.build_http_client()?;
        for cookie in &cached.cookies {
            jar.add_cookie_str(&format!("{}; Path=/", cookie), &self.portal.base_url);
        }
        if !self.has_login_cookie(&jar) {
            return Err(Error::auth(format!("cached session has no {} cookie", LOGIN_COOKIE)));
        }

        let established_at = DateTime::from_timestamp(cached.saved_at, 0).unwrap_or_else(|| self.clock.now());
        Ok(PortalSession { http, jar, csrf_token: cached.csrf_token.clone(), established_at })
    }
}

/// Builds the JSON document the portal's reservation form would send for `candidate`.
pub fn build_reservation_request(candidate: &Candidate, now: DateTime<Utc>) -> ReservationRequestDto {
    let attribute_values = candidate.attributes().iter().map(|(id, value)| AttributeValueDto { id: id.clone(), value: value.clone() }).collect();

    ReservationRequestDto {
        reservation: ReservationDetailsDto {
            reference_number: None,
            owner_id: candidate.owner_id(),
            resource_ids: vec![candidate.resource_id().to_string()],
            accessories: Vec::new(),
            title: String::new(),
            description: String::new(),
            start: format_portal_time(candidate.start()),
            end: format_portal_time(candidate.end()),
            recurrence: RecurrenceDto::none(),
            start_reminder: None,
            end_reminder: None,
            invitee_ids: Vec::new(),
            co_owner_ids: Vec::new(),
            participant_ids: Vec::new(),
            guest_emails: Vec::new(),
            participant_emails: Vec::new(),
            allow_self_join: false,
            attachments: Vec::new(),
            requires_approval: false,
            checkin_date: None,
            checkout_date: None,
            terms_accepted_date: format_portal_time(now),
            attribute_values,
            meeting_link: None,
            display_color: None,
        },
        retry_parameters: Vec::new(),
        update_scope: "full".to_string(),
    }
}

fn format_portal_time(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}
