use chrono::{TimeZone, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use library_seat_booker::api::booking_config_dto::PortalDto;
use library_seat_booker::domain::candidate::Candidate;
use library_seat_booker::domain::clock::FixedClock;
use library_seat_booker::domain::config::{Credentials, PortalConfig};
use library_seat_booker::domain::outcome::{ConflictReason, Outcome};
use library_seat_booker::domain::session::SessionClient;
use library_seat_booker::domain::session::portal_client::PortalSessionClient;
use library_seat_booker::domain::session::spot_fetcher::SpotFetcher;
use library_seat_booker::domain::utils::id::BookingReference;
use library_seat_booker::error::Error;

// RFC 6238 seed; at unix time 59 the six digit code is 287082.
const TOTP_SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

fn client_for(server: &MockServer, timeout_secs: u64) -> PortalSessionClient {
    let dto = PortalDto { base_url: format!("{}/ub/Web/", server.uri()), request_timeout_secs: timeout_secs, ..PortalDto::default() };
    let portal = PortalConfig::try_from(dto).unwrap();
    PortalSessionClient::new(portal, Arc::new(FixedClock::new(Utc.timestamp_opt(59, 0).unwrap())))
}

fn credentials() -> Credentials {
    Credentials::new("student@uzh.ch", "hunter2", TOTP_SECRET)
}

fn candidate() -> Candidate {
    Candidate::new(
        231,
        Utc.with_ymd_and_hms(2024, 5, 20, 6, 30, 0).unwrap(),
        Utc.with_ymd_and_hms(2024, 5, 20, 16, 30, 0).unwrap(),
        1843,
        BTreeMap::from([("1".to_string(), "WWF".to_string())]),
    )
}

async fn mount_login(server: &MockServer, with_second_factor: bool) {
    Mock::given(method("GET"))
        .and(path("/ub/Web/index.php"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html><form><input name=\"email\"/></form></html>"))
        .mount(server)
        .await;

    let login_answer = if with_second_factor {
        ResponseTemplate::new(200).set_body_string(
            r#"<html><body><form action="auth/confirm-account.php?action=Confirm">
                <input type="hidden" name="CSRF_TOKEN" value="tfa-token"/>
                <label>Passcode</label><input name="OTP"/>
            </form></body></html>"#,
        )
    } else {
        ResponseTemplate::new(200).insert_header("set-cookie", "login_token=abc123; Path=/").set_body_string("<html>dashboard</html>")
    };

    Mock::given(method("POST"))
        .and(path("/ub/Web/index.php"))
        .and(body_string_contains("email=student%40uzh.ch"))
        .and(body_string_contains("login=submit"))
        .respond_with(login_answer)
        .expect(1)
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/ub/Web/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<html><body><input type="hidden" name="CSRF_TOKEN" value="session-token"/></body></html>"#,
        ))
        .mount(server)
        .await;
}

async fn mount_second_factor(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/ub/Web/auth/confirm-account.php"))
        .and(query_param("action", "Confirm"))
        .and(body_string_contains("CSRF_TOKEN=tfa-token"))
        .and(body_string_contains("OTP=287082"))
        .respond_with(ResponseTemplate::new(200).insert_header("set-cookie", "login_token=abc123; Path=/").set_body_string("<html>ok</html>"))
        .expect(1)
        .mount(server)
        .await;
}

async fn mount_reservation(server: &MockServer, response: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(path("/ub/Web/api/reservation.php"))
        .and(query_param("action", "create"))
        .and(header("x-csrf-token", "session-token"))
        .and(body_string_contains(r#""resourceIds":["231"]"#))
        .and(body_string_contains("BROWSER_TIMEZONE"))
        .respond_with(response)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_login_with_second_factor() {
    let server = MockServer::start().await;
    mount_login(&server, true).await;
    mount_second_factor(&server).await;

    let client = client_for(&server, 5);
    let session = client.authenticate(&credentials()).await.unwrap();

    assert!(format!("{:?}", session).contains("sessio..."));
}

#[tokio::test]
async fn test_login_without_second_factor() {
    let server = MockServer::start().await;
    mount_login(&server, false).await;

    let client = client_for(&server, 5);
    assert!(client.authenticate(&credentials()).await.is_ok());
}

#[tokio::test]
async fn test_missing_login_cookie_is_auth_error() {
    let server = MockServer::start().await;
    mount_login(&server, true).await;
    Mock::given(method("POST"))
        .and(path("/ub/Web/auth/confirm-account.php"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>Invalid passcode</html>"))
        .mount(&server)
        .await;

    let client = client_for(&server, 5);
    assert!(matches!(client.authenticate(&credentials()).await, Err(Error::AuthError(_))));
}

#[tokio::test]
async fn test_successful_reservation() {
    let server = MockServer::start().await;
    mount_login(&server, false).await;
    mount_reservation(
        &server,
        ResponseTemplate::new(200).set_body_string(r#"{"success":true,"data":{"success":true,"referenceNumber":"682b5f3e1a2c7"}}"#),
    )
    .await;

    let client = client_for(&server, 5);
    let session = client.authenticate(&credentials()).await.unwrap();
    let outcome = client.attempt_reservation(&session, &candidate()).await;

    assert_eq!(outcome, Outcome::Success { booking_reference: BookingReference::new("682b5f3e1a2c7") });
}

#[tokio::test]
async fn test_reservation_refusals_are_classified() {
    let server = MockServer::start().await;
    mount_login(&server, false).await;
    mount_reservation(
        &server,
        ResponseTemplate::new(200)
            .set_body_string(r#"{"success":true,"data":{"success":false,"errors":["Es ist nur eine Reservierung zur selben Zeit möglich."]}}"#),
    )
    .await;

    let client = client_for(&server, 5);
    let session = client.authenticate(&credentials()).await.unwrap();

    assert_eq!(client.attempt_reservation(&session, &candidate()).await, Outcome::Conflict(ConflictReason::AlreadyReservedThisTime));
}

#[tokio::test]
async fn test_server_errors_and_timeouts_are_transient() {
    let server = MockServer::start().await;
    mount_login(&server, false).await;
    mount_reservation(&server, ResponseTemplate::new(503)).await;

    let client = client_for(&server, 5);
    let session = client.authenticate(&credentials()).await.unwrap();
    assert!(matches!(client.attempt_reservation(&session, &candidate()).await, Outcome::TransientError(_)));

    let slow = MockServer::start().await;
    mount_login(&slow, false).await;
    mount_reservation(&slow, ResponseTemplate::new(200).set_delay(Duration::from_secs(3))).await;

    let client = client_for(&slow, 1);
    let session = client.authenticate(&credentials()).await.unwrap();
    assert!(matches!(client.attempt_reservation(&session, &candidate()).await, Outcome::TransientError(_)));
}

#[tokio::test]
async fn test_rejected_session_is_auth_error() {
    let server = MockServer::start().await;
    mount_login(&server, false).await;
    mount_reservation(&server, ResponseTemplate::new(403)).await;

    let client = client_for(&server, 5);
    let session = client.authenticate(&credentials()).await.unwrap();

    assert!(matches!(client.attempt_reservation(&session, &candidate()).await, Outcome::AuthError(_)));
}

#[tokio::test]
async fn test_spot_listing() {
    let server = MockServer::start().await;
    mount_login(&server, false).await;
    Mock::given(method("GET"))
        .and(path("/ub/Web/schedule.php"))
        .and(query_param("sid", "12"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<select id="schedules"><option value="12" selected="selected">Rechtswissenschaft</option></select>
            <script>
            reservationResources.push({
                id: 231,
                name: "RWI Platz 1",
                canBook: true
            });
            </script>"#,
        ))
        .mount(&server)
        .await;

    let client = client_for(&server, 5);
    let session = client.authenticate(&credentials()).await.unwrap();
    let spots = SpotFetcher::new(&client, &session).fetch_spots_for_schedule(12).await.unwrap();

    assert_eq!(spots.len(), 1);
    assert_eq!(spots[0].id, 231);
    assert_eq!(spots[0].schedule_name, "Rechtswissenschaft");
}

#[tokio::test]
async fn test_exported_session_can_be_restored() {
    let server = MockServer::start().await;
    mount_login(&server, false).await;
    Mock::given(method("POST"))
        .and(path("/ub/Web/api/reservation.php"))
        .and(header("cookie", "login_token=abc123"))
        .and(header("x-csrf-token", "session-token"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"success":true,"data":{"success":true,"referenceNumber":"cached-1"}}"#))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, 5);
    let session = client.authenticate(&credentials()).await.unwrap();
    let cached = client.export_session(&session).unwrap();
    assert_eq!(cached.cookies, vec!["login_token=abc123".to_string()]);
    assert_eq!(cached.csrf_token, "session-token");
    assert_eq!(cached.saved_at, 59);

    // A new client, as in the next run, without logging in again.
    let restored = client_for(&server, 5).restore_session(&cached).unwrap();
    let outcome = client_for(&server, 5).attempt_reservation(&restored, &candidate()).await;

    assert_eq!(outcome, Outcome::Success { booking_reference: BookingReference::new("cached-1") });
}

#[tokio::test]
async fn test_foreign_or_cookieless_snapshot_is_not_restored() {
    let server = MockServer::start().await;
    let client = client_for(&server, 5);
    let snapshot = library_seat_booker::api::session_cache_dto::CachedSessionDto {
        saved_at: 59,
        base_url: format!("{}/ub/Web/", server.uri()),
        csrf_token: "session-token".to_string(),
        cookies: vec!["PHPSESSID=f00".to_string()],
    };
    assert!(matches!(client.restore_session(&snapshot), Err(Error::AuthError(_))));

    let foreign = library_seat_booker::api::session_cache_dto::CachedSessionDto {
        base_url: "https://elsewhere.example/ub/Web/".to_string(),
        cookies: vec!["login_token=abc123".to_string()],
        ..snapshot
    };
    assert!(matches!(client.restore_session(&foreign), Err(Error::AuthError(_))));
}
