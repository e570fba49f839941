//! Token endpoint behaviour against a mock platform.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};
use wxsuite_rs::credential::CredentialError;
use wxsuite_rs::refresher::RefresherOptions;
use wxsuite_rs::service::{AccessTokenService, SuiteTokenService, TokenService};
use wxsuite_rs::token::{Auth, Error, SuiteAuth, SuiteClient};

fn client(server: &MockServer) -> SuiteClient {
    SuiteClient::new(Duration::from_secs(5))
        .unwrap()
        .with_base_url(&server.uri())
        .unwrap()
}

fn suite_auth() -> SuiteAuth {
    SuiteAuth {
        suite_id: "wwsuite0001".into(),
        suite_secret: "suite-secret".into(),
    }
}

#[tokio::test]
async fn suite_token_is_issued() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cgi-bin/service/get_suite_token"))
        .and(body_partial_json(json!({
            "suite_id": "wwsuite0001",
            "suite_secret": "suite-secret",
            "suite_ticket": "ticket-1"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errcode": 0,
            "errmsg": "ok",
            "suite_access_token": "suite-token-1",
            "expires_in": 7200
        })))
        .expect(1)
        .mount(&server)
        .await;

    let issued = client(&server)
        .get_suite_token(&suite_auth(), "ticket-1")
        .await
        .unwrap();
    assert_eq!(issued.access_token, "suite-token-1");
    assert_eq!(issued.expires_in, 7200);
}

#[tokio::test]
async fn provider_error_code_is_typed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cgi-bin/service/get_suite_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errcode": 40085,
            "errmsg": "invalid suite ticket"
        })))
        .mount(&server)
        .await;

    let err = client(&server)
        .get_suite_token(&suite_auth(), "stale")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Wx { code: 40085, .. }), "{err}");
}

#[tokio::test]
async fn non_success_status_is_a_transport_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cgi-bin/service/get_suite_token"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream busy"))
        .mount(&server)
        .await;

    let err = client(&server)
        .get_suite_token(&suite_auth(), "ticket-1")
        .await
        .unwrap_err();
    match err {
        Error::Status { status, body } => {
            assert_eq!(status, 503);
            assert_eq!(body, "upstream busy");
        }
        other => panic!("unexpected: {other}"),
    }
}

#[tokio::test]
async fn zero_lifetime_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cgi-bin/gettoken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errcode": 0,
            "access_token": "corp-token",
            "expires_in": 0
        })))
        .mount(&server)
        .await;

    let err = client(&server)
        .get_access_token(&Auth::WeCom {
            corp_id: "wwcorp".into(),
            corp_secret: "corp-secret".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NonPositiveExpiresIn(0)));
}

#[tokio::test]
async fn empty_ticket_never_reaches_the_network() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let err = client(&server)
        .get_suite_token(&suite_auth(), "")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TicketNotConfigured));
}

#[tokio::test]
async fn suite_service_waits_for_ticket() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cgi-bin/service/get_suite_token"))
        .and(body_partial_json(json!({ "suite_ticket": "ticket-1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "suite_access_token": "suite-token-1",
            "expires_in": 7200
        })))
        .expect(1)
        .mount(&server)
        .await;

    let service = SuiteTokenService::new(client(&server), suite_auth(), RefresherOptions::default());
    assert_eq!(
        service.token().await,
        Err(CredentialError::TicketNotConfigured)
    );

    assert!(service.set_ticket("ticket-1").await);
    assert_eq!(service.token().await.unwrap(), "suite-token-1");
    service.shutdown().await;
}

#[tokio::test]
async fn access_token_service_refreshes_on_demand() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cgi-bin/token"))
        .and(query_param("grant_type", "client_credential"))
        .and(query_param("appid", "wx1234"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "mp-token",
            "expires_in": 7200
        })))
        .expect(2)
        .mount(&server)
        .await;

    let service = Arc::new(AccessTokenService::new(
        client(&server),
        Auth::OfficialAccount {
            appid: "wx1234".into(),
            secret: "mp-secret".into(),
        },
        RefresherOptions::default(),
    ));
    assert_eq!(service.token().await, Err(CredentialError::NotInitialized));

    assert!(service.start().await);
    assert_eq!(service.token().await.unwrap(), "mp-token");
    assert_eq!(service.refresh_token().await.unwrap(), "mp-token");
    service.shutdown().await;
}
