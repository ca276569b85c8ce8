//! Contract tests for HttpPaymentGateway against a simulated gateway API.
//!
//! ## Endpoints Tested
//!
//! | Method | Path | Test |
//! |--------|------|------|
//! | POST   | `/v1/charges` | `charge_*` |
//! | GET    | `/v1/charges/by-idempotency-key/{key}` | `query_charge_*` |
//! | POST   | `/v1/destination-accounts` | `destination_account_*` |
//! | POST   | `/v1/transfers` | `transfer_*` |
//! | GET    | `/v1/transfers/by-idempotency-key/{key}` | `query_transfer_*` |

use escrow_core::{
    Currency, DestinationAccountRef, ExternalPaymentId, IdempotencyKey, MilestoneId, Money,
    PaymentInstrumentRef, TransferGroup, UserId,
};
use escrow_gateway::{
    ChargeOutcome, ChargeRequest, GatewayConfig, GatewayError, HttpPaymentGateway,
    PaymentGateway, TransferOutcome, TransferRequest,
};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_gateway(mock_server: &MockServer) -> HttpPaymentGateway {
    let mut config = GatewayConfig::new(&mock_server.uri(), "test-key").unwrap();
    config.timeout_secs = 5;
    HttpPaymentGateway::new(config).unwrap()
}

fn charge_request(key: &str) -> ChargeRequest {
    ChargeRequest {
        amount: Money::new(10_000, Currency::new("USD").unwrap()).unwrap(),
        instrument: PaymentInstrumentRef::new("pm_card_visa").unwrap(),
        idempotency_key: IdempotencyKey::new(key).unwrap(),
        milestone_id: MilestoneId::new(),
    }
}

fn transfer_request(group: &str, attempt: u32) -> TransferRequest {
    let transfer_group = TransferGroup::new(group).unwrap();
    TransferRequest {
        source_charge: ExternalPaymentId::new("ch_123").unwrap(),
        destination: DestinationAccountRef::new("acct_456").unwrap(),
        amount: 9_000,
        currency: Currency::new("usd").unwrap(),
        idempotency_key: transfer_group.attempt_key(attempt),
        transfer_group,
    }
}

// ── POST /v1/charges ────────────────────────────────────────────────

#[tokio::test]
async fn charge_sends_idempotency_key_and_bearer_token() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/charges"))
        .and(header("Idempotency-Key", "ms_abc123"))
        .and(header("Authorization", "Bearer test-key"))
        .and(body_partial_json(serde_json::json!({
            "amount": 10000,
            "currency": "usd",
            "payment_instrument": "pm_card_visa"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "succeeded",
            "id": "ch_123"
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let gateway = test_gateway(&mock_server);
    let outcome = gateway.charge(&charge_request("ms_abc123")).await.unwrap();
    assert_eq!(
        outcome,
        ChargeOutcome::Succeeded {
            external_payment_id: ExternalPaymentId::new("ch_123").unwrap()
        }
    );
}

#[tokio::test]
async fn charge_surfaces_challenge_payload_unmodified() {
    let mock_server = MockServer::start().await;
    let challenge = serde_json::json!({
        "type": "three_d_secure",
        "redirect_url": "https://gateway.test/3ds/ms_abc"
    });

    Mock::given(method("POST"))
        .and(path("/v1/charges"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "requires_challenge",
            "challenge": challenge
        })))
        .mount(&mock_server)
        .await;

    let gateway = test_gateway(&mock_server);
    match gateway.charge(&charge_request("ms_abc")).await.unwrap() {
        ChargeOutcome::RequiresChallenge { challenge: got } => assert_eq!(got.0, challenge),
        other => panic!("expected challenge, got {other:?}"),
    }
}

#[tokio::test]
async fn charge_decline_is_a_failed_outcome() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/charges"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "failed",
            "reason": "card_declined"
        })))
        .mount(&mock_server)
        .await;

    let gateway = test_gateway(&mock_server);
    let outcome = gateway.charge(&charge_request("ms_decl")).await.unwrap();
    assert_eq!(
        outcome,
        ChargeOutcome::Failed {
            reason: "card_declined".into()
        }
    );
}

#[tokio::test]
async fn charge_5xx_is_ambiguous() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/charges"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream unavailable"))
        .mount(&mock_server)
        .await;

    let gateway = test_gateway(&mock_server);
    let err = gateway.charge(&charge_request("ms_5xx")).await.unwrap_err();
    assert!(err.is_ambiguous());
    assert!(matches!(err, GatewayError::ServerError { status: 503, .. }));
}

#[tokio::test]
async fn charge_4xx_is_definitive_rejection() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/charges"))
        .respond_with(ResponseTemplate::new(400).set_body_string("unknown instrument"))
        .mount(&mock_server)
        .await;

    let gateway = test_gateway(&mock_server);
    let err = gateway.charge(&charge_request("ms_4xx")).await.unwrap_err();
    assert!(!err.is_ambiguous());
    match err {
        GatewayError::Rejected { status, body, .. } => {
            assert_eq!(status, 400);
            assert_eq!(body, "unknown instrument");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn charge_garbled_success_body_is_ambiguous() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/charges"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&mock_server)
        .await;

    let gateway = test_gateway(&mock_server);
    let err = gateway.charge(&charge_request("ms_garbled")).await.unwrap_err();
    assert!(matches!(err, GatewayError::Deserialization { .. }));
    assert!(err.is_ambiguous());
}

// ── GET /v1/charges/by-idempotency-key/{key} ────────────────────────

#[tokio::test]
async fn query_charge_returns_recorded_outcome() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/charges/by-idempotency-key/ms_seen"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "succeeded",
            "id": "ch_seen"
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let gateway = test_gateway(&mock_server);
    let outcome = gateway
        .query_charge(&IdempotencyKey::new("ms_seen").unwrap())
        .await
        .unwrap();
    assert!(matches!(outcome, Some(ChargeOutcome::Succeeded { .. })));
}

#[tokio::test]
async fn query_charge_404_means_never_seen() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/charges/by-idempotency-key/ms_unknown"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;

    let gateway = test_gateway(&mock_server);
    let outcome = gateway
        .query_charge(&IdempotencyKey::new("ms_unknown").unwrap())
        .await
        .unwrap();
    assert_eq!(outcome, None);
}

// ── POST /v1/destination-accounts ───────────────────────────────────

#[tokio::test]
async fn destination_account_keyed_by_provider() {
    let mock_server = MockServer::start().await;
    let provider = UserId::new();
    let provider_ref = provider.as_uuid().simple().to_string();

    Mock::given(method("POST"))
        .and(path("/v1/destination-accounts"))
        .and(header("Idempotency-Key", format!("dest_{provider_ref}").as_str()))
        .and(body_partial_json(serde_json::json!({ "provider_ref": provider_ref })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "acct_789"
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let gateway = test_gateway(&mock_server);
    let account = gateway.ensure_destination_account(provider).await.unwrap();
    assert_eq!(account.as_str(), "acct_789");
}

// ── POST /v1/transfers ──────────────────────────────────────────────

#[tokio::test]
async fn first_transfer_attempt_is_keyed_by_its_group() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/transfers"))
        .and(header("Idempotency-Key", "milestone_abc"))
        .and(body_partial_json(serde_json::json!({
            "source_charge": "ch_123",
            "destination": "acct_456",
            "amount": 9000,
            "currency": "usd",
            "transfer_group": "milestone_abc"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "succeeded",
            "id": "tr_1"
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let gateway = test_gateway(&mock_server);
    let outcome = gateway
        .transfer(&transfer_request("milestone_abc", 0))
        .await
        .unwrap();
    assert!(matches!(outcome, TransferOutcome::Succeeded { .. }));
}

#[tokio::test]
async fn transfer_retry_attempt_sends_its_own_key() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/transfers"))
        .and(header("Idempotency-Key", "milestone_abc-r1"))
        .and(body_partial_json(serde_json::json!({
            "transfer_group": "milestone_abc"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "succeeded",
            "id": "tr_2"
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let gateway = test_gateway(&mock_server);
    let outcome = gateway
        .transfer(&transfer_request("milestone_abc", 1))
        .await
        .unwrap();
    assert!(matches!(outcome, TransferOutcome::Succeeded { .. }));
}

// ── GET /v1/transfers/by-idempotency-key/{key} ──────────────────────

#[tokio::test]
async fn query_transfer_reports_a_stored_failure() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/transfers/by-idempotency-key/milestone_abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "failed",
            "reason": "account_closed"
        })))
        .mount(&mock_server)
        .await;

    let gateway = test_gateway(&mock_server);
    let outcome = gateway
        .query_transfer(&IdempotencyKey::new("milestone_abc").unwrap())
        .await
        .unwrap();
    assert_eq!(
        outcome,
        Some(TransferOutcome::Failed {
            reason: "account_closed".into()
        })
    );
}

#[tokio::test]
async fn query_transfer_not_found_means_none() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/transfers/by-idempotency-key/milestone_none"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;

    let gateway = test_gateway(&mock_server);
    let outcome = gateway
        .query_transfer(&IdempotencyKey::new("milestone_none").unwrap())
        .await
        .unwrap();
    assert_eq!(outcome, None);
}

#[test]
fn config_debug_redacts_api_key() {
    let config = GatewayConfig::new("http://127.0.0.1:9", "sk_live_secret").unwrap();
    let rendered = format!("{config:?}");
    assert!(!rendered.contains("sk_live_secret"));
    assert!(rendered.contains("[REDACTED]"));
}
