//! Storage API delivery: payload shape, authorization and partial failure

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use test_log::test;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use fx_rates_ingest::api::{RateSink, SinkClient};
use fx_rates_ingest::errors::DeliveryFailureKind;
use fx_rates_ingest::models::DeliveryOutcome;

use crate::common::test_data;

fn sink_for(server: &MockServer) -> SinkClient {
    let cache = std::env::temp_dir();
    SinkClient::new(&test_data::test_config(&server.uri(), &cache)).unwrap()
}

#[test(tokio::test)]
async fn test_payload_and_bearer_header() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/exchange_rates"))
        .and(header("authorization", "Bearer test-token"))
        .and(header("content-type", "application/json"))
        .respond_with(ResponseTemplate::new(201).set_body_string(r#"{"id": 1}"#))
        .expect(1)
        .mount(&server)
        .await;

    let sink = sink_for(&server);
    let outcome = sink.deliver(&test_data::rate("EUR", "0.1234")).await;
    assert_eq!(outcome.failure_kind(), None);
    assert!(matches!(outcome, DeliveryOutcome::Delivered { status: 201, .. }));

    let requests = server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(
        body,
        json!({
            "base": "USD",
            "target": "EUR",
            "date": "2024-03-01",
            "conversion_rate": "0.1234",
            "source": "ECB",
            "precision": 5,
            "scale": 4
        })
    );

    server.verify().await;
}

#[test(tokio::test)]
async fn test_one_rejected_rate_does_not_stop_the_rest() {
    let server = MockServer::start().await;
    // Mounted first so it wins over the catch-all below
    Mock::given(method("POST"))
        .and(path("/api/v1/exchange_rates"))
        .and(body_partial_json(json!({"target": "GBP"})))
        .respond_with(ResponseTemplate::new(500).set_body_string("database unavailable"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/exchange_rates"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(4)
        .mount(&server)
        .await;

    let sink = sink_for(&server);
    let rates = [
        test_data::rate("EUR", "0.91"),
        test_data::rate("JPY", "149.85"),
        test_data::rate("GBP", "0.79"),
        test_data::rate("CHF", "0.88"),
        test_data::rate("CAD", "1.35"),
    ];

    let mut outcomes = Vec::new();
    for rate in &rates {
        outcomes.push(sink.deliver(rate).await);
    }

    assert_eq!(outcomes.iter().filter(|o| o.is_success()).count(), 4);
    match &outcomes[2] {
        DeliveryOutcome::Failed {
            rate,
            kind,
            status,
            body,
        } => {
            assert_eq!(rate.target, "GBP");
            assert_eq!(*kind, DeliveryFailureKind::SinkRejected);
            assert_eq!(*status, Some(500));
            assert_eq!(body, "database unavailable");
        }
        other => panic!("expected a failed delivery, got {:?}", other),
    }
    assert!(outcomes[3].is_success());
    assert!(outcomes[4].is_success());

    server.verify().await;
}

#[test(tokio::test)]
async fn test_validation_rejection_is_classified() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/exchange_rates"))
        .respond_with(ResponseTemplate::new(422).set_body_string(r#"{"detail": "bad scale"}"#))
        .mount(&server)
        .await;

    let sink = sink_for(&server);
    let outcome = sink.deliver(&test_data::rate("EUR", "1.5")).await;

    assert_eq!(outcome.failure_kind(), Some(DeliveryFailureKind::Validation));
    assert_eq!(outcome.rate().target, "EUR");
}

#[test(tokio::test)]
async fn test_unreachable_sink_is_a_network_failure() {
    // Grab a free port and release it so nothing listens there
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let uri = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let cache = std::env::temp_dir();
    let sink = SinkClient::new(&test_data::test_config(&uri, &cache)).unwrap();
    let outcome = sink.deliver(&test_data::rate("EUR", "1.5")).await;

    assert_eq!(outcome.failure_kind(), Some(DeliveryFailureKind::Network));
}

#[test(tokio::test)]
async fn test_base_url_path_prefix_is_kept() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/gateway/api/v1/exchange_rates"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let cache = std::env::temp_dir();
    let mut config = test_data::test_config(&server.uri(), &cache);
    config.sink_base_url = format!("{}/gateway", server.uri());
    let sink = SinkClient::new(&config).unwrap();

    assert!(sink.deliver(&test_data::rate("EUR", "1.5")).await.is_success());
    server.verify().await;
}
