//! Historical rate site: per-code fail-fast, abort policies and the page cache

use assert_matches::assert_matches;
use futures::StreamExt;
use pretty_assertions::assert_eq;
use std::path::Path;
use test_log::test;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use fx_rates_ingest::api::{build_source_client, RateSource, RequestThrottle, XRatesClient};
use fx_rates_ingest::errors::FailureCause;
use fx_rates_ingest::models::{AbortPolicy, WorkItem};

use crate::common::{logging, test_data};

fn client_for(server: &MockServer, cache_dir: &Path, policy: AbortPolicy) -> XRatesClient {
    let mut config = test_data::test_config(&server.uri(), cache_dir);
    config.abort_policy = policy;
    let http = build_source_client(config.request_timeout).unwrap();
    XRatesClient::new(&config, http, RequestThrottle::default())
}

async fn mount_day(server: &MockServer, code: &str, date: &str, response: ResponseTemplate, expected: u64) {
    Mock::given(method("GET"))
        .and(path("/historical/"))
        .and(query_param("from", code))
        .and(query_param("date", date))
        .respond_with(response)
        .expect(expected)
        .mount(server)
        .await;
}

fn page(code: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_string(test_data::rate_page(
        code,
        &[("EUR", "0.912345", "1.096077"), ("JPY", "149.851234", "0.006673")],
    ))
}

fn march(days: u32) -> Vec<chrono::NaiveDate> {
    (1..=days).map(|day| test_data::date(2024, 3, day)).collect()
}

#[test(tokio::test)]
async fn test_failure_abandons_remaining_dates_of_that_code_only() {
    logging::log_test_step("USD fails on day two, GBP is untouched");
    let server = MockServer::start().await;
    let cache = tempfile::tempdir().unwrap();

    mount_day(&server, "USD", "2024-03-01", page("USD"), 1).await;
    mount_day(&server, "USD", "2024-03-02", ResponseTemplate::new(500), 1).await;
    mount_day(&server, "USD", "2024-03-03", page("USD"), 0).await;
    for day in ["2024-03-01", "2024-03-02", "2024-03-03"] {
        mount_day(&server, "GBP", day, page("GBP"), 1).await;
    }

    let client = client_for(&server, cache.path(), AbortPolicy::AnyFailure);
    let usd = WorkItem::Historical {
        code: "USD".to_string(),
        dates: march(3),
    };
    let gbp = WorkItem::Historical {
        code: "GBP".to_string(),
        dates: march(3),
    };

    let (usd_results, gbp_results) = tokio::join!(
        client.observations(&usd).collect::<Vec<_>>(),
        client.observations(&gbp).collect::<Vec<_>>(),
    );

    assert_eq!(usd_results.len(), 3);
    assert!(usd_results[..2].iter().all(|r| r.is_ok()));
    let failure = usd_results[2].as_ref().unwrap_err();
    assert_eq!(failure.item, "USD");
    assert_eq!(failure.date, Some(test_data::date(2024, 3, 2)));
    assert_eq!(failure.skipped, 1);
    assert_eq!(failure.cause(), FailureCause::Transient);

    assert_eq!(gbp_results.len(), 6);
    assert!(gbp_results.iter().all(|r| r.is_ok()));
    let observation = gbp_results[0].as_ref().unwrap();
    assert_eq!(observation.base, "GBP");
    assert_eq!(observation.target, "EUR");
    assert_eq!(observation.value, "0.912345");
    assert_eq!(observation.date, "2024-03-01");

    server.verify().await;
}

#[test(tokio::test)]
async fn test_blocked_only_policy_skips_a_failed_date_and_continues() {
    let server = MockServer::start().await;
    let cache = tempfile::tempdir().unwrap();

    mount_day(&server, "USD", "2024-03-01", page("USD"), 1).await;
    mount_day(&server, "USD", "2024-03-02", ResponseTemplate::new(502), 1).await;
    mount_day(&server, "USD", "2024-03-03", page("USD"), 1).await;

    let client = client_for(&server, cache.path(), AbortPolicy::BlockedOnly);
    let item = WorkItem::Historical {
        code: "USD".to_string(),
        dates: march(3),
    };
    let results: Vec<_> = client.observations(&item).collect().await;

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 4);
    let failures: Vec<_> = results.iter().filter_map(|r| r.as_ref().err()).collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].skipped, 0);
    assert!(!failures[0].aborted());

    server.verify().await;
}

#[test(tokio::test)]
async fn test_blocked_only_policy_still_aborts_when_blocked() {
    let server = MockServer::start().await;
    let cache = tempfile::tempdir().unwrap();

    mount_day(&server, "USD", "2024-03-01", ResponseTemplate::new(429), 1).await;
    mount_day(&server, "USD", "2024-03-02", page("USD"), 0).await;
    mount_day(&server, "USD", "2024-03-03", page("USD"), 0).await;

    let client = client_for(&server, cache.path(), AbortPolicy::BlockedOnly);
    let item = WorkItem::Historical {
        code: "USD".to_string(),
        dates: march(3),
    };
    let results: Vec<_> = client.observations(&item).collect().await;

    assert_eq!(results.len(), 1);
    let failure = results[0].as_ref().unwrap_err();
    assert_eq!(failure.cause(), FailureCause::Blocked);
    assert_eq!(failure.skipped, 2);

    server.verify().await;
}

#[test(tokio::test)]
async fn test_cached_pages_are_not_refetched() {
    let server = MockServer::start().await;
    let cache = tempfile::tempdir().unwrap();

    mount_day(&server, "USD", "2024-03-01", page("USD"), 1).await;
    mount_day(&server, "USD", "2024-03-02", page("USD"), 1).await;

    let client = client_for(&server, cache.path(), AbortPolicy::AnyFailure);
    let item = WorkItem::Historical {
        code: "USD".to_string(),
        dates: march(2),
    };

    let first: Vec<_> = client.observations(&item).collect().await;
    let second: Vec<_> = client.observations(&item).collect().await;

    let first: Vec<_> = first.into_iter().map(|r| r.unwrap()).collect();
    let second: Vec<_> = second.into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(first.len(), 4);
    assert_eq!(
        first.iter().map(|o| (&o.target, &o.value, &o.date)).collect::<Vec<_>>(),
        second.iter().map(|o| (&o.target, &o.value, &o.date)).collect::<Vec<_>>()
    );

    assert!(client.cache_path("USD", test_data::date(2024, 3, 1)).exists());
    assert!(!cache.path().join("USD").join("2024-03-01.parquet.tmp").exists());

    server.verify().await;
}

#[test(tokio::test)]
async fn test_page_without_rate_table_is_malformed() {
    let server = MockServer::start().await;
    let cache = tempfile::tempdir().unwrap();

    mount_day(
        &server,
        "USD",
        "2024-03-01",
        ResponseTemplate::new(200).set_body_string("<html><body><table></table></body></html>"),
        1,
    )
    .await;
    mount_day(&server, "USD", "2024-03-02", page("USD"), 0).await;

    let client = client_for(&server, cache.path(), AbortPolicy::AnyFailure);
    let item = WorkItem::Historical {
        code: "USD".to_string(),
        dates: march(2),
    };
    let results: Vec<_> = client.observations(&item).collect().await;

    assert_eq!(results.len(), 1);
    let failure = results[0].as_ref().unwrap_err();
    assert_eq!(failure.cause(), FailureCause::Malformed);
    assert_eq!(failure.skipped, 1);
    assert!(!client.cache_path("USD", test_data::date(2024, 3, 1)).exists());

    server.verify().await;
}

#[test(tokio::test)]
async fn test_bulk_items_are_refused() {
    let server = MockServer::start().await;
    let cache = tempfile::tempdir().unwrap();
    let client = client_for(&server, cache.path(), AbortPolicy::AnyFailure);

    let item = WorkItem::File(cache.path().join("feed.csv"));
    let results: Vec<_> = client.observations(&item).collect().await;

    assert_eq!(results.len(), 1);
    assert_matches!(&results[0], Err(failure) if failure.date.is_none());
}
