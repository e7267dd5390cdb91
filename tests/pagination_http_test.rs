use httpmock::prelude::*;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use vuln_etl::config::job_config::EndpointConfig;
use vuln_etl::core::fetcher::PaginatedFetcher;
use vuln_etl::core::http_source::HttpPageSource;
use vuln_etl::core::FetchOutcome;
use vuln_etl::EtlError;

fn page(range: std::ops::Range<usize>, total: usize) -> Value {
    let data: Vec<Value> = range
        .map(|i| json!({"id": i, "severity": {"level": "high", "score": 8}}))
        .collect();
    json!({"data": data, "count": total})
}

fn endpoint(url: String, page_size: usize) -> Arc<EndpointConfig> {
    Arc::new(EndpointConfig {
        endpoint: url,
        page_size: Some(page_size),
        headers: Some(HashMap::from([(
            "Authorization".to_string(),
            "Bearer test-token".to_string(),
        )])),
        ..EndpointConfig::default()
    })
}

#[tokio::test]
async fn test_fetches_every_page_until_declared_total() {
    let server = MockServer::start_async().await;

    let mut mocks = Vec::new();
    for (start, end) in [(0, 100), (100, 200), (200, 250)] {
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/issues")
                    .header("Authorization", "Bearer test-token")
                    .query_param("start", start.to_string().as_str())
                    .query_param("limit", "100");
                then.status(200)
                    .header("Content-Type", "application/json")
                    .json_body(page(start..end, 250));
            })
            .await;
        mocks.push(mock);
    }

    let endpoint = endpoint(server.url("/issues"), 100);
    let client = HttpPageSource::build_client(&endpoint).unwrap();
    let source = HttpPageSource::new(client, endpoint);

    let result = PaginatedFetcher::new(100).fetch_all(&source).await;

    assert!(result.is_complete());
    assert_eq!(result.requests, 3);
    assert_eq!(result.records.len(), 250);
    assert_eq!(result.records[0].get("severity_level"), Some(&json!("high")));
    assert_eq!(result.records[249].get("id"), Some(&json!(249)));
    for mock in &mocks {
        mock.assert_hits_async(1).await;
    }
}

#[tokio::test]
async fn test_server_error_keeps_earlier_pages_as_partial() {
    let server = MockServer::start_async().await;

    let first = server
        .mock_async(|when, then| {
            when.method(GET).path("/issues").query_param("start", "0");
            then.status(200).json_body(page(0..10, 30));
        })
        .await;
    let second = server
        .mock_async(|when, then| {
            when.method(GET).path("/issues").query_param("start", "10");
            then.status(500).body("internal error");
        })
        .await;

    let endpoint = endpoint(server.url("/issues"), 10);
    let client = HttpPageSource::build_client(&endpoint).unwrap();
    let source = HttpPageSource::new(client, endpoint);

    let result = PaginatedFetcher::new(10).fetch_all(&source).await;

    first.assert_hits_async(1).await;
    second.assert_hits_async(1).await;
    assert_eq!(result.records.len(), 10);
    match result.outcome {
        FetchOutcome::Failed { offset, error } => {
            assert_eq!(offset, 10);
            match error {
                EtlError::PageFailed { source, .. } => {
                    assert!(matches!(*source, EtlError::HttpStatus { status: 500, .. }))
                }
                other => panic!("unexpected error: {other:?}"),
            }
        }
        FetchOutcome::Done => panic!("expected the fetch to fail"),
    }
}

#[tokio::test]
async fn test_malformed_body_is_a_decode_failure() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/issues");
            then.status(200).body("<html>login</html>");
        })
        .await;

    let endpoint = endpoint(server.url("/issues"), 50);
    let client = HttpPageSource::build_client(&endpoint).unwrap();
    let source = HttpPageSource::new(client, endpoint);

    let result = PaginatedFetcher::new(50).fetch_all(&source).await;

    assert!(result.records.is_empty());
    let err = result.into_result().unwrap_err();
    match err {
        EtlError::PageFailed { source, .. } => {
            assert!(matches!(*source, EtlError::DecodeError { .. }))
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_top_level_array_without_total_stops_on_short_page() {
    let server = MockServer::start_async().await;
    let full = server
        .mock_async(|when, then| {
            when.method(GET).path("/apps").query_param("start", "0");
            then.status(200)
                .json_body(json!([{"id": 1}, {"id": 2}, {"id": 3}]));
        })
        .await;
    let short = server
        .mock_async(|when, then| {
            when.method(GET).path("/apps").query_param("start", "3");
            then.status(200).json_body(json!([{"id": 4}]));
        })
        .await;

    let endpoint = endpoint(server.url("/apps"), 3);
    let client = HttpPageSource::build_client(&endpoint).unwrap();
    let source = HttpPageSource::new(client, endpoint);

    let result = PaginatedFetcher::new(3).fetch_all(&source).await;

    full.assert_hits_async(1).await;
    short.assert_hits_async(1).await;
    assert!(result.is_complete());
    assert_eq!(result.records.len(), 4);
}

#[tokio::test]
async fn test_parent_key_is_substituted_into_path() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/versions/10028/issues");
            then.status(200).json_body(page(0..2, 2));
        })
        .await;

    let endpoint = endpoint(server.url("/versions/{parent_key}/issues"), 200);
    let client = HttpPageSource::build_client(&endpoint).unwrap();
    let source = HttpPageSource::for_parent(client, endpoint, "10028");

    let result = PaginatedFetcher::new(200).fetch_all(&source).await;

    mock.assert_hits_async(1).await;
    assert_eq!(result.records.len(), 2);
}
