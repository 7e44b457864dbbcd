use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use ghgi_adapters::{
    EmissionsFetcher, FetchError, FetchGeography, FetchRequest, GlobalApiFetcher, PayloadKind,
    SourcePayload,
};
use ghgi_core::{InventoryTarget, ReportingLevel};
use ghgi_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher};
use rust_decimal_macros::dec;
use serde_json::json;
use tokio::net::TcpListener;
use uuid::Uuid;

struct Upstream {
    base_url: String,
    flaky_hits: Arc<AtomicUsize>,
    throttled_hits: Arc<AtomicUsize>,
}

fn totals() -> Response {
    Json(json!({"totals": {"emissions": {"co2_mass": "1100", "co2eq_100yr": "1200"}}}))
        .into_response()
}

/// Canned Global API: a 404, a 503 that recovers, a permanent 503,
/// a throttled endpoint that recovers and a non-JSON body.
async fn spawn_upstream() -> Upstream {
    let flaky_hits = Arc::new(AtomicUsize::new(0));
    let throttled_hits = Arc::new(AtomicUsize::new(0));
    let flaky = flaky_hits.clone();
    let throttled = throttled_hits.clone();

    let router = Router::new()
        .route(
            "/missing/{gpc}",
            get(|| async { (StatusCode::NOT_FOUND, "not found") }),
        )
        .route(
            "/flaky/{gpc}",
            get(move || {
                let hits = flaky.clone();
                async move {
                    if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                        StatusCode::SERVICE_UNAVAILABLE.into_response()
                    } else {
                        totals()
                    }
                }
            }),
        )
        .route(
            "/throttled/{gpc}",
            get(move || {
                let hits = throttled.clone();
                async move {
                    if hits.fetch_add(1, Ordering::SeqCst) < 2 {
                        StatusCode::TOO_MANY_REQUESTS.into_response()
                    } else {
                        totals()
                    }
                }
            }),
        )
        .route(
            "/down/{gpc}",
            get(|| async { StatusCode::SERVICE_UNAVAILABLE }),
        )
        .route(
            "/garbled/{gpc}",
            get(|| async { "<html>bad gateway</html>" }),
        );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    Upstream {
        base_url: format!("http://{addr}"),
        flaky_hits,
        throttled_hits,
    }
}

fn fetcher(base_url: &str) -> GlobalApiFetcher {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(5),
        backoff: BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
        },
        ..Default::default()
    })
    .unwrap();
    GlobalApiFetcher::new(Arc::new(http), base_url)
}

fn request(path: &str) -> FetchRequest {
    let target = InventoryTarget {
        inventory_id: Uuid::new_v4(),
        city_id: Uuid::new_v4(),
        year: Some(2023),
        city_code: "AR BUE".into(),
        region_code: Some("AR-C".into()),
        country_code: "AR".into(),
        reporting_level: ReportingLevel::Basic,
    };
    FetchRequest::new(
        "edgar-city",
        Some(format!("/{path}/{{gpc}}")),
        PayloadKind::Emissions,
        FetchGeography::City,
        &target,
        2023,
        "I.1.1".parse().unwrap(),
    )
}

#[tokio::test]
async fn not_found_means_no_data() {
    let upstream = spawn_upstream().await;
    let result = fetcher(&upstream.base_url).fetch(&request("missing")).await;
    assert_eq!(result, Err(FetchError::NoData));
    assert_eq!(FetchError::NoData.issue(), "no_data_available");
}

#[tokio::test]
async fn transient_statuses_are_retried_until_success() {
    let upstream = spawn_upstream().await;
    let fetcher = fetcher(&upstream.base_url);

    let Ok(SourcePayload::Emissions(payload)) = fetcher.fetch(&request("flaky")).await else {
        panic!("expected emissions after one retry");
    };
    assert_eq!(payload.totals.co2eq_100yr, dec!(1200));
    assert_eq!(upstream.flaky_hits.load(Ordering::SeqCst), 2);

    let throttled = fetcher.fetch(&request("throttled")).await;
    assert!(matches!(throttled, Ok(SourcePayload::Emissions(_))));
    assert_eq!(upstream.throttled_hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn exhausted_retries_surface_typed_status() {
    let upstream = spawn_upstream().await;
    let err = fetcher(&upstream.base_url)
        .fetch(&request("down"))
        .await
        .unwrap_err();
    match &err {
        FetchError::HttpStatus { status, url } => {
            assert_eq!(*status, 503);
            assert!(url.ends_with("/down/I.1.1"), "{url}");
        }
        other => panic!("expected http status error, got {other:?}"),
    }
    assert_eq!(err.issue(), "http_status_503");
}

#[tokio::test]
async fn non_json_body_is_malformed() {
    let upstream = spawn_upstream().await;
    let result = fetcher(&upstream.base_url).fetch(&request("garbled")).await;
    assert!(matches!(result, Err(FetchError::Malformed(_))));
}
