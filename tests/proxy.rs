//! End-to-end tests driving the HTTP surface against an external-command VCS.

use std::sync::Arc;

use hyper::{Body, Method, Request, Response, StatusCode};
use tempfile::TempDir;

use modproxy::metrics::Metrics;
use modproxy::proxy::api::Api;
use modproxy::proxy::Proxy;

/// A shell command implementing every VCS action with fixed answers.
const FAKE_VCS: &str = r#"case "$ACTION" in
    list) printf 'v1.0.0\nv1.1.0\n';;
    timestamp) printf '2018-09-10T18:16:07Z';;
    zip) printf 'ZIPBYTES';;
esac"#;

struct Harness {
    api: Api,
    metrics: Arc<Metrics>,
    _disk: TempDir,
}

fn harness() -> Harness {
    let disk = TempDir::new().unwrap();
    let metrics = Arc::new(Metrics::new());
    let proxy = Arc::new(
        Proxy::builder()
            .custom_vcs("example.com/", FAKE_VCS)
            .memory(-1)
            .cache_dir(disk.path())
            .metrics(metrics.clone())
            .build(),
    );
    Harness {
        api: Api::new(proxy, metrics.clone(), false),
        metrics,
        _disk: disk,
    }
}

async fn get(api: &Api, path: &str) -> Response<Body> {
    let req = Request::builder()
        .method(Method::GET)
        .uri(path)
        .body(Body::empty())
        .unwrap();
    api.handle(req).await
}

async fn body_string(response: Response<Body>) -> String {
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_list_endpoint() {
    let h = harness();
    let response = get(&h.api, "/example.com/m/@v/list").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "v1.0.0\nv1.1.0\n");
}

#[tokio::test]
async fn test_info_endpoint_and_caching() {
    let h = harness();

    let response = get(&h.api, "/example.com/m/@v/v1.0.0.info").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    let info: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(info["Version"], "v1.0.0");
    assert!(info["Time"].as_str().unwrap().starts_with("2018-09-10T18:16:07"));
    assert_eq!(h.metrics.cache_misses.get("example.com/m"), 1);

    // The snapshot is cached now; the next request for the same coordinate
    // is a hit on the memory tier.
    let response = get(&h.api, "/example.com/m/@v/v1.0.0.zip").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(h.metrics.cache_hits.get("example.com/m"), 1);
    assert_eq!(h.metrics.cache_misses.get("example.com/m"), 1);
}

#[tokio::test]
async fn test_zip_endpoint() {
    let h = harness();
    let response = get(&h.api, "/example.com/m/@v/v1.0.0.zip").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "application/zip"
    );
    assert_eq!(body_string(response).await, "ZIPBYTES");
}

#[tokio::test]
async fn test_mod_endpoint_synthesizes_manifest() {
    // The fake VCS returns an archive with no go.mod, so the handler falls
    // back to the minimal module stanza.
    let h = harness();
    let response = get(&h.api, "/example.com/m/@v/v1.0.0.mod").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "module example.com/m\n");
}

#[tokio::test]
async fn test_delete_purges_cache() {
    let h = harness();

    get(&h.api, "/example.com/m/@v/v1.0.0.zip").await;
    let req = Request::builder()
        .method(Method::DELETE)
        .uri("/example.com/m/@v/v1.0.0.zip")
        .body(Body::empty())
        .unwrap();
    let response = h.api.handle(req).await;
    assert_eq!(response.status(), StatusCode::OK);

    // The next request misses again and refetches.
    get(&h.api, "/example.com/m/@v/v1.0.0.zip").await;
    assert_eq!(h.metrics.cache_misses.get("example.com/m"), 2);
}

#[tokio::test]
async fn test_unroutable_path_is_404() {
    let h = harness();
    let response = get(&h.api, "/healthz").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(h.metrics.http_requests.get("not_found"), 1);
}

#[tokio::test]
async fn test_module_case_decoding() {
    let disk = TempDir::new().unwrap();
    let proxy = Arc::new(
        Proxy::builder()
            .custom_vcs(
                "example.com/",
                r#"if [ "$ACTION" = timestamp ]; then printf '0'; else printf '%s' "$MODULE"; fi"#,
            )
            .cache_dir(disk.path())
            .build(),
    );
    let api = Api::new(proxy, Arc::new(Metrics::new()), false);

    // `!m` decodes to `M` before the VCS sees the module path.
    let response = get(&api, "/example.com/!module/@v/v1.0.0.zip").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "example.com/Module");
}

#[tokio::test]
async fn test_prometheus_endpoint() {
    let disk = TempDir::new().unwrap();
    let metrics = Arc::new(Metrics::new());
    let proxy = Arc::new(
        Proxy::builder()
            .custom_vcs("example.com/", FAKE_VCS)
            .cache_dir(disk.path())
            .metrics(metrics.clone())
            .build(),
    );
    let api = Api::new(proxy, metrics, true);

    get(&api, "/example.com/m/@v/v1.0.0.zip").await;
    let response = get(&api, "/metrics").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.contains("cache_misses_example_com_m_total 1"));
    assert!(body.contains("http_requests_zip_total 1"));
}
