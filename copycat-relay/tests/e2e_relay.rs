use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Redirect, Response},
    routing::get,
};
use bytes::Bytes;
use copycat_core::{ClientConfig, DomainAllowlist};
use copycat_relay::{AppState, RelayConfig, build_router};
use tokio::{net::TcpListener, sync::oneshot};

const PDF_BYTES: &[u8] = b"%PDF-1.4 fake report";
const LARGE_BODY_BYTES: usize = 1024 * 1024;
const SLOW_CHUNKS: usize = 4;
const SLOW_CHUNK_BYTES: usize = 1024;
const SLOW_CHUNK_GAP: Duration = Duration::from_millis(600);

#[tokio::test]
async fn missing_url_is_bad_request() {
    let (relay, shutdown_tx) = start_relay(open_config()).await;

    let response = reqwest::get(format!("{relay}/fetch-proxy"))
        .await
        .expect("relay reachable");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(response.text().await.unwrap(), "URL parameter is required");

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn unparseable_url_is_bad_request() {
    let (relay, shutdown_tx) = start_relay(open_config()).await;

    let response = get_via_relay(&relay, "not a url").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn host_outside_allowlist_is_forbidden_without_outbound_request() {
    let upstream = start_upstream().await;
    let config = RelayConfig {
        allowlist: DomainAllowlist::new(["docs.google.com"]),
        ..RelayConfig::default()
    };
    let (relay, shutdown_tx) = start_relay(config).await;

    let response = get_via_relay(&relay, &format!("{}/files/report.pdf", upstream.base)).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(response.text().await.unwrap(), "Domain not allowed");
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 0);

    let _ = shutdown_tx.send(());
    let _ = upstream.shutdown.send(());
}

#[tokio::test]
async fn allowlisted_suffix_is_relayed() {
    let upstream = start_upstream().await;
    let config = RelayConfig {
        allowlist: DomainAllowlist::new(["127.0.0.1"]),
        ..RelayConfig::default()
    };
    let (relay, shutdown_tx) = start_relay(config).await;

    let response = get_via_relay(&relay, &format!("{}/files/report.pdf", upstream.base)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 1);

    let _ = shutdown_tx.send(());
    let _ = upstream.shutdown.send(());
}

#[tokio::test]
async fn redirect_is_followed_and_filename_hint_exposed() {
    let upstream = start_upstream().await;
    let (relay, shutdown_tx) = start_relay(open_config()).await;

    let response = get_via_relay(
        &relay,
        &format!("{}/uc?export=download&id=123", upstream.base),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/pdf"
    );
    assert_eq!(response.headers().get("x-filename").unwrap(), "report.pdf");
    assert_eq!(response.bytes().await.unwrap().as_ref(), PDF_BYTES);

    let _ = shutdown_tx.send(());
    let _ = upstream.shutdown.send(());
}

#[tokio::test]
async fn missing_headers_fall_back_to_octet_stream_without_hint() {
    let upstream = start_upstream().await;
    let (relay, shutdown_tx) = start_relay(open_config()).await;

    let response = get_via_relay(&relay, &format!("{}/plain", upstream.base)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/octet-stream"
    );
    assert!(response.headers().get("x-filename").is_none());
    assert_eq!(response.text().await.unwrap(), "raw bytes");

    let _ = shutdown_tx.send(());
    let _ = upstream.shutdown.send(());
}

#[tokio::test]
async fn upstream_error_status_is_mirrored() {
    let upstream = start_upstream().await;
    let (relay, shutdown_tx) = start_relay(open_config()).await;

    let response = get_via_relay(&relay, &format!("{}/missing", upstream.base)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.text().await.unwrap(), "Not Found");

    let _ = shutdown_tx.send(());
    let _ = upstream.shutdown.send(());
}

#[tokio::test]
async fn large_body_is_streamed_through_intact() {
    let upstream = start_upstream().await;
    let (relay, shutdown_tx) = start_relay(open_config()).await;

    let response = get_via_relay(&relay, &format!("{}/large", upstream.base)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.bytes().await.unwrap();
    assert_eq!(body.len(), LARGE_BODY_BYTES);
    assert!(body.iter().all(|b| *b == b'z'));

    let _ = shutdown_tx.send(());
    let _ = upstream.shutdown.send(());
}

#[tokio::test]
async fn slow_body_outlasting_fetch_timeout_arrives_intact() {
    let upstream = start_upstream().await;
    let config = RelayConfig {
        fetch_timeout: Some(Duration::from_secs(1)),
        ..open_config()
    };
    let (relay, shutdown_tx) = start_relay(config).await;

    let response = get_via_relay(&relay, &format!("{}/slow", upstream.base)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.bytes().await.expect("body streamed to the end");
    assert_eq!(body.len(), SLOW_CHUNKS * SLOW_CHUNK_BYTES);
    assert!(body.iter().all(|b| *b == b's'));

    let _ = shutdown_tx.send(());
    let _ = upstream.shutdown.send(());
}

#[tokio::test]
async fn upstream_stalling_before_headers_times_out_as_500() {
    let upstream = start_upstream().await;
    let config = RelayConfig {
        fetch_timeout: Some(Duration::from_millis(300)),
        ..open_config()
    };
    let (relay, shutdown_tx) = start_relay(config).await;

    let response = get_via_relay(&relay, &format!("{}/stall", upstream.base)).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let message = response.text().await.unwrap();
    assert!(message.starts_with("Error fetching the URL: request timed out"));

    let _ = shutdown_tx.send(());
    let _ = upstream.shutdown.send(());
}

#[tokio::test]
async fn nonstandard_upstream_status_keeps_numeric_message() {
    let upstream = start_upstream().await;
    let (relay, shutdown_tx) = start_relay(open_config()).await;

    let response = get_via_relay(&relay, &format!("{}/origin-error", upstream.base)).await;
    assert_eq!(response.status().as_u16(), 520);
    assert_eq!(response.text().await.unwrap(), "HTTP 520");

    let _ = shutdown_tx.send(());
    let _ = upstream.shutdown.send(());
}

#[tokio::test]
async fn unreachable_upstream_reports_500() {
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_address = unused.local_addr().unwrap();
    drop(unused);

    let (relay, shutdown_tx) = start_relay(open_config()).await;

    let response = get_via_relay(&relay, &format!("http://{dead_address}/gone")).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let message = response.text().await.unwrap();
    assert!(
        message.starts_with("Error fetching the URL"),
        "unexpected message: {message}"
    );

    let healthz = reqwest::get(format!("{relay}/healthz")).await.unwrap();
    assert_eq!(healthz.status(), StatusCode::OK);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn config_endpoint_serves_server_side_values() {
    let config = RelayConfig {
        storage: Some(ClientConfig {
            url: "https://project.supabase.co".to_owned(),
            key: "anon-key".to_owned(),
        }),
        ..RelayConfig::default()
    };
    let (relay, shutdown_tx) = start_relay(config).await;

    let served: ClientConfig = reqwest::get(format!("{relay}/config"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(served.url, "https://project.supabase.co");
    assert_eq!(served.key, "anon-key");

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn config_endpoint_without_storage_is_500() {
    let (relay, shutdown_tx) = start_relay(RelayConfig::default()).await;

    let response = reqwest::get(format!("{relay}/config")).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn healthz_reports_ok() {
    let (relay, shutdown_tx) = start_relay(RelayConfig::default()).await;

    let body: serde_json::Value = reqwest::get(format!("{relay}/healthz"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body, serde_json::json!({"ok": true}));

    let _ = shutdown_tx.send(());
}

struct Upstream {
    base: String,
    hits: Arc<AtomicUsize>,
    shutdown: oneshot::Sender<()>,
}

fn open_config() -> RelayConfig {
    RelayConfig {
        allowlist: DomainAllowlist::disabled(),
        ..RelayConfig::default()
    }
}

async fn get_via_relay(relay: &str, target: &str) -> reqwest::Response {
    let url = reqwest::Url::parse_with_params(&format!("{relay}/fetch-proxy"), &[("url", target)])
        .expect("build relay url");
    reqwest::get(url).await.expect("relay reachable")
}

async fn start_relay(config: RelayConfig) -> (String, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral relay socket");
    let address = listener.local_addr().expect("relay local addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let state = AppState::new(config).expect("relay state");
    let server = axum::serve(listener, build_router(state)).with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });

    (format!("http://{}", address), shutdown_tx)
}

async fn start_upstream() -> Upstream {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral upstream socket");
    let address: SocketAddr = listener.local_addr().expect("upstream local addr");
    let hits = Arc::new(AtomicUsize::new(0));
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let router = Router::new()
        .route("/uc", get(|| async { Redirect::to("/files/report.pdf") }))
        .route("/files/report.pdf", get(report_pdf))
        .route("/plain", get(|| async { Response::new(Body::from("raw bytes")) }))
        .route("/missing", get(|| async { StatusCode::NOT_FOUND }))
        .route(
            "/large",
            get(|| async { vec![b'z'; LARGE_BODY_BYTES].into_response() }),
        )
        .route("/slow", get(slow_body))
        .route(
            "/stall",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(3)).await;
                "too late"
            }),
        )
        .route(
            "/origin-error",
            get(|| async { StatusCode::from_u16(520).unwrap() }),
        )
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&hits),
            count_hits,
        ));

    let server = axum::serve(listener, router).with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });

    Upstream {
        base: format!("http://{}", address),
        hits,
        shutdown: shutdown_tx,
    }
}

async fn report_pdf() -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, "application/pdf"),
            (header::CONTENT_DISPOSITION, "attachment; filename=\"report.pdf\""),
        ],
        PDF_BYTES,
    )
}

async fn slow_body() -> Response {
    let chunks = futures::stream::unfold(0, |sent| async move {
        if sent == SLOW_CHUNKS {
            return None;
        }
        tokio::time::sleep(SLOW_CHUNK_GAP).await;
        let chunk = Bytes::from(vec![b's'; SLOW_CHUNK_BYTES]);
        Some((Ok::<_, std::io::Error>(chunk), sent + 1))
    });
    Response::new(Body::from_stream(chunks))
}

async fn count_hits(
    State(hits): State<Arc<AtomicUsize>>,
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    hits.fetch_add(1, Ordering::SeqCst);
    next.run(request).await
}
