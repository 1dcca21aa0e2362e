use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{Html, IntoResponse},
    routing::get,
};
use bytes::Bytes;
use copycat_client::{
    ClientError, ErrorKind,
    ingest::{RelayClient, save_to_dir},
    upload_queue::QueueItem,
};
use copycat_core::{ClientConfig, DomainAllowlist};
use copycat_relay::{AppState, RelayConfig, build_router};
use tokio::{net::TcpListener, sync::oneshot};

const PNG_BYTES: &[u8] = b"\x89PNG fake image";

#[tokio::test]
async fn url_without_filename_header_uses_last_path_segment() {
    let upstream = start_upstream().await;
    let (relay, shutdown_tx) = start_relay(open_config()).await;
    let client = RelayClient::new(&relay).unwrap();

    let item = client
        .ingest_url(&format!("{}/files/photo.png?size=large", upstream.base), 7)
        .await
        .unwrap();
    assert_eq!(item.proposed_name, "photo.png");
    assert_eq!(item.content_type.as_deref(), Some("image/png"));
    assert_eq!(item.payload.as_ref(), PNG_BYTES);

    let _ = shutdown_tx.send(());
    let _ = upstream.shutdown.send(());
}

#[tokio::test]
async fn content_disposition_name_wins_and_placeholder_is_ignored() {
    let upstream = start_upstream().await;
    let (relay, shutdown_tx) = start_relay(open_config()).await;
    let client = RelayClient::new(&relay).unwrap();

    let named = client
        .ingest_url(&format!("{}/download", upstream.base), 7)
        .await
        .unwrap();
    assert_eq!(named.proposed_name, "report.pdf");

    let legacy = client
        .ingest_url(&format!("{}/legacy", upstream.base), 7)
        .await
        .unwrap();
    assert_eq!(legacy.proposed_name, "legacy");

    let bare = client
        .ingest_url(&format!("{}/", upstream.base), 7)
        .await
        .unwrap();
    assert_eq!(bare.proposed_name, "file-7");

    let _ = shutdown_tx.send(());
    let _ = upstream.shutdown.send(());
}

#[tokio::test]
async fn html_page_is_followed_to_its_og_image() {
    let upstream = start_upstream().await;
    let (relay, shutdown_tx) = start_relay(open_config()).await;
    let client = RelayClient::new(&relay).unwrap();

    let item = client
        .ingest_url(&format!("{}/page", upstream.base), 7)
        .await
        .unwrap();
    assert_eq!(item.proposed_name, "photo.png");
    assert_eq!(item.payload.as_ref(), PNG_BYTES);

    let err = client
        .ingest_url(&format!("{}/bare-page", upstream.base), 7)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::NoDirectImage));
    assert_eq!(err.to_string(), "No direct image found on the page.");

    let _ = shutdown_tx.send(());
    let _ = upstream.shutdown.send(());
}

#[tokio::test]
async fn upstream_and_guard_failures_surface_with_status() {
    let upstream = start_upstream().await;
    let (relay, shutdown_tx) = start_relay(open_config()).await;
    let client = RelayClient::new(&relay).unwrap();

    let err = client
        .ingest_url(&format!("{}/missing", upstream.base), 7)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "HTTP error! status: 404 - Not Found");
    assert_eq!(err.kind(), ErrorKind::Upstream);

    let guarded = RelayConfig {
        allowlist: DomainAllowlist::new(["example.org"]),
        ..RelayConfig::default()
    };
    let (guarded_relay, guarded_shutdown) = start_relay(guarded).await;
    let err = RelayClient::new(&guarded_relay)
        .unwrap()
        .ingest_url(&format!("{}/files/photo.png", upstream.base), 7)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    let _ = shutdown_tx.send(());
    let _ = guarded_shutdown.send(());
    let _ = upstream.shutdown.send(());
}

#[tokio::test]
async fn config_bootstrap_reads_relay_values() {
    let config = RelayConfig {
        storage: Some(ClientConfig {
            url: "https://project.supabase.co".to_owned(),
            key: "anon-key".to_owned(),
        }),
        ..RelayConfig::default()
    };
    let (relay, shutdown_tx) = start_relay(config).await;

    let served = RelayClient::new(&relay).unwrap().fetch_config().await.unwrap();
    assert_eq!(served.url, "https://project.supabase.co");
    assert_eq!(served.key, "anon-key");

    let _ = shutdown_tx.send(());

    let (bare_relay, bare_shutdown) = start_relay(RelayConfig::default()).await;
    let err = RelayClient::new(&bare_relay)
        .unwrap()
        .fetch_config()
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Upstream { status: 500, .. }));
    let _ = bare_shutdown.send(());
}

#[tokio::test]
async fn saved_file_stays_inside_output_directory() {
    let dir = tempfile::tempdir().unwrap();
    let item = QueueItem::new(Bytes::from_static(b"contents"), "../../escape.txt", None);

    let path = save_to_dir(&item, dir.path()).await.unwrap();
    assert_eq!(path, dir.path().join("escape.txt"));
    assert_eq!(tokio::fs::read(&path).await.unwrap(), b"contents");
}

struct Upstream {
    base: String,
    shutdown: oneshot::Sender<()>,
}

fn open_config() -> RelayConfig {
    RelayConfig {
        allowlist: DomainAllowlist::disabled(),
        ..RelayConfig::default()
    }
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
    let base = format!("http://{}", listener.local_addr().expect("upstream local addr"));
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let router = Router::new()
        .route("/", get(|| async { "index" }))
        .route("/files/photo.png", get(photo))
        .route("/download", get(|| async { with_disposition("report.pdf") }))
        .route("/legacy", get(|| async { with_disposition("downloaded-file") }))
        .route("/page", get(page_with_image))
        .route(
            "/bare-page",
            get(|| async { Html("<html><head><title>none</title></head></html>") }),
        )
        .route("/missing", get(|| async { StatusCode::NOT_FOUND }))
        .with_state(base.clone());

    let server = axum::serve(listener, router).with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });

    Upstream {
        base,
        shutdown: shutdown_tx,
    }
}

async fn photo() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "image/png")], PNG_BYTES)
}

fn with_disposition(name: &'static str) -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, "application/pdf".to_owned()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{name}\""),
            ),
        ],
        "%PDF-1.4",
    )
}

async fn page_with_image(State(base): State<String>) -> Html<String> {
    Html(format!(
        r#"<html><head><meta property="og:image" content="{base}/files/photo.png"></head><body></body></html>"#
    ))
}
