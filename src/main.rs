//! AxoUpload server binary.
//!
//! Receives files uploaded as independently transmitted chunks, verifies
//! each chunk's digest, stores chunks under the upload directory and merges
//! them into the original file once every chunk is present. The main entry
//! point builds the Axum router and starts the HTTP listener.

mod assembly;
mod atomic;
mod background;
mod chunk_store;
mod config;
mod digest;
mod error;
mod http;
mod locking;
mod logging;
mod upload;
mod version;

use axum::extract::{DefaultBodyLimit, Extension};
use axum::http::Request;
use axum::routing::{get, patch, post};
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::assembly::AssemblyCoordinator;
use crate::background::spawn_background_tasks;
use crate::chunk_store::ChunkStore;
use crate::config::{Args, MULTIPART_OVERHEAD, UploadConfig};
use crate::http::build_cors_layer;

shadow!(build);

/// Starts the AxoUpload server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    let args = Args::parse();
    logging::init_logging(&args.log_filter);

    let store = Arc::new(ChunkStore::new(PathBuf::from(&args.upload_dir), args.digest));
    store.ensure_root().await?;
    let upload_config = Arc::new(UploadConfig::from(&args));
    let coordinator = Arc::new(AssemblyCoordinator::new(
        store.clone(),
        upload_config.clone(),
    ));
    info!(
        upload_dir = %store.root_path().display(),
        digest = ?args.digest,
        max_chunk_size = upload_config.max_chunk_size,
        max_chunks = upload_config.max_chunks,
        replace_existing = upload_config.replace_existing,
        "upload store ready"
    );

    let app = build_router(
        coordinator.clone(),
        upload_config.clone(),
        args.cors_origins.as_deref(),
    );

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let handle = Handle::new();

    info!("Starting HTTP server at {}", http_addr);
    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    spawn_background_tasks(coordinator, upload_config);
    tokio::select! {
        result = http_server => result?,
        _ = shutdown_signal(handle) => {}
    }

    Ok(())
}

/// 组装路由；表单上传同时挂在 `/upload` 上，兼容旧客户端。
fn build_router(
    coordinator: Arc<AssemblyCoordinator>,
    upload_config: Arc<UploadConfig>,
    cors_origins: Option<&str>,
) -> Router {
    let form_limit = usize::try_from(upload_config.max_chunk_size + MULTIPART_OVERHEAD)
        .unwrap_or(usize::MAX);
    let form_upload = post(upload::upload_form).layer(DefaultBodyLimit::max(form_limit));
    let mut app = Router::new()
        .route("/api/upload", form_upload.clone())
        .route("/upload", form_upload)
        .route(
            "/api/upload/chunk",
            patch(upload::upload_chunk).layer(DefaultBodyLimit::disable()),
        )
        .route("/api/upload/status", get(upload::upload_status))
        .route("/api/upload/merge", post(upload::retry_merge))
        .route("/api/version", get(version::get_version_info))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip = http::client_ip(request),
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(coordinator))
        .layer(Extension(upload_config));

    if let Some(cors_layer) = build_cors_layer(cors_origins) {
        app = app.layer(cors_layer);
    }
    app
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal, shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
