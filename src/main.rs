use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use anyhow::Context;
use serde_json::json;

mod caption;
mod config;
mod download;
mod export;
mod extract;
mod models;
mod pipeline;

use crate::caption::OllamaCaptioner;
use crate::config::Settings;
use crate::download::{ImageFetcher, LocalImageLoader};
use crate::export::ExportFormat;
use crate::extract::{ExtractionError, PageFetcher};
use crate::models::{CaptionFileRequest, CaptionFilesRequest, CaptionRequest};
use crate::pipeline::{CancelToken, Pipeline, PipelineError};

#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
    cancel: CancelToken,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let settings = Settings::new()?;

    // Everything expensive is built once here and shared by all requests.
    let pages = PageFetcher::new(&settings.scraper)?;
    let images = ImageFetcher::new(&settings.images, &settings.scraper.user_agent)?;
    let oracle = Arc::new(OllamaCaptioner::new(settings.captioner.clone())?);
    let local_images = match &settings.images.local_root {
        Some(root) => {
            let loader = LocalImageLoader::new(root, settings.images.max_bytes)
                .with_context(|| format!("local image root {root} is not usable"))?;
            tracing::info!(root = %loader.root().display(), "local image captioning enabled");
            Some(loader)
        }
        None => None,
    };
    let pipeline = Pipeline::new(pages, images, oracle)
        .with_local_images(local_images)
        .with_caption_timeout(settings.captioner.timeout())
        .with_default_prompt(settings.captioner.default_prompt.clone());

    let state = AppState {
        pipeline: Arc::new(pipeline),
        cancel: CancelToken::new(),
    };
    let cancel = state.cancel.clone();

    let app = Router::new()
        .route("/health", get(health))
        .route("/caption", post(caption_endpoint))
        .route("/caption/file", post(caption_file_endpoint))
        .route("/caption/files", post(caption_files_endpoint))
        .with_state(state);

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("listening on {}", listener.local_addr()?);
    tracing::info!(
        endpoint = %settings.captioner.endpoint,
        model = %settings.captioner.model,
        "captioner configured"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("shutdown requested, cancelling running batches");
            cancel.cancel();
        })
        .await?;

    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        signal(SignalKind::terminate())?.recv().await;
        Ok::<(), std::io::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<std::io::Result<()>>();

    first_signal(tokio::signal::ctrl_c(), terminate).await;
}

/// Waits for whichever source fires first. A source whose handler failed to
/// install is logged and never fires.
async fn first_signal(
    ctrl_c: impl Future<Output = std::io::Result<()>>,
    terminate: impl Future<Output = std::io::Result<()>>,
) {
    let ctrl_c = async move {
        if let Err(err) = ctrl_c.await {
            tracing::error!("Unable to listen for Ctrl-C: {}", err);
            std::future::pending::<()>().await;
        }
    };
    let terminate = async move {
        if let Err(err) = terminate.await {
            tracing::error!("Unable to listen for SIGTERM: {}", err);
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = ctrl_c => tracing::info!("Ctrl-C received"),
        _ = terminate => tracing::info!("SIGTERM received"),
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn caption_endpoint(
    State(state): State<AppState>,
    Json(req): Json<CaptionRequest>,
) -> Response {
    if req.max_images == Some(0) {
        return detail(StatusCode::BAD_REQUEST, "max_images must be positive");
    }

    let format = match req.format.as_deref().map(str::parse::<ExportFormat>) {
        None => ExportFormat::Json,
        Some(Ok(format)) => format,
        Some(Err(e)) => return detail(StatusCode::BAD_REQUEST, &e.to_string()),
    };

    let result = state
        .pipeline
        .process(
            &req.url,
            req.prompt.as_deref(),
            req.max_images,
            req.scope,
            &state.cancel,
        )
        .await;

    let summary = match result {
        Ok(summary) => summary,
        Err(e) => return pipeline_error_response(&e),
    };

    if format == ExportFormat::Json {
        return (StatusCode::OK, Json(summary)).into_response();
    }

    match export::render(&summary, format) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, format.content_type())],
            body,
        )
            .into_response(),
        Err(e) => detail(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

async fn caption_file_endpoint(
    State(state): State<AppState>,
    Json(req): Json<CaptionFileRequest>,
) -> Response {
    match state
        .pipeline
        .process_image_file(Path::new(&req.path), req.prompt.as_deref())
        .await
    {
        Ok(Ok(record)) => (StatusCode::OK, Json(record)).into_response(),
        Ok(Err(failure)) => (StatusCode::UNPROCESSABLE_ENTITY, Json(failure)).into_response(),
        Err(e) => pipeline_error_response(&e),
    }
}

async fn caption_files_endpoint(
    State(state): State<AppState>,
    Json(req): Json<CaptionFilesRequest>,
) -> Response {
    match state
        .pipeline
        .process_image_files(&req.paths, req.prompt.as_deref(), &state.cancel)
        .await
    {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(e) => pipeline_error_response(&e),
    }
}

fn pipeline_error_response(e: &PipelineError) -> Response {
    let (status, message) = error_status(e);
    detail(status, &message)
}

fn error_status(e: &PipelineError) -> (StatusCode, String) {
    match e {
        PipelineError::Extraction(ExtractionError::InvalidUrl(msg)) => {
            (StatusCode::BAD_REQUEST, msg.clone())
        }
        PipelineError::Extraction(ExtractionError::NotHtml) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            "URL did not return HTML".to_string(),
        ),
        PipelineError::Extraction(ExtractionError::Upstream) => {
            (StatusCode::BAD_GATEWAY, "Upstream returned an error".to_string())
        }
        PipelineError::Extraction(ExtractionError::Request(msg)) => (
            StatusCode::BAD_GATEWAY,
            format!("Upstream request failed: {}", msg),
        ),
        PipelineError::Cancelled => (
            StatusCode::SERVICE_UNAVAILABLE,
            "Processing was cancelled".to_string(),
        ),
        PipelineError::LocalFilesDisabled => (
            StatusCode::FORBIDDEN,
            "Local image captioning is not enabled".to_string(),
        ),
    }
}

fn detail(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"detail": message}))).into_response()
}
