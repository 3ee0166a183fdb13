use std::{path::Path, sync::Arc};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    response::Response,
    routing::{get, post},
};
use serde_json::{Value, json};
use tower_http::{
    services::{ServeDir, ServeFile},
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::{
    analyze::{AnalysisResult, AnalyzeRequest, AnalyzeService},
    cache::{AnalyzeCache, Clock},
    download::{DownloadJob, DownloadOrchestrator, DownloadQuery},
    error::{ApiError, StartupError},
    extractor::Extractor,
    installer::InstallerSettings,
    scratch::WorkDir,
    thumbnail::{ThumbnailQuery, ThumbnailResolver, build_http_client},
};

#[derive(Debug, Clone)]
pub struct AppState {
    pub analyzer: Arc<AnalyzeService>,
    pub downloads: Arc<DownloadOrchestrator>,
    pub thumbnails: Arc<ThumbnailResolver>,
    pub installer: Arc<InstallerSettings>,
}

impl AppState {
    pub fn new(
        extractor: Extractor,
        work_dir: WorkDir,
        clock: Arc<dyn Clock>,
        installer: InstallerSettings,
    ) -> Result<Self, StartupError> {
        let analyzer = Arc::new(AnalyzeService::new(
            extractor.clone(),
            AnalyzeCache::new(clock),
        ));
        let thumbnails = ThumbnailResolver::new(
            build_http_client()?,
            extractor.clone(),
            Arc::clone(&analyzer),
            work_dir.clone(),
        );

        Ok(Self {
            analyzer,
            downloads: Arc::new(DownloadOrchestrator::new(extractor, work_dir)),
            thumbnails: Arc::new(thumbnails),
            installer: Arc::new(installer),
        })
    }
}

/// API routes plus, when `public_dir` exists, the static front-end with an
/// `index.html` fallback for client-side routes.
pub fn build_router(state: AppState, public_dir: Option<&Path>) -> Router {
    let router = Router::new()
        .route("/api/health", get(health))
        .route("/api/analyze", post(analyze))
        .route("/api/download", get(download))
        .route("/api/thumbnail", get(thumbnail))
        .route("/api/thumbnail-view", get(thumbnail_view))
        .route("/download/windows", get(windows_installer))
        .with_state(state);

    let router = match public_dir {
        Some(dir) if dir.is_dir() => {
            info!("Serving front-end from {}", dir.display());
            let index = ServeFile::new(dir.join("index.html"));
            router.fallback_service(ServeDir::new(dir).fallback(index))
        }
        Some(dir) => {
            warn!(
                "Front-end directory {} not found, serving the API only",
                dir.display()
            );
            router
        }
        None => router,
    };

    router.layer(TraceLayer::new_for_http())
}

async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}

/// The body is taken raw so malformed JSON gets the same 400 as a missing url.
async fn analyze(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<AnalysisResult>, ApiError> {
    let request = AnalyzeRequest::from_body(&body).map_err(ApiError::json)?;
    let result = state
        .analyzer
        .analyze(&request.url)
        .await
        .map_err(ApiError::json)?;
    Ok(Json(result))
}

async fn download(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, ApiError> {
    let job = DownloadJob::try_from(query).map_err(ApiError::text)?;
    state.downloads.run(job).await.map_err(ApiError::text)
}

async fn thumbnail(
    State(state): State<AppState>,
    Query(query): Query<ThumbnailQuery>,
) -> Result<Response, ApiError> {
    let source = query.source().map_err(ApiError::text)?;
    let image = state
        .thumbnails
        .resolve(&source)
        .await
        .map_err(ApiError::text)?;
    image
        .into_attachment(&query.base_name())
        .map_err(ApiError::text)
}

async fn thumbnail_view(
    State(state): State<AppState>,
    Query(query): Query<ThumbnailQuery>,
) -> Result<Response, ApiError> {
    let source = query.source().map_err(ApiError::text)?;
    let image = state
        .thumbnails
        .resolve(&source)
        .await
        .map_err(ApiError::text)?;
    Ok(image.into_inline())
}

async fn windows_installer(State(state): State<AppState>) -> Response {
    state.installer.respond().await
}
