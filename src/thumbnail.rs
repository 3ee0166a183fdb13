//! Thumbnail proxy used by `/api/thumbnail` and `/api/thumbnail-view`.
//!
//! Image hosts often reject hot-linking or block by region, so a failed
//! direct fetch falls back to letting the extractor download the thumbnail
//! itself into the scratch directory.

use std::{sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    http::{
        HeaderMap, HeaderValue,
        header::{CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{
    analyze::{ANALYZE_TIMEOUT, AnalyzeService},
    config::non_empty,
    error::{AppError, StartupError},
    extractor::{Extractor, ExtractorError},
    filename::{build_content_disposition, safe_filename},
    scratch::WorkDir,
};

const THUMBNAIL_FETCH_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_IMAGE_TYPE: &str = "image/jpeg";
const DEFAULT_TITLE: &str = "preview";

#[derive(Debug, Default, Clone, Deserialize)]
pub struct ThumbnailQuery {
    pub url: Option<String>,
    pub src: Option<String>,
    pub title: Option<String>,
}

impl ThumbnailQuery {
    pub fn source(&self) -> Result<ThumbnailSource, AppError> {
        let page_url = self.url.as_deref().and_then(non_empty).map(ToString::to_string);

        match (self.src.as_deref().and_then(non_empty), page_url) {
            (Some(src), page_url) => Ok(ThumbnailSource::Direct {
                src: src.to_string(),
                page_url,
            }),
            (None, Some(url)) => Ok(ThumbnailSource::Page { url }),
            (None, None) => Err(AppError::validation("url is required")),
        }
    }

    pub fn base_name(&self) -> String {
        safe_filename(self.title.as_deref(), DEFAULT_TITLE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThumbnailSource {
    /// Image URL supplied by the client. `page_url`, when present, enables the
    /// extractor fallback.
    Direct {
        src: String,
        page_url: Option<String>,
    },
    /// Only the media page is known; the image URL comes from its analysis.
    Page { url: String },
}

#[derive(Debug, Clone)]
pub struct ThumbnailImage {
    pub bytes: Bytes,
    pub content_type: String,
}

impl ThumbnailImage {
    pub fn extension(&self) -> &'static str {
        if self.content_type.contains("png") {
            "png"
        } else if self.content_type.contains("webp") {
            "webp"
        } else {
            "jpg"
        }
    }

    /// Download response named `<base_name>.<ext>`.
    pub fn into_attachment(self, base_name: &str) -> Result<Response, AppError> {
        let filename = format!("{base_name}.{}", self.extension());
        let mut headers = self.headers();
        headers.insert(
            CONTENT_DISPOSITION,
            HeaderValue::from_str(&build_content_disposition(&filename)).map_err(|_| {
                AppError::Internal("could not build the thumbnail headers".to_string())
            })?,
        );
        Ok((headers, self.bytes).into_response())
    }

    /// Inline response for `<img>` previews; never cached.
    pub fn into_inline(self) -> Response {
        let mut headers = self.headers();
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
        (headers, self.bytes).into_response()
    }

    fn headers(&self) -> HeaderMap {
        let content_type = HeaderValue::from_str(&self.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_IMAGE_TYPE));
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, content_type);
        headers
    }
}

pub fn build_http_client() -> Result<reqwest::Client, StartupError> {
    Ok(reqwest::Client::builder()
        .timeout(THUMBNAIL_FETCH_TIMEOUT)
        .build()?)
}

#[derive(Debug, Clone)]
pub struct ThumbnailResolver {
    http: reqwest::Client,
    extractor: Extractor,
    analyzer: Arc<AnalyzeService>,
    work_dir: WorkDir,
}

impl ThumbnailResolver {
    pub fn new(
        http: reqwest::Client,
        extractor: Extractor,
        analyzer: Arc<AnalyzeService>,
        work_dir: WorkDir,
    ) -> Self {
        Self {
            http,
            extractor,
            analyzer,
            work_dir,
        }
    }

    pub async fn resolve(&self, source: &ThumbnailSource) -> Result<ThumbnailImage, AppError> {
        let (candidate, page_url) = match source {
            ThumbnailSource::Direct { src, page_url } => (Some(src.clone()), page_url.as_deref()),
            ThumbnailSource::Page { url } => (self.discover(url).await, Some(url.as_str())),
        };

        if let Some(candidate) = candidate
            && let Some(image) = self.fetch(&candidate).await
        {
            return Ok(image);
        }

        let Some(page_url) = page_url else {
            return Err(AppError::not_found("thumbnail not found"));
        };

        self.extract(page_url)
            .await?
            .ok_or_else(|| AppError::not_found("thumbnail not found"))
    }

    /// Thumbnail URL from the (usually cached) analysis of the page.
    async fn discover(&self, page_url: &str) -> Option<String> {
        match self.analyzer.analyze(page_url).await {
            Ok(analysis) => analysis.thumbnail_url,
            Err(error) => {
                warn!("Could not look up thumbnail URL for {page_url}: {error}");
                None
            }
        }
    }

    async fn fetch(&self, image_url: &str) -> Option<ThumbnailImage> {
        let response = match self.http.get(image_url).send().await {
            Ok(response) => response,
            Err(error) => {
                debug!("Thumbnail fetch failed for {image_url}: {error}");
                return None;
            }
        };

        if !response.status().is_success() {
            debug!(
                "Thumbnail host answered {} for {image_url}",
                response.status()
            );
            return None;
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(non_empty)
            .unwrap_or(DEFAULT_IMAGE_TYPE)
            .to_string();

        match response.bytes().await {
            Ok(bytes) => Some(ThumbnailImage {
                bytes,
                content_type,
            }),
            Err(error) => {
                debug!("Thumbnail body read failed for {image_url}: {error}");
                None
            }
        }
    }

    /// Asks the extractor to write the thumbnail next to the other job files.
    /// A missing binary is reported; any other failure means "no thumbnail".
    async fn extract(&self, page_url: &str) -> Result<Option<ThumbnailImage>, AppError> {
        let artifacts = self.work_dir.begin_job().await?;
        let args = [
            "--no-playlist",
            "--no-warnings",
            "--skip-download",
            "--write-thumbnail",
            "--convert-thumbnails",
            "jpg",
            "-o",
            artifacts.output_template().as_str(),
            page_url,
        ]
        .map(ToString::to_string);

        match self
            .extractor
            .run_for_job(&artifacts, &args, Some(ANALYZE_TIMEOUT))
            .await
        {
            Ok(_) => {}
            Err(error @ ExtractorError::NotFound { .. }) => return Err(error.into()),
            Err(error) => {
                warn!("yt-dlp could not fetch a thumbnail for {page_url}: {error}");
                return Ok(None);
            }
        }

        let Some(path) = artifacts.largest_output().await? else {
            return Ok(None);
        };

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|error| AppError::io("could not read the thumbnail file", error))?;
        let content_type = match path.extension().and_then(|ext| ext.to_str()) {
            Some("png") => "image/png",
            Some("webp") => "image/webp",
            _ => DEFAULT_IMAGE_TYPE,
        };

        Ok(Some(ThumbnailImage {
            bytes: Bytes::from(bytes),
            content_type: content_type.to_string(),
        }))
    }
}
