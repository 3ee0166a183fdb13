//! `GET /api/download`. Presets are written to the scratch directory and then
//! streamed; `mode=mp3` and `formatId` requests are piped from stdout.

use std::io;

use axum::{
    body::{Body, Bytes},
    http::{
        HeaderMap, HeaderName, HeaderValue,
        header::{CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use crate::{
    config::non_empty,
    error::AppError,
    extractor::Extractor,
    filename::{build_content_disposition, safe_extension, safe_filename, sanitize_ascii_filename},
    scratch::WorkDir,
    selector::{self, EncodingPlan, content_type_for_extension},
};

const DEFAULT_BASE_NAME: &str = "download";
const DEFAULT_PIPE_EXTENSION: &str = "mp4";
const DOWNLOAD_FILENAME_HEADER: &str = "x-download-filename";

/// Raw query string of a download request.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct DownloadQuery {
    pub url: Option<String>,
    pub preset: Option<String>,
    #[serde(rename = "formatId")]
    pub format_id: Option<String>,
    pub mode: Option<String>,
    pub title: Option<String>,
    pub ext: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Write the merged file to disk, then stream it.
    Materialize(EncodingPlan),
    /// Extract audio to mp3 on stdout.
    PipeAudio,
    /// Forward one format as-is.
    PipeFormat { format_id: String, extension: String },
}

/// A validated download request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadJob {
    pub source_url: String,
    pub base_name: String,
    pub delivery: Delivery,
}

impl TryFrom<DownloadQuery> for DownloadJob {
    type Error = AppError;

    /// Precedence: `preset`, then `mode=mp3`, then `formatId`.
    fn try_from(query: DownloadQuery) -> Result<Self, Self::Error> {
        let source_url = query
            .url
            .as_deref()
            .and_then(non_empty)
            .map(ToString::to_string)
            .ok_or_else(|| AppError::validation("url is required"))?;
        let base_name = safe_filename(query.title.as_deref(), DEFAULT_BASE_NAME);

        let delivery = if let Some(preset) = query.preset.as_deref().and_then(non_empty) {
            Delivery::Materialize(selector::resolve(preset)?)
        } else if query.mode.as_deref() == Some("mp3") {
            Delivery::PipeAudio
        } else {
            let format_id = query
                .format_id
                .as_deref()
                .and_then(non_empty)
                .ok_or_else(|| AppError::validation("formatId is required (or use mode=mp3)"))?;
            Delivery::PipeFormat {
                format_id: format_id.to_string(),
                extension: safe_extension(query.ext.as_deref(), DEFAULT_PIPE_EXTENSION),
            }
        };

        Ok(Self {
            source_url,
            base_name,
            delivery,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DownloadOrchestrator {
    extractor: Extractor,
    work_dir: WorkDir,
}

impl DownloadOrchestrator {
    pub fn new(extractor: Extractor, work_dir: WorkDir) -> Self {
        Self {
            extractor,
            work_dir,
        }
    }

    pub async fn run(&self, job: DownloadJob) -> Result<Response, AppError> {
        info!("Download requested: {:?} for {}", job.delivery, job.source_url);

        match &job.delivery {
            Delivery::Materialize(plan) => self.materialize(&job, plan).await,
            Delivery::PipeAudio => {
                let args = base_args(["-x", "--audio-format", "mp3", "-o", "-"], &job.source_url);
                let filename = format!("{}.mp3", job.base_name);
                self.pipe(args, "audio/mpeg", &filename).await
            }
            Delivery::PipeFormat {
                format_id,
                extension,
            } => {
                let args = base_args(["-f", format_id.as_str(), "-o", "-"], &job.source_url);
                let filename = format!("{}.{extension}", job.base_name);
                self.pipe(args, "application/octet-stream", &filename).await
            }
        }
    }

    async fn materialize(
        &self,
        job: &DownloadJob,
        plan: &EncodingPlan,
    ) -> Result<Response, AppError> {
        // Owned from here on; every early return below drops it and removes
        // whatever the extractor left behind.
        let artifacts = self.work_dir.begin_job().await?;
        let args = plan.extractor_args(&artifacts.output_template(), &job.source_url);

        self.extractor.run_for_job(&artifacts, &args, None).await?;

        let output = artifacts
            .largest_output()
            .await?
            .ok_or_else(|| AppError::Internal("output file not found".to_string()))?;

        let extension = output
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| plan.container.extension().to_string());
        let content_type = content_type_for_extension(&extension).unwrap_or(plan.content_type());
        let filename = format!("{}.{extension}", job.base_name);

        let file = tokio::fs::File::open(&output)
            .await
            .map_err(|error| AppError::io("could not open the downloaded file", error))?;
        let length = file
            .metadata()
            .await
            .map_err(|error| AppError::io("could not read the downloaded file size", error))?
            .len();

        info!(
            "Serving {} ({length} bytes) as {filename:?} for token {}",
            output.display(),
            artifacts.token()
        );

        let body = async_stream::stream! {
            // Dropped with the body, whether it finished or the client left.
            let _artifacts = artifacts;
            let mut chunks = ReaderStream::new(file);
            while let Some(chunk) = chunks.next().await {
                yield chunk;
            }
        };

        let headers = attachment_headers(content_type, &filename, Some(length))?;
        Ok((headers, Body::from_stream(body)).into_response())
    }

    /// Forwards stdout live. The first chunk is awaited before answering so a
    /// process that fails without producing output still yields a 500.
    async fn pipe(
        &self,
        args: Vec<String>,
        content_type: &'static str,
        filename: &str,
    ) -> Result<Response, AppError> {
        let (process, stdout) = self.extractor.spawn_streaming(&args)?;
        let mut chunks = ReaderStream::new(stdout);

        let first = match chunks.next().await {
            Some(Ok(chunk)) => chunk,
            Some(Err(error)) => {
                return Err(AppError::io("could not read yt-dlp output", error));
            }
            None => {
                process.finish().await?;
                let headers = attachment_headers(content_type, filename, Some(0))?;
                return Ok((headers, Body::empty()).into_response());
            }
        };

        let body = async_stream::stream! {
            yield Ok::<Bytes, io::Error>(first);

            let mut interrupted = false;
            while let Some(chunk) = chunks.next().await {
                match chunk {
                    Ok(chunk) => yield Ok(chunk),
                    Err(error) => {
                        interrupted = true;
                        yield Err(error);
                        break;
                    }
                }
            }

            // Headers are already sent; the only signal left is a truncated body.
            if !interrupted {
                if let Err(error) = process.finish().await {
                    warn!("yt-dlp failed mid-stream: {error}");
                    yield Err(io::Error::other(error.to_string()));
                }
            }
        };

        let headers = attachment_headers(content_type, filename, None)?;
        Ok((headers, Body::from_stream(body)).into_response())
    }
}

fn base_args<const N: usize>(flags: [&str; N], url: &str) -> Vec<String> {
    ["--no-playlist", "--no-warnings"]
        .into_iter()
        .chain(flags)
        .chain([url])
        .map(ToString::to_string)
        .collect()
}

pub(crate) fn attachment_headers(
    content_type: &'static str,
    filename: &str,
    length: Option<u64>,
) -> Result<HeaderMap, AppError> {
    let invalid_header = |_| AppError::Internal("could not build the download headers".to_string());

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(filename)).map_err(invalid_header)?,
    );
    headers.insert(
        HeaderName::from_static(DOWNLOAD_FILENAME_HEADER),
        HeaderValue::from_str(&sanitize_ascii_filename(filename)).map_err(invalid_header)?,
    );
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    if let Some(length) = length {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    }
    Ok(headers)
}
