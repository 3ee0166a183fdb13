//! URL analysis: runs `yt-dlp -J` and normalizes the report into a format
//! catalog the front-end can render.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::{cache::AnalyzeCache, error::AppError, extractor::Extractor};

pub const ANALYZE_TIMEOUT: Duration = Duration::from_millis(45_000);
const CODEC_NONE: &str = "none";
const DEFAULT_TITLE: &str = "download";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisResult {
    pub title: String,
    #[serde(rename = "thumbnail")]
    pub thumbnail_url: Option<String>,
    pub formats: Vec<FormatDescriptor>,
    #[serde(rename = "extractor")]
    pub extractor_name: Option<String>,
    #[serde(rename = "webpage_url")]
    pub canonical_webpage_url: String,
}

/// One encoding variant offered by the extractor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormatDescriptor {
    pub format_id: String,
    #[serde(rename = "ext")]
    pub container: Option<String>,
    #[serde(rename = "isVideo")]
    pub is_video: bool,
    /// Audio-only. Muxed streams count as video.
    #[serde(rename = "isAudio")]
    pub is_audio: bool,
    pub width: Option<u32>,
    pub height: Option<u32>,
    #[serde(rename = "fps")]
    pub frame_rate: Option<f64>,
    #[serde(rename = "vcodec")]
    pub video_codec: String,
    #[serde(rename = "acodec")]
    pub audio_codec: String,
    #[serde(rename = "tbr")]
    pub bitrate: Option<f64>,
    #[serde(rename = "filesize")]
    pub approximate_size_bytes: Option<u64>,
    #[serde(rename = "format_note")]
    pub note: Option<String>,
    #[serde(rename = "protocol")]
    pub transport_protocol: Option<String>,
}

#[derive(Debug, Deserialize)]
struct YtDlpVideoInfo {
    title: Option<String>,
    fulltitle: Option<String>,
    thumbnail: Option<String>,
    #[serde(default)]
    thumbnails: Option<Vec<Option<YtDlpThumbnail>>>,
    #[serde(default)]
    formats: Option<Vec<Option<YtDlpFormat>>>,
    extractor: Option<String>,
    webpage_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct YtDlpThumbnail {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct YtDlpFormat {
    #[serde(default, deserialize_with = "lenient_format_id")]
    format_id: Option<String>,
    ext: Option<String>,
    vcodec: Option<String>,
    acodec: Option<String>,
    #[serde(default, deserialize_with = "lenient_u32")]
    width: Option<u32>,
    #[serde(default, deserialize_with = "lenient_u32")]
    height: Option<u32>,
    #[serde(default, deserialize_with = "lenient_f64")]
    fps: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    tbr: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    filesize: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    filesize_approx: Option<f64>,
    format_note: Option<String>,
    protocol: Option<String>,
}

fn lenient_format_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(id)) if !id.is_empty() => Some(id),
        Some(Value::Number(id)) if id.as_f64() != Some(0.0) => Some(id.to_string()),
        _ => None,
    })
}

fn lenient_u32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u32>, D::Error> {
    Ok(Option::<Value>::deserialize(deserializer)?
        .and_then(|value| {
            value.as_u64().or_else(|| {
                value
                    .as_f64()
                    .filter(|number| *number >= 0.0 && number.fract() == 0.0)
                    .map(|number| number as u64)
            })
        })
        .and_then(|number| u32::try_from(number).ok()))
}

fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    Ok(Option::<Value>::deserialize(deserializer)?.and_then(|value| value.as_f64()))
}

fn codec_or_none(codec: Option<String>) -> String {
    codec
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| CODEC_NONE.to_string())
}

impl FormatDescriptor {
    fn from_raw(raw: YtDlpFormat) -> Option<Self> {
        let format_id = raw.format_id?;
        let video_codec = codec_or_none(raw.vcodec);
        let audio_codec = codec_or_none(raw.acodec);
        let is_video = video_codec != CODEC_NONE;
        let is_audio = audio_codec != CODEC_NONE && !is_video;

        Some(Self {
            format_id,
            container: raw.ext,
            is_video,
            is_audio,
            width: raw.width,
            height: raw.height,
            frame_rate: raw.fps,
            video_codec,
            audio_codec,
            bitrate: raw.tbr,
            approximate_size_bytes: raw
                .filesize
                .or(raw.filesize_approx)
                .map(|bytes| bytes.max(0.0).round() as u64),
            note: raw.format_note,
            transport_protocol: raw.protocol,
        })
    }
}

/// Parses a `yt-dlp -J` report for `url`.
pub fn parse_analysis(url: &str, stdout: &str) -> Result<AnalysisResult, AppError> {
    let info: YtDlpVideoInfo =
        serde_json::from_str(stdout).map_err(|error| AppError::Parse(error.to_string()))?;

    let thumbnail_url = info.thumbnail.filter(|value| !value.is_empty()).or_else(|| {
        info.thumbnails
            .unwrap_or_default()
            .into_iter()
            .next_back()
            .flatten()
            .and_then(|thumbnail| thumbnail.url)
    });

    let formats = info
        .formats
        .unwrap_or_default()
        .into_iter()
        .flatten()
        .filter_map(FormatDescriptor::from_raw)
        .collect();

    Ok(AnalysisResult {
        title: info
            .title
            .filter(|value| !value.is_empty())
            .or(info.fulltitle.filter(|value| !value.is_empty()))
            .unwrap_or_else(|| DEFAULT_TITLE.to_string()),
        thumbnail_url,
        formats,
        extractor_name: info.extractor,
        canonical_webpage_url: info
            .webpage_url
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| url.to_string()),
    })
}

#[derive(Debug, Deserialize)]
struct RawAnalyzeRequest {
    #[serde(default)]
    url: Option<Value>,
}

/// Validated body of `POST /api/analyze`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyzeRequest {
    pub url: String,
}

impl AnalyzeRequest {
    pub fn from_body(body: &[u8]) -> Result<Self, AppError> {
        let raw: RawAnalyzeRequest =
            serde_json::from_slice(body).map_err(|_| AppError::validation("url is required"))?;

        match raw.url {
            Some(Value::String(url)) if !url.trim().is_empty() => Ok(Self { url }),
            _ => Err(AppError::validation("url is required")),
        }
    }
}

#[derive(Debug)]
pub struct AnalyzeService {
    extractor: Extractor,
    cache: AnalyzeCache,
    timeout: Duration,
}

impl AnalyzeService {
    pub fn new(extractor: Extractor, cache: AnalyzeCache) -> Self {
        Self {
            extractor,
            cache,
            timeout: ANALYZE_TIMEOUT,
        }
    }

    /// Cache-first analysis. A miss runs the extractor and stores the
    /// normalized result before returning it.
    pub async fn analyze(&self, url: &str) -> Result<AnalysisResult, AppError> {
        if url.trim().is_empty() {
            return Err(AppError::validation("url is required"));
        }

        if let Some(hit) = self.cache.get(url).await {
            debug!("Analyze cache hit for {url}");
            return Ok(hit);
        }

        let args = vec![
            "-J".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            url.to_string(),
        ];
        let output = self.extractor.run(&args, Some(self.timeout)).await?;
        let result = parse_analysis(url, &output.stdout)?;

        info!(
            "Analyzed {url}: {} format(s), extractor {:?}",
            result.formats.len(),
            result.extractor_name
        );

        self.cache.put(url, result.clone()).await;
        Ok(result)
    }
}
