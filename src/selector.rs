//! Preset → yt-dlp format selector mapping.
//!
//! The selector strings are ordered alternations (`a/b/c`) that yt-dlp
//! evaluates left to right, so compatible codecs are tried before the best
//! available stream under the requested height.

use std::str::FromStr;

use crate::error::AppError;

/// Heights above this are merged into Matroska, which tolerates the VP9/AV1
/// streams that usually carry them.
const MAX_MP4_HEIGHT: u32 = 1080;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    Mp3,
    MaxHeight(u32),
}

impl FromStr for Preset {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        if normalized == "mp3" {
            return Ok(Self::Mp3);
        }

        let digits = normalized.strip_suffix('p').unwrap_or(&normalized);
        match digits.trim().parse::<u32>() {
            Ok(height) if height > 0 => Ok(Self::MaxHeight(height)),
            _ => Err(AppError::validation("invalid preset")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    Mp3,
    Mp4,
    Mkv,
}

impl Container {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Mp4 => "mp4",
            Self::Mkv => "mkv",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Mp3 => "audio/mpeg",
            Self::Mp4 => "video/mp4",
            Self::Mkv => "video/x-matroska",
        }
    }
}

/// Concrete extractor instructions for a preset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodingPlan {
    /// `-f` expression; `None` for audio extraction.
    pub selector: Option<String>,
    pub container: Container,
}

impl EncodingPlan {
    pub fn for_preset(preset: Preset) -> Self {
        match preset {
            Preset::Mp3 => Self {
                selector: None,
                container: Container::Mp3,
            },
            Preset::MaxHeight(height) if height > MAX_MP4_HEIGHT => Self {
                selector: Some(format!(
                    "bestvideo[height<={height}]+bestaudio/best[height<={height}]"
                )),
                container: Container::Mkv,
            },
            Preset::MaxHeight(height) => Self {
                selector: Some(format!(
                    "bestvideo[vcodec^=avc1][height<={height}]+bestaudio[ext=m4a]/bestvideo[height<={height}]+bestaudio/best[height<={height}]"
                )),
                container: Container::Mp4,
            },
        }
    }

    pub fn content_type(&self) -> &'static str {
        self.container.content_type()
    }

    /// Full argument list for a materialized job writing to `output_template`.
    pub fn extractor_args(&self, output_template: &str, url: &str) -> Vec<String> {
        let mut args = vec!["--no-playlist".to_string(), "--no-warnings".to_string()];

        match (&self.selector, self.container) {
            (None, _) | (_, Container::Mp3) => {
                args.extend(["-x", "--audio-format", "mp3"].map(ToString::to_string));
            }
            (Some(selector), Container::Mkv) => {
                args.extend(
                    ["-f", selector.as_str(), "--merge-output-format", "mkv"]
                        .map(ToString::to_string),
                );
            }
            (Some(selector), Container::Mp4) => {
                args.extend(
                    [
                        "-f",
                        selector.as_str(),
                        "--merge-output-format",
                        "mp4",
                        "--remux-video",
                        "mp4",
                    ]
                    .map(ToString::to_string),
                );
            }
        }

        args.push("-o".to_string());
        args.push(output_template.to_string());
        args.push(url.to_string());
        args
    }
}

/// Resolves a client preset such as `720p`, `2160p` or `mp3`.
pub fn resolve(preset: &str) -> Result<EncodingPlan, AppError> {
    preset.parse::<Preset>().map(EncodingPlan::for_preset)
}

pub fn content_type_for_extension(extension: &str) -> Option<&'static str> {
    let content_type = match extension.to_ascii_lowercase().as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "wav" => "audio/wav",
        "ogg" | "opus" => "audio/ogg",
        "flac" => "audio/flac",
        _ => return None,
    };
    Some(content_type)
}
