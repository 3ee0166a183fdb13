use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};

use axum::{
    body::Body,
    http::{HeaderValue, StatusCode, header::LOCATION},
    response::{IntoResponse, Response},
};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use crate::{config::Config, download::attachment_headers};

pub const INSTALLER_MISSING_LOCATION: &str = "/?installer=missing";
const INSTALLER_PREFIX: &str = "videodownloadersetup-";
const INSTALLER_SUFFIX: &str = ".exe";

/// Where `/download/windows` sends the desktop installer from.
#[derive(Debug, Clone, Default)]
pub struct InstallerSettings {
    /// Hosted installer; takes precedence over local builds.
    pub redirect_url: Option<String>,
    pub dir: PathBuf,
}

impl InstallerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            redirect_url: config.installer_url.clone(),
            dir: config.installer_dir.clone(),
        }
    }

    /// Most recently modified `VideoDownloaderSetup-*.exe` in the build dir.
    pub async fn latest_installer(&self) -> Option<PathBuf> {
        let mut entries = tokio::fs::read_dir(&self.dir).await.ok()?;
        let mut best: Option<(SystemTime, PathBuf)> = None;

        while let Ok(Some(entry)) = entries.next_entry().await {
            if !is_installer_name(&entry.file_name().to_string_lossy()) {
                continue;
            }

            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            let Ok(modified) = metadata.modified() else {
                continue;
            };

            if metadata.is_file()
                && best
                    .as_ref()
                    .is_none_or(|(newest, _)| modified > *newest)
            {
                best = Some((modified, entry.path()));
            }
        }

        best.map(|(_, path)| path)
    }

    pub async fn respond(&self) -> Response {
        if let Some(url) = &self.redirect_url {
            return found(url);
        }

        let Some(path) = self.latest_installer().await else {
            return found(INSTALLER_MISSING_LOCATION);
        };

        match serve_file(&path).await {
            Ok(response) => response,
            Err(error) => {
                warn!("Could not serve installer {:?}: {error}", path);
                found(INSTALLER_MISSING_LOCATION)
            }
        }
    }
}

/// Plain 302, which is what browsers and download managers expect here.
fn found(location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(location) => (StatusCode::FOUND, [(LOCATION, location)]).into_response(),
        Err(_) => {
            warn!("Installer URL {location:?} is not a valid Location header");
            (
                StatusCode::FOUND,
                [(LOCATION, HeaderValue::from_static(INSTALLER_MISSING_LOCATION))],
            )
                .into_response()
        }
    }
}

fn is_installer_name(name: &str) -> bool {
    let lowered = name.to_ascii_lowercase();
    lowered.len() > INSTALLER_PREFIX.len() + INSTALLER_SUFFIX.len()
        && lowered.starts_with(INSTALLER_PREFIX)
        && lowered.ends_with(INSTALLER_SUFFIX)
}

async fn serve_file(path: &Path) -> Result<Response, String> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|error| error.to_string())?;
    let length = file
        .metadata()
        .await
        .map_err(|error| error.to_string())?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("VideoDownloaderSetup.exe");

    let headers = attachment_headers("application/octet-stream", filename, Some(length))
        .map_err(|error| error.to_string())?;
    info!("Serving installer {filename} ({length} bytes)");

    Ok((headers, Body::from_stream(ReaderStream::new(file))).into_response())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::http::header;
    use tempfile::TempDir;

    use super::*;

    fn settings(dir: &Path) -> InstallerSettings {
        InstallerSettings {
            redirect_url: None,
            dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn installer_names_match_case_insensitively() {
        assert!(is_installer_name("VideoDownloaderSetup-1.2.0.exe"));
        assert!(is_installer_name("videodownloadersetup-beta.EXE"));
        assert!(!is_installer_name("VideoDownloaderSetup-.exe"));
        assert!(!is_installer_name("VideoDownloaderSetup-1.2.0.msi"));
        assert!(!is_installer_name("OtherSetup-1.0.exe"));
    }

    #[tokio::test]
    async fn newest_installer_wins() {
        let dir = TempDir::new().unwrap();
        let old = dir.path().join("VideoDownloaderSetup-1.0.exe");
        let new = dir.path().join("VideoDownloaderSetup-1.1.exe");
        std::fs::write(&old, b"old").unwrap();
        std::fs::write(&new, b"new").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let an_hour_ago = SystemTime::now() - Duration::from_secs(3600);
        std::fs::File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(an_hour_ago)
            .unwrap();

        assert_eq!(settings(dir.path()).latest_installer().await, Some(new));
    }

    #[tokio::test]
    async fn configured_url_takes_precedence() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("VideoDownloaderSetup-1.0.exe"), b"x").unwrap();
        let settings = InstallerSettings {
            redirect_url: Some("https://cdn.example.com/setup.exe".to_string()),
            dir: dir.path().to_path_buf(),
        };

        let response = settings.respond().await;

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers()[header::LOCATION],
            "https://cdn.example.com/setup.exe"
        );
    }

    #[tokio::test]
    async fn missing_installer_redirects_home() {
        let dir = TempDir::new().unwrap();

        let response = settings(&dir.path().join("missing")).respond().await;

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[header::LOCATION], INSTALLER_MISSING_LOCATION);
    }

    #[tokio::test]
    async fn unusable_configured_url_falls_back_to_missing_page() {
        let settings = InstallerSettings {
            redirect_url: Some("https://cdn.example.com/setup\n.exe".to_string()),
            dir: PathBuf::from("/nonexistent"),
        };

        let response = settings.respond().await;

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[header::LOCATION], INSTALLER_MISSING_LOCATION);
    }

    #[tokio::test]
    async fn local_installer_is_served_as_attachment() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("VideoDownloaderSetup-2.0.exe"), b"MZ-binary").unwrap();

        let response = settings(dir.path()).respond().await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");
        assert!(
            response.headers()[header::CONTENT_DISPOSITION]
                .to_str()
                .unwrap()
                .contains("VideoDownloaderSetup-2.0.exe")
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"MZ-binary");
    }
}
