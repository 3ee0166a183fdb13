use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use axum::Router;
use chrono::Utc;
use media_gateway::{
    cache::ManualClock,
    extractor::{Extractor, ExtractorSettings},
    installer::InstallerSettings,
    routes::{AppState, build_router},
    scratch::WorkDir,
};
use tempfile::TempDir;

pub const ANALYSIS_FIXTURE: &str = r#"{
    "title": "Two videos",
    "thumbnail": "http://127.0.0.1:9/unreachable.jpg",
    "extractor": "generic",
    "webpage_url": "https://example.com/watch/v",
    "formats": [
        {"format_id": "22", "ext": "mp4", "vcodec": "avc1.64001F", "acodec": "mp4a.40.2",
         "width": 1280, "height": 720, "fps": 30},
        {"format_id": "137", "ext": "mp4", "vcodec": "avc1.640028", "acodec": "none",
         "width": 1920, "height": 1080, "fps": 30, "filesize": 5242880}
    ]
}"#;

/// Fake yt-dlp: `-J` prints the analysis, `-o -` prints a short payload,
/// `--write-thumbnail` writes a jpg, anything else writes a 200000 byte mp4.
const EXTRACTOR_STUB: &str = r#"out=""
prev=""
thumbnail=""
for arg in "$@"; do
  case "$arg" in
    -J) cat "$FIXTURE"; exit 0 ;;
    --write-thumbnail) thumbnail="yes" ;;
  esac
  if [ "$prev" = "-o" ]; then out="$arg"; fi
  prev="$arg"
done
if [ "$out" = "-" ]; then
  printf 'piped-audio'
  exit 0
fi
if [ -n "$thumbnail" ]; then
  printf 'jpeg-bytes' > "$(printf '%s' "$out" | sed 's/%(ext)s/jpg/')"
  exit 0
fi
head -c 200000 /dev/zero > "$(printf '%s' "$out" | sed 's/%(ext)s/mp4/')""#;

pub struct TestApp {
    pub dir: TempDir,
    pub router: Router,
}

impl TestApp {
    pub fn work_dir(&self) -> PathBuf {
        self.dir.path().join("work")
    }

    pub fn job_files(&self) -> Vec<String> {
        std::fs::read_dir(self.work_dir())
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .map(|entry| entry.file_name().to_string_lossy().into_owned())
                    .filter(|name| name.starts_with("vd_"))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Job files are removed on a background task after the response ends.
    pub async fn settled_job_files(&self) -> Vec<String> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let names = self.job_files();
            if names.is_empty() || Instant::now() >= deadline {
                return names;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

pub fn spawn_app() -> TestApp {
    spawn_app_with_public_dir(None)
}

pub fn spawn_app_with_public_dir(public_dir: Option<&Path>) -> TestApp {
    let dir = TempDir::new().unwrap();
    let fixture = dir.path().join("analysis.json");
    std::fs::write(&fixture, ANALYSIS_FIXTURE).unwrap();

    let stub = format!("FIXTURE='{}'\n{EXTRACTOR_STUB}", fixture.display());
    let binary = write_script(dir.path(), "yt-dlp", &stub);

    let state = AppState::new(
        Extractor::new(ExtractorSettings::new(binary)),
        WorkDir::new(dir.path().join("work")),
        Arc::new(ManualClock::new(Utc::now())),
        InstallerSettings {
            redirect_url: None,
            dir: dir.path().join("installer"),
        },
    )
    .unwrap();

    TestApp {
        router: build_router(state, public_dir),
        dir,
    }
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}
