//! Private scratch directory. Files of one job share a `vd_<uuid>` token and
//! go away when the job's [`JobArtifacts`] is dropped.

use std::{
    io::ErrorKind,
    path::PathBuf,
    sync::{Mutex, PoisonError},
    time::{Duration, SystemTime},
};

use tokio::{runtime::Handle, time::Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{error::AppError, extractor::ProcessGroup};

pub const TOKEN_PREFIX: &str = "vd_";
const WRITER_SETTLE_LIMIT: Duration = Duration::from_secs(2);
const WRITER_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Creates the directory if needed. Safe to call concurrently.
    pub async fn ensure(&self) -> Result<(), AppError> {
        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o700);

        builder
            .create(&self.root)
            .await
            .map_err(|error| AppError::io("could not create the temporary directory", error))
    }

    pub async fn begin_job(&self) -> Result<JobArtifacts, AppError> {
        self.ensure().await?;
        Ok(JobArtifacts {
            dir: self.root.clone(),
            token: format!("{TOKEN_PREFIX}{}", Uuid::new_v4()),
            writers: Mutex::new(Vec::new()),
        })
    }

    /// Removes job files left behind by a previous process, e.g. after a crash.
    pub async fn sweep_stale(&self, older_than: Duration) -> usize {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(error) => {
                if error.kind() != ErrorKind::NotFound {
                    warn!("Could not open temporary directory for cleanup: {error}");
                }
                return 0;
            }
        };

        let now = SystemTime::now();
        let mut removed = 0;

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(error) => {
                    warn!("Could not iterate temporary directory for cleanup: {error}");
                    break;
                }
            };

            if !is_job_file_name(&entry.file_name().to_string_lossy()) {
                continue;
            }

            let path = entry.path();
            let modified_at = match entry.metadata().await.and_then(|meta| meta.modified()) {
                Ok(value) => value,
                Err(error) => {
                    warn!("Could not read modification time of {:?}: {error}", path);
                    continue;
                }
            };

            let age = now.duration_since(modified_at).unwrap_or_default();
            if age < older_than {
                continue;
            }

            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(error) if error.kind() == ErrorKind::NotFound => {}
                Err(error) => warn!("Could not remove stale temporary file {:?}: {error}", path),
            }
        }

        if removed > 0 {
            info!("Removed {removed} stale temporary file(s)");
        }
        removed
    }
}

/// `vd_<uuid>...`, as produced by [`WorkDir::begin_job`].
fn is_job_file_name(name: &str) -> bool {
    name.strip_prefix(TOKEN_PREFIX)
        .and_then(|rest| rest.get(..36))
        .is_some_and(|candidate| Uuid::parse_str(candidate).is_ok())
}

/// Files belonging to one job, removed on drop.
#[derive(Debug)]
pub struct JobArtifacts {
    dir: PathBuf,
    token: String,
    writers: Mutex<Vec<ProcessGroup>>,
}

impl JobArtifacts {
    pub fn token(&self) -> &str {
        &self.token
    }

    /// `-o` template that makes the extractor write `<token>.<ext>`.
    pub fn output_template(&self) -> String {
        self.dir
            .join(format!("{}.%(ext)s", self.token))
            .to_string_lossy()
            .into_owned()
    }

    /// Cleanup waits for `group` to exit before deleting anything.
    pub fn track_writer(&self, group: ProcessGroup) {
        self.writers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(group);
    }

    /// Largest regular file whose name starts with the token. The extractor
    /// picks the final extension itself, so the name is not known upfront.
    pub async fn largest_output(&self) -> Result<Option<PathBuf>, AppError> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|error| AppError::io("could not open the temporary directory", error))?;

        let mut best: Option<(u64, PathBuf)> = None;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|error| AppError::io("could not list temporary files", error))?
        {
            if !entry.file_name().to_string_lossy().starts_with(&self.token) {
                continue;
            }

            let metadata = match entry.metadata().await {
                Ok(metadata) if metadata.is_file() => metadata,
                Ok(_) => continue,
                Err(error) if error.kind() == ErrorKind::NotFound => continue,
                Err(error) => return Err(AppError::io("could not inspect a temporary file", error)),
            };

            if best.as_ref().is_none_or(|(size, _)| metadata.len() > *size) {
                best = Some((metadata.len(), entry.path()));
            }
        }

        Ok(best.map(|(_, path)| path))
    }
}

impl Drop for JobArtifacts {
    fn drop(&mut self) {
        let cleanup = Cleanup {
            dir: std::mem::take(&mut self.dir),
            token: std::mem::take(&mut self.token),
            writers: std::mem::take(
                self.writers
                    .get_mut()
                    .unwrap_or_else(PoisonError::into_inner),
            ),
        };

        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(cleanup.run());
            }
            Err(_) => {
                cleanup.remove_files();
            }
        }
    }
}

/// Deferred removal of one job's files.
#[derive(Debug)]
struct Cleanup {
    dir: PathBuf,
    token: String,
    writers: Vec<ProcessGroup>,
}

impl Cleanup {
    async fn run(self) {
        let deadline = Instant::now() + WRITER_SETTLE_LIMIT;
        while self.writers.iter().any(|group| group.is_alive()) {
            if Instant::now() >= deadline {
                warn!(
                    "yt-dlp for {} still running after {}s, removing its files anyway",
                    self.token,
                    WRITER_SETTLE_LIMIT.as_secs()
                );
                break;
            }
            tokio::time::sleep(WRITER_POLL_INTERVAL).await;
        }

        if let Err(error) = tokio::task::spawn_blocking(move || self.remove_files()).await {
            warn!("Temporary file cleanup did not complete: {error}");
        }
    }

    /// Deletes every file carrying the token. Failures are logged only.
    fn remove_files(&self) -> usize {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(error) => {
                if error.kind() != ErrorKind::NotFound {
                    warn!("Could not list {:?} for cleanup: {error}", self.dir);
                }
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries.filter_map(Result::ok) {
            if !entry.file_name().to_string_lossy().starts_with(&self.token) {
                continue;
            }

            let path = entry.path();
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(error) if error.kind() == ErrorKind::NotFound => {}
                Err(error) => warn!("Could not remove temporary file {:?}: {error}", path),
            }
        }

        if removed > 0 {
            debug!("Removed {removed} temporary file(s) for {}", self.token);
        }
        removed
    }
}
