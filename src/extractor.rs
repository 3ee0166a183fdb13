//! Invocation of the external `yt-dlp` binary.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::Duration,
};

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::{Child, ChildStdout, Command},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{config::Config, scratch::JobArtifacts};

const DEFAULT_BINARY: &str = "yt-dlp";
const COOKIES_FILE_NAME: &str = "vd_cookies.txt";
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);
const MAX_CAPTURED_STDERR_BYTES: usize = 256 * 1024;

#[derive(Debug, Error)]
pub enum ExtractorError {
    #[error(
        "yt-dlp not found ({binary:?}). Restart your terminal so PATH updates, or set YT_DLP_PATH to the full path of the yt-dlp binary. Original: {source}"
    )]
    NotFound {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not start yt-dlp: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("yt-dlp exited with {}", exit_label(.code))]
    Exit { code: Option<i32>, stderr: String },

    #[error("yt-dlp was killed after running for {}s", .after.as_secs())]
    TimedOut { after: Duration, stderr: String },

    #[error("lost track of the yt-dlp process: {0}")]
    Wait(#[source] std::io::Error),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "no exit code (terminated by a signal)".to_string(),
    }
}

impl ExtractorError {
    /// Message suitable for an HTTP body: the extractor's own stderr when it
    /// produced any, the error description otherwise.
    pub fn client_message(&self) -> String {
        match self {
            Self::Exit { stderr, .. } if !stderr.trim().is_empty() => stderr.trim().to_string(),
            Self::TimedOut { stderr, .. } if !stderr.trim().is_empty() => {
                format!("{self}\n{}", stderr.trim())
            }
            other => other.to_string(),
        }
    }
}

/// Immutable extractor configuration produced by [`ExtractorSettings::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractorSettings {
    pub binary: PathBuf,
    pub cookies_file: Option<PathBuf>,
}

impl ExtractorSettings {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            cookies_file: None,
        }
    }

    pub fn with_cookies_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.cookies_file = Some(path.into());
        self
    }

    /// Resolves the binary and cookie jar exactly once. An absent or unusable
    /// cookie source resolves to `None` and is never retried.
    pub async fn resolve(config: &Config) -> Self {
        let binary = config
            .yt_dlp_path
            .clone()
            .or_else(discover_winget_binary)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BINARY));

        let cookies_file = resolve_cookies_file(
            config.cookies_file.as_deref(),
            config.cookies_b64.as_deref(),
            &std::env::temp_dir(),
        )
        .await;

        info!("Using yt-dlp binary {:?}", binary);
        match &cookies_file {
            Some(path) => info!("yt-dlp cookies enabled from {:?}", path),
            None => debug!("No yt-dlp cookies configured"),
        }

        Self {
            binary,
            cookies_file,
        }
    }
}

/// Best-effort lookup of a WinGet-installed yt-dlp on Windows.
fn discover_winget_binary() -> Option<PathBuf> {
    if !cfg!(windows) {
        return None;
    }

    let local = std::env::var_os("LOCALAPPDATA")?;
    let base = Path::new(&local)
        .join("Microsoft")
        .join("WinGet")
        .join("Packages");

    std::fs::read_dir(base)
        .ok()?
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_ok_and(|kind| kind.is_dir()))
        .filter(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .to_ascii_lowercase()
                .starts_with("yt-dlp.yt-dlp_")
        })
        .map(|entry| entry.path().join("yt-dlp.exe"))
        .find(|candidate| candidate.is_file())
}

pub(crate) async fn resolve_cookies_file(
    explicit: Option<&Path>,
    encoded: Option<&str>,
    scratch_dir: &Path,
) -> Option<PathBuf> {
    if let Some(path) = explicit {
        match tokio::fs::metadata(path).await {
            Ok(metadata) if metadata.is_file() => return Some(path.to_path_buf()),
            Ok(_) => warn!("YT_DLP_COOKIES_FILE {:?} is not a regular file", path),
            Err(error) => warn!("YT_DLP_COOKIES_FILE {:?} is not readable: {error}", path),
        }
    }

    let compact = encoded?.split_whitespace().collect::<String>();
    if compact.is_empty() {
        return None;
    }

    let decoded = match BASE64.decode(compact.as_bytes()) {
        Ok(bytes) => bytes,
        Err(error) => {
            warn!("YT_DLP_COOKIES_B64 is not valid base64, continuing without cookies: {error}");
            return None;
        }
    };

    let target = scratch_dir.join(COOKIES_FILE_NAME);
    match write_private_file(&target, &decoded).await {
        Ok(()) => Some(target),
        Err(error) => {
            warn!("Could not write cookie jar {:?}: {error}", target);
            None
        }
    }
}

async fn write_private_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(contents).await?;
    file.flush().await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }

    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractorOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Process group led by a spawned extractor. The ffmpeg it starts for merging
/// and conversion inherits the group, so signalling the group reaches it too.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessGroup {
    id: u32,
}

#[cfg(unix)]
impl ProcessGroup {
    fn kill(self) {
        if let Err(error) = self.signal(libc::SIGKILL)
            && error.raw_os_error() != Some(libc::ESRCH)
        {
            warn!("Could not kill yt-dlp process group {}: {error}", self.id);
        }
    }

    /// True while any member exists, unreaped ones included.
    pub fn is_alive(self) -> bool {
        match self.signal(0) {
            Ok(()) => true,
            Err(error) => error.raw_os_error() != Some(libc::ESRCH),
        }
    }

    fn signal(self, signal: libc::c_int) -> std::io::Result<()> {
        // SAFETY: killpg takes plain integers and touches no memory of ours.
        if unsafe { libc::killpg(self.id as libc::pid_t, signal) } == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }
}

#[cfg(not(unix))]
impl ProcessGroup {
    fn kill(self) {}

    pub fn is_alive(self) -> bool {
        false
    }
}

/// A spawned extractor. Dropping it before `wait` returns kills the whole
/// process group; the direct child is then reaped by the runtime.
#[derive(Debug)]
struct GroupedChild {
    child: Child,
    group: Option<ProcessGroup>,
}

impl GroupedChild {
    fn new(child: Child) -> Self {
        let group = child.id().map(|id| ProcessGroup { id });
        Self { child, group }
    }

    async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        let status = self.child.wait().await?;
        self.group = None;
        Ok(status)
    }

    async fn terminate(&mut self) -> std::io::Result<()> {
        if let Some(group) = self.group.take() {
            group.kill();
        }
        self.child.kill().await
    }
}

impl Drop for GroupedChild {
    fn drop(&mut self) {
        if let Some(group) = self.group.take() {
            debug!("Abandoned yt-dlp, killing process group {}", group.id);
            group.kill();
        }
    }
}

/// A running extractor whose stdout has been handed to the caller.
#[derive(Debug)]
pub struct StreamingProcess {
    child: GroupedChild,
    stderr: JoinHandle<String>,
}

impl StreamingProcess {
    /// Waits for exit and turns a nonzero status into [`ExtractorError::Exit`].
    pub async fn finish(mut self) -> Result<(), ExtractorError> {
        let status = self.child.wait().await.map_err(ExtractorError::Wait)?;
        let stderr = collect(self.stderr, None).await;

        if status.success() {
            Ok(())
        } else {
            Err(ExtractorError::Exit {
                code: status.code(),
                stderr,
            })
        }
    }
}

#[derive(Debug, Clone)]
pub struct Extractor {
    settings: ExtractorSettings,
}

impl Extractor {
    pub fn new(settings: ExtractorSettings) -> Self {
        Self { settings }
    }

    /// Runs the extractor to completion. With a `limit`, the process is killed
    /// when it fires and whatever stderr was captured is kept on the error.
    pub async fn run(
        &self,
        args: &[String],
        limit: Option<Duration>,
    ) -> Result<ExtractorOutput, ExtractorError> {
        self.execute(args, limit, None).await
    }

    /// [`run`](Self::run) for an extractor writing into `job`'s files. The
    /// job's cleanup waits for the extractor's process group to disappear.
    pub async fn run_for_job(
        &self,
        job: &JobArtifacts,
        args: &[String],
        limit: Option<Duration>,
    ) -> Result<ExtractorOutput, ExtractorError> {
        self.execute(args, limit, Some(job)).await
    }

    async fn execute(
        &self,
        args: &[String],
        limit: Option<Duration>,
        job: Option<&JobArtifacts>,
    ) -> Result<ExtractorOutput, ExtractorError> {
        let mut child = self.spawn(args)?;
        if let (Some(job), Some(group)) = (job, child.group) {
            job.track_writer(group);
        }

        let stdout = drain(child.child.stdout.take(), None);
        let stderr = drain(child.child.stderr.take(), Some(MAX_CAPTURED_STDERR_BYTES));

        let status = match limit {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => Some(status.map_err(ExtractorError::Wait)?),
                Err(_) => {
                    warn!(
                        "yt-dlp exceeded {}ms, terminating it",
                        limit.as_millis()
                    );
                    if let Err(error) = child.terminate().await {
                        warn!("Could not terminate yt-dlp: {error}");
                    }
                    None
                }
            },
            None => Some(child.wait().await.map_err(ExtractorError::Wait)?),
        };

        let grace = status.is_none().then_some(OUTPUT_DRAIN_GRACE);
        let stdout = collect(stdout, grace).await;
        let stderr = collect(stderr, grace).await;

        match status {
            Some(status) if status.success() => Ok(ExtractorOutput { stdout, stderr }),
            Some(status) => Err(ExtractorError::Exit {
                code: status.code(),
                stderr,
            }),
            None => Err(ExtractorError::TimedOut {
                after: limit.unwrap_or_default(),
                stderr,
            }),
        }
    }

    /// Spawns the extractor with stdout handed back for live forwarding.
    /// Stderr is accumulated in the background for error reporting.
    pub fn spawn_streaming(
        &self,
        args: &[String],
    ) -> Result<(StreamingProcess, ChildStdout), ExtractorError> {
        let mut child = self.spawn(args)?;

        let stdout = child.child.stdout.take().ok_or_else(|| {
            ExtractorError::Spawn(std::io::Error::other("yt-dlp stdout was not captured"))
        })?;
        let stderr = drain(child.child.stderr.take(), Some(MAX_CAPTURED_STDERR_BYTES));

        Ok((StreamingProcess { child, stderr }, stdout))
    }

    fn spawn(&self, args: &[String]) -> Result<GroupedChild, ExtractorError> {
        self.command(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map(GroupedChild::new)
            .map_err(|error| self.spawn_error(error))
    }

    fn command(&self, args: &[String]) -> Command {
        debug!("Spawning {:?} with {:?}", self.settings.binary, args);

        let mut command = Command::new(&self.settings.binary);
        if let Some(cookies) = &self.settings.cookies_file {
            command.arg("--cookies").arg(cookies);
        }
        command.args(args).stdin(Stdio::null()).kill_on_drop(true);

        #[cfg(unix)]
        command.process_group(0);
        #[cfg(windows)]
        command.creation_flags(0x08000000); // CREATE_NO_WINDOW

        command
    }

    fn spawn_error(&self, error: std::io::Error) -> ExtractorError {
        if error.kind() == ErrorKind::NotFound {
            ExtractorError::NotFound {
                binary: self.settings.binary.clone(),
                source: error,
            }
        } else {
            ExtractorError::Spawn(error)
        }
    }
}

/// Reads a child pipe to the end on a background task. With `keep_tail`, only
/// the last `keep_tail` bytes are retained.
fn drain<R>(reader: Option<R>, keep_tail: Option<usize>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut reader) = reader else {
            return String::new();
        };

        let mut captured = Vec::new();
        let mut chunk = [0_u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(read) => {
                    captured.extend_from_slice(&chunk[..read]);
                    if let Some(limit) = keep_tail
                        && captured.len() > limit
                    {
                        let excess = captured.len() - limit;
                        captured.drain(..excess);
                    }
                }
                Err(error) => {
                    debug!("Stopped reading yt-dlp output: {error}");
                    break;
                }
            }
        }

        String::from_utf8_lossy(&captured).into_owned()
    })
}

async fn collect(mut handle: JoinHandle<String>, grace: Option<Duration>) -> String {
    let Some(grace) = grace else {
        return handle.await.unwrap_or_default();
    };

    match tokio::time::timeout(grace, &mut handle).await {
        Ok(joined) => joined.unwrap_or_default(),
        Err(_) => {
            handle.abort();
            String::new()
        }
    }
}
