use std::path::PathBuf;

use url::Url;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 5173;
const DEFAULT_PORT_FALLBACK_ATTEMPTS: u16 = 10;
const DEFAULT_WORK_DIR_NAME: &str = "video-downloader";
const DEFAULT_PUBLIC_DIR: &str = "public";
const DEFAULT_INSTALLER_DIR: &str = "installer/Output";

/// Process configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Extra ports tried, one after another, when the configured one is taken.
    pub port_fallback_attempts: u16,
    pub yt_dlp_path: Option<PathBuf>,
    pub cookies_file: Option<PathBuf>,
    pub cookies_b64: Option<String>,
    pub work_dir: PathBuf,
    pub public_dir: PathBuf,
    pub installer_url: Option<String>,
    pub installer_dir: PathBuf,
    /// Empty means any origin is allowed.
    pub allowed_origins: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            port_fallback_attempts: DEFAULT_PORT_FALLBACK_ATTEMPTS,
            yt_dlp_path: None,
            cookies_file: None,
            cookies_b64: None,
            work_dir: std::env::temp_dir().join(DEFAULT_WORK_DIR_NAME),
            public_dir: PathBuf::from(DEFAULT_PUBLIC_DIR),
            installer_url: None,
            installer_dir: PathBuf::from(DEFAULT_INSTALLER_DIR),
            allowed_origins: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            host: read_string_env("HOST").unwrap_or(defaults.host),
            port: read_u16_env("PORT").unwrap_or(defaults.port),
            port_fallback_attempts: read_u16_env("PORT_FALLBACK_ATTEMPTS")
                .unwrap_or(defaults.port_fallback_attempts),
            yt_dlp_path: read_string_env("YT_DLP_PATH").map(PathBuf::from),
            cookies_file: read_string_env("YT_DLP_COOKIES_FILE").map(PathBuf::from),
            cookies_b64: read_string_env("YT_DLP_COOKIES_B64"),
            work_dir: read_string_env("WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            public_dir: read_string_env("PUBLIC_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.public_dir),
            installer_url: read_string_env("INSTALLER_URL"),
            installer_dir: read_string_env("INSTALLER_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.installer_dir),
            allowed_origins: read_string_env("ALLOWED_ORIGINS")
                .map(|value| parse_origin_list(&value))
                .unwrap_or_default(),
        }
    }
}

fn read_string_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
}

fn read_u16_env(name: &str) -> Option<u16> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
}

pub fn parse_origin_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Reduces an origin to `scheme://host[:port]`, dropping default ports.
/// Returns `None` for anything that is not a bare http(s) origin.
pub fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    match parsed.port() {
        Some(port) if port != default_port => Some(format!("{scheme}://{host}:{port}")),
        _ => Some(format!("{scheme}://{host}")),
    }
}

pub fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
