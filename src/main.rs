use std::{sync::Arc, time::Duration};

use media_gateway::{
    cache::SystemClock,
    config::Config,
    error::StartupError,
    extractor::{Extractor, ExtractorSettings},
    installer::InstallerSettings,
    routes::{AppState, build_router},
    scratch::WorkDir,
    server::{bind_with_fallback, build_cors_layer},
};
use tracing::{info, warn};

const STALE_JOB_AGE: Duration = Duration::from_secs(2 * 60 * 60);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "media_gateway=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), StartupError> {
    let config = Config::from_env();

    let work_dir = WorkDir::new(&config.work_dir);
    if let Err(error) = work_dir.ensure().await {
        warn!("Temporary directory is not usable yet: {error}");
    }
    work_dir.sweep_stale(STALE_JOB_AGE).await;

    let settings = ExtractorSettings::resolve(&config).await;
    let state = AppState::new(
        Extractor::new(settings),
        work_dir,
        Arc::new(SystemClock),
        InstallerSettings::from_config(&config),
    )?;
    let cors = build_cors_layer(&config.allowed_origins)?;
    let app = build_router(state, Some(&config.public_dir)).layer(cors);

    let (listener, addr) =
        bind_with_fallback(&config.host, config.port, config.port_fallback_attempts).await?;
    info!("Server running on http://{addr}");

    axum::serve(listener, app)
        .await
        .map_err(StartupError::Serve)
}
