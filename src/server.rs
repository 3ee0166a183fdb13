use std::{
    collections::HashSet,
    io::ErrorKind,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use axum::http::{
    HeaderName, HeaderValue, Method,
    header::{CONTENT_DISPOSITION, CONTENT_LENGTH},
};
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::{config::normalize_origin, error::StartupError};

/// Builds the CORS layer. An empty allow-list accepts any origin, matching a
/// front-end that is usually served by this same process.
pub fn build_cors_layer(allowed_origins: &[String]) -> Result<CorsLayer, StartupError> {
    let exposed = [
        CONTENT_DISPOSITION,
        CONTENT_LENGTH,
        HeaderName::from_static("x-download-filename"),
    ];

    if allowed_origins.is_empty() {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(Any)
            .expose_headers(exposed));
    }

    let normalized_origins = allowed_origins
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| StartupError::InvalidOrigin(origin.clone()))
        })
        .collect::<Result<HashSet<_>, _>>()?;
    info!(
        "CORS allow-list loaded with {} origin(s): {:?}",
        normalized_origins.len(),
        normalized_origins
    );

    let normalized_origins = Arc::new(normalized_origins);
    let allow_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        let normalized = origin.to_str().ok().and_then(normalize_origin);
        let allowed = normalized
            .as_ref()
            .is_some_and(|value| normalized_origins.contains(value));
        debug!(
            "CORS origin check raw={:?} normalized={:?} allowed={}",
            origin, normalized, allowed
        );
        allowed
    });

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .expose_headers(exposed))
}

/// Binds `host:port`, moving to the next port while the current one is taken,
/// at most `fallback_attempts` times. Any other bind error is fatal.
pub async fn bind_with_fallback(
    host: &str,
    port: u16,
    fallback_attempts: u16,
) -> Result<(TcpListener, SocketAddr), StartupError> {
    let ip = host
        .parse::<IpAddr>()
        .map_err(|_| StartupError::Address(host.to_string()))?;

    let mut candidate = port;
    let mut attempts_left = fallback_attempts;
    loop {
        let addr = SocketAddr::new(ip, candidate);
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                let bound = listener
                    .local_addr()
                    .map_err(|source| StartupError::Bind { addr, source })?;
                return Ok((listener, bound));
            }
            Err(source) if source.kind() == ErrorKind::AddrInUse && attempts_left > 0 => {
                let Some(next) = candidate.checked_add(1) else {
                    return Err(StartupError::Bind { addr, source });
                };
                warn!("Port {candidate} is in use, trying {next}");
                candidate = next;
                attempts_left -= 1;
            }
            Err(source) => return Err(StartupError::Bind { addr, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_origins() {
        let error = build_cors_layer(&["ftp://example.com".to_string()]).unwrap_err();
        assert!(matches!(error, StartupError::InvalidOrigin(origin) if origin == "ftp://example.com"));
    }

    #[test]
    fn accepts_allow_list_and_empty_list() {
        assert!(build_cors_layer(&[]).is_ok());
        assert!(
            build_cors_layer(&[
                "https://example.com".to_string(),
                "http://localhost:5173".to_string()
            ])
            .is_ok()
        );
    }

    #[tokio::test]
    async fn falls_back_to_next_free_port() {
        let (taken, taken_addr) = bind_with_fallback("127.0.0.1", 0, 0).await.unwrap();
        let port = taken_addr.port();

        match bind_with_fallback("127.0.0.1", port, 10).await {
            Ok((_listener, addr)) => {
                assert!(addr.port() > port && addr.port() <= port.saturating_add(10));
            }
            // Every port after the taken one may be busy on a crowded host.
            Err(StartupError::Bind { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
        drop(taken);
    }

    #[tokio::test]
    async fn no_attempts_left_is_a_bind_error() {
        let (_taken, taken_addr) = bind_with_fallback("127.0.0.1", 0, 0).await.unwrap();

        let error = bind_with_fallback("127.0.0.1", taken_addr.port(), 0)
            .await
            .unwrap_err();

        assert!(matches!(error, StartupError::Bind { addr, .. } if addr == taken_addr));
    }

    #[tokio::test]
    async fn invalid_host_is_rejected() {
        let error = bind_with_fallback("not-an-ip", 0, 0).await.unwrap_err();
        assert!(matches!(error, StartupError::Address(_)));
    }
}
