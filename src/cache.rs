//! Time-bounded memoization of analysis results.
//!
//! Entries live for [`ANALYZE_CACHE_TTL_MS`] from insertion and are evicted
//! lazily when a read finds them expired. There is no capacity bound: entries
//! are small and the TTL caps growth for any realistic request rate.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, PoisonError},
};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::analyze::AnalysisResult;

pub const ANALYZE_CACHE_TTL_MS: i64 = 5 * 60 * 1000;

/// Source of "now" for TTL checks.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct CacheEntry {
    result: AnalysisResult,
    inserted_at: DateTime<Utc>,
}

pub struct AnalyzeCache {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl fmt::Debug for AnalyzeCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalyzeCache")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl AnalyzeCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_ttl(clock, Duration::milliseconds(ANALYZE_CACHE_TTL_MS))
    }

    pub fn with_ttl(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            ttl,
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached result while it is younger than the TTL. An expired
    /// entry is removed and reported as a miss.
    pub async fn get(&self, url: &str) -> Option<AnalysisResult> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;

        let fresh = entries
            .get(url)
            .map(|entry| now - entry.inserted_at < self.ttl)?;

        if fresh {
            entries.get(url).map(|entry| entry.result.clone())
        } else {
            entries.remove(url);
            debug!("Analyze cache entry expired for {url}");
            None
        }
    }

    pub async fn put(&self, url: impl Into<String>, result: AnalysisResult) {
        let entry = CacheEntry {
            result,
            inserted_at: self.clock.now(),
        };
        self.entries.lock().await.insert(url.into(), entry);
    }
}
