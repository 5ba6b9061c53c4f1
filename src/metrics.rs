//! Observation points for DNS and connection events.

use std::{
    fmt::Write as _,
    net::IpAddr,
    sync::{Arc, PoisonError, RwLock},
    time::{Duration, Instant},
};

use async_trait::async_trait;

use crate::address::Family;

/// How long a detached persistence write may take before it is abandoned.
const PERSIST_TIMEOUT: Duration = Duration::from_secs(5);

/// Error type produced by a [`MetricsStore`].
pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// One DNS lookup observed by the resolver. Immutable once recorded.
#[derive(Debug, Clone)]
pub struct DnsResolution {
    /// Host name that was queried.
    pub host: String,
    /// Family the query asked for.
    pub family: Family,
    /// When the lookup started.
    pub started_at: Instant,
    /// When the lookup completed.
    pub finished_at: Instant,
    /// Number of addresses the lookup returned.
    pub address_count: usize,
    /// Whether the lookup succeeded.
    pub success: bool,
    /// Failure description, present only when the lookup failed.
    pub error: Option<String>,
}

/// One connection attempt observed by a race. Immutable once recorded.
#[derive(Debug, Clone)]
pub struct ConnectionAttempt {
    /// Host name the race was dialing.
    pub host: String,
    /// Target address of this attempt.
    pub ip: IpAddr,
    /// Family of the target address.
    pub family: Family,
    /// When the attempt started.
    pub started_at: Instant,
    /// When the attempt completed.
    pub finished_at: Instant,
    /// Whether the attempt produced a connection.
    pub success: bool,
    /// Failure description, present only when the attempt failed.
    pub error: Option<String>,
    /// True for at most one attempt per race: the one whose success ended it.
    pub winner: bool,
}

/// Persistent sink for metrics records.
///
/// Implementations are invoked from a detached task with a bounded timeout;
/// their errors are logged and never surfaced to the dial path.
#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// Persists one connection attempt.
    async fn save_connection_attempt(&self, attempt: &ConnectionAttempt) -> Result<(), StoreError>;

    /// Persists one DNS resolution.
    async fn save_dns_resolution(&self, resolution: &DnsResolution) -> Result<(), StoreError>;
}

#[derive(Default)]
struct Buffers {
    dns_resolutions: Vec<DnsResolution>,
    connection_attempts: Vec<ConnectionAttempt>,
}

/// Thread-safe recorder shared by every dial that wants observability.
///
/// Records append to in-memory buffers under a readers-writer lock. When a
/// [`MetricsStore`] is attached and persistence is enabled, each record is
/// additionally handed to the store from a detached task, so recording on
/// the dial path never waits for I/O. When the recorder is disabled every
/// operation is a no-op.
pub struct Metrics {
    enabled: bool,
    persist_enabled: bool,
    store: Option<Arc<dyn MetricsStore>>,
    buffers: RwLock<Buffers>,
}

impl Metrics {
    /// Creates a recorder.
    ///
    /// `persist_enabled` only matters when a `store` is attached.
    pub fn new(enabled: bool, persist_enabled: bool, store: Option<Arc<dyn MetricsStore>>) -> Self {
        Metrics {
            enabled,
            persist_enabled,
            store,
            buffers: RwLock::new(Buffers::default()),
        }
    }

    /// Whether the recorder is collecting at all.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Records a DNS resolution.
    ///
    /// When persistence is on, the record is copied out and written from a
    /// spawned task, so this must run inside a tokio runtime in that case.
    pub fn record_dns_resolution(&self, resolution: DnsResolution) {
        if !self.enabled {
            return;
        }

        let copy = resolution.clone();
        self.buffers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .dns_resolutions
            .push(resolution);

        #[cfg(feature = "log")]
        {
            let elapsed = copy.finished_at.duration_since(copy.started_at);
            if copy.success {
                tracing::info!(
                    host = %copy.host,
                    family = %copy.family,
                    addresses = copy.address_count,
                    ?elapsed,
                    "dns lookup completed",
                );
            } else {
                tracing::warn!(
                    host = %copy.host,
                    family = %copy.family,
                    ?elapsed,
                    error = copy.error.as_deref().unwrap_or("unknown"),
                    "dns lookup failed",
                );
            }
        }

        if self.persist_enabled {
            if let Some(store) = &self.store {
                let store = Arc::clone(store);
                tokio::spawn(async move {
                    let save = store.save_dns_resolution(&copy);
                    match tokio::time::timeout(PERSIST_TIMEOUT, save).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_e)) => {
                            #[cfg(feature = "log")]
                            tracing::warn!(error = %_e, "failed to save dns resolution");
                        }
                        Err(_) => {
                            #[cfg(feature = "log")]
                            tracing::warn!("timed out saving dns resolution");
                        }
                    }
                });
            }
        }
    }

    /// Records a connection attempt.
    ///
    /// Same persistence caveat as [`Metrics::record_dns_resolution`].
    pub fn record_connection_attempt(&self, attempt: ConnectionAttempt) {
        if !self.enabled {
            return;
        }

        let copy = attempt.clone();
        self.buffers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .connection_attempts
            .push(attempt);

        #[cfg(feature = "log")]
        {
            let elapsed = copy.finished_at.duration_since(copy.started_at);
            if copy.success {
                tracing::info!(
                    host = %copy.host,
                    ip = %copy.ip,
                    family = %copy.family,
                    ?elapsed,
                    winner = copy.winner,
                    "connection attempt succeeded",
                );
            } else {
                tracing::warn!(
                    host = %copy.host,
                    ip = %copy.ip,
                    family = %copy.family,
                    ?elapsed,
                    error = copy.error.as_deref().unwrap_or("unknown"),
                    "connection attempt failed",
                );
            }
        }

        if self.persist_enabled {
            if let Some(store) = &self.store {
                let store = Arc::clone(store);
                tokio::spawn(async move {
                    let save = store.save_connection_attempt(&copy);
                    match tokio::time::timeout(PERSIST_TIMEOUT, save).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_e)) => {
                            #[cfg(feature = "log")]
                            tracing::warn!(error = %_e, "failed to save connection attempt");
                        }
                        Err(_) => {
                            #[cfg(feature = "log")]
                            tracing::warn!("timed out saving connection attempt");
                        }
                    }
                });
            }
        }
    }

    /// Number of connection attempts recorded so far.
    pub fn connection_attempt_count(&self) -> usize {
        self.buffers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .connection_attempts
            .len()
    }

    /// Runs `f` over the connection attempts recorded so far.
    pub fn with_connection_attempts<R>(&self, f: impl FnOnce(&[ConnectionAttempt]) -> R) -> R {
        f(&self
            .buffers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .connection_attempts)
    }

    /// Renders a per-family summary of everything recorded.
    pub fn summary(&self) -> String {
        if !self.enabled {
            return String::from("metrics disabled");
        }

        let buffers = self.buffers.read().unwrap_or_else(PoisonError::into_inner);

        let mut v6 = (0usize, 0usize, 0usize);
        let mut v4 = (0usize, 0usize, 0usize);
        for attempt in &buffers.connection_attempts {
            let counts = match attempt.family {
                Family::V6 => &mut v6,
                Family::V4 => &mut v4,
            };
            counts.0 += 1;
            if attempt.success {
                counts.1 += 1;
                if attempt.winner {
                    counts.2 += 1;
                }
            }
        }

        let mut out = String::from("Happy Eyeballs metrics summary:\n");
        let _ = writeln!(
            out,
            "  IPv6: {} attempts, {} successful, {} winning connections",
            v6.0, v6.1, v6.2,
        );
        let _ = writeln!(
            out,
            "  IPv4: {} attempts, {} successful, {} winning connections",
            v4.0, v4.1, v4.2,
        );
        let _ = write!(
            out,
            "  DNS resolutions: {} total",
            buffers.dns_resolutions.len(),
        );
        out
    }
}

/// In-memory [`MetricsStore`], mainly useful in tests and as a reference
/// implementation for real sinks.
#[derive(Default)]
pub struct MemoryStore {
    saved: RwLock<(Vec<DnsResolution>, Vec<ConnectionAttempt>)>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of DNS resolutions saved.
    pub fn dns_resolution_count(&self) -> usize {
        self.saved.read().unwrap_or_else(PoisonError::into_inner).0.len()
    }

    /// Number of connection attempts saved.
    pub fn connection_attempt_count(&self) -> usize {
        self.saved.read().unwrap_or_else(PoisonError::into_inner).1.len()
    }
}

#[async_trait]
impl MetricsStore for MemoryStore {
    async fn save_connection_attempt(&self, attempt: &ConnectionAttempt) -> Result<(), StoreError> {
        self.saved
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .1
            .push(attempt.clone());
        Ok(())
    }

    async fn save_dns_resolution(&self, resolution: &DnsResolution) -> Result<(), StoreError> {
        self.saved
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .0
            .push(resolution.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(family: Family, success: bool, winner: bool) -> ConnectionAttempt {
        let now = Instant::now();
        ConnectionAttempt {
            host: String::from("example.com"),
            ip: match family {
                Family::V4 => "192.0.2.1".parse().unwrap(),
                Family::V6 => "2001:db8::1".parse().unwrap(),
            },
            family,
            started_at: now,
            finished_at: now,
            success,
            error: (!success).then(|| String::from("connection refused")),
            winner,
        }
    }

    fn resolution(family: Family) -> DnsResolution {
        let now = Instant::now();
        DnsResolution {
            host: String::from("example.com"),
            family,
            started_at: now,
            finished_at: now,
            address_count: 1,
            success: true,
            error: None,
        }
    }

    #[test]
    fn disabled_recorder_is_a_noop() {
        let metrics = Metrics::new(false, false, None);
        metrics.record_connection_attempt(attempt(Family::V4, true, true));
        metrics.record_dns_resolution(resolution(Family::V6));
        assert_eq!(metrics.connection_attempt_count(), 0);
        assert_eq!(metrics.summary(), "metrics disabled");
    }

    #[test]
    fn summary_counts_per_family() {
        let metrics = Metrics::new(true, false, None);
        metrics.record_connection_attempt(attempt(Family::V6, false, false));
        metrics.record_connection_attempt(attempt(Family::V6, true, true));
        metrics.record_connection_attempt(attempt(Family::V4, true, false));
        metrics.record_dns_resolution(resolution(Family::V6));
        metrics.record_dns_resolution(resolution(Family::V4));

        let summary = metrics.summary();
        assert!(summary.contains("IPv6: 2 attempts, 1 successful, 1 winning connections"));
        assert!(summary.contains("IPv4: 1 attempts, 1 successful, 0 winning connections"));
        assert!(summary.contains("DNS resolutions: 2 total"));
    }

    #[test]
    fn winner_counted_only_for_successful_attempts() {
        let metrics = Metrics::new(true, false, None);
        // A record can carry winner=true only alongside success, but the
        // summary must not trust that.
        metrics.record_connection_attempt(attempt(Family::V4, false, true));
        assert!(metrics
            .summary()
            .contains("IPv4: 1 attempts, 0 successful, 0 winning connections"));
    }

    #[test]
    fn concurrent_recording() {
        let metrics = Arc::new(Metrics::new(true, false, None));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let metrics = Arc::clone(&metrics);
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    metrics.record_connection_attempt(attempt(Family::V6, true, false));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(metrics.connection_attempt_count(), 400);
    }

    #[tokio::test]
    async fn records_reach_the_store() {
        let store = Arc::new(MemoryStore::new());
        let metrics = Metrics::new(true, true, Some(Arc::clone(&store) as Arc<dyn MetricsStore>));

        metrics.record_dns_resolution(resolution(Family::V6));
        metrics.record_connection_attempt(attempt(Family::V4, true, true));

        // Persistence runs on detached tasks; give them a moment.
        for _ in 0..50 {
            if store.dns_resolution_count() == 1 && store.connection_attempt_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.dns_resolution_count(), 1);
        assert_eq!(store.connection_attempt_count(), 1);
    }

    #[tokio::test]
    async fn store_ignored_when_persistence_disabled() {
        let store = Arc::new(MemoryStore::new());
        let metrics = Metrics::new(true, false, Some(Arc::clone(&store) as Arc<dyn MetricsStore>));
        metrics.record_connection_attempt(attempt(Family::V4, true, true));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.connection_attempt_count(), 0);
        assert_eq!(metrics.connection_attempt_count(), 1);
    }
}
