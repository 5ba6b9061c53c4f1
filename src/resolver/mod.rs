//! Concurrent dual-family DNS resolution.
//!
//! [`concurrent_dns_lookup`] races an IPv6 and an IPv4 query against the
//! supplied [`FamilyLookup`], granting IPv6 a head start of
//! `resolution_delay` per RFC 8305 §3, and merges whatever both return.

use std::{fmt::Debug, net::IpAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    address::Family,
    metrics::{DnsResolution, Metrics},
};

#[cfg(feature = "hickory")]
mod hickory;
#[cfg(feature = "hickory")]
pub use hickory::HickoryLookup;

/// A family-specific DNS lookup supplied by the caller.
///
/// The engine queries one family at a time and expects the addresses for
/// that family along with a flag reporting whether the answer was validated
/// (DNSSEC or equivalent). Implementations should honor the cancellation
/// token; after it fires their result is discarded on arrival.
#[async_trait]
pub trait FamilyLookup: Send + Sync {
    /// Error produced by a failed lookup.
    type Error: Debug + Send;

    /// Resolves `host` within `family`.
    async fn lookup(
        &self,
        cancel: CancellationToken,
        family: Family,
        host: &str,
    ) -> Result<(Vec<IpAddr>, bool), Self::Error>;
}

/// Errors encountered while resolving a host.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError<Lookup: Debug> {
    /// The caller's cancellation token fired before resolution finished.
    #[error("dns resolution cancelled")]
    Cancelled,
    /// Every family lookup failed; carries the last error observed.
    #[error("dns lookup failed: {0:?}")]
    Lookup(Lookup),
}

/// Resolves `host` in both families, IPv6 first.
///
/// The IPv6 query is issued immediately; the IPv4 query only after
/// `resolution_delay` has elapsed. Both results are awaited and merged in
/// arrival order, so the relative order of the two families in the returned
/// list is not guaranteed; callers are expected to re-order with
/// [`sort_and_interleave`](crate::sort_and_interleave). Within a family the
/// lookup's order is preserved.
///
/// The returned flag is true only when *both* lookups reported a validated
/// answer; a family that failed counts as unvalidated. A per-family failure
/// is not fatal while the other family produces addresses; only when the
/// merged list ends up empty is the last observed error returned. An empty
/// merged list with no error is returned as an empty, unvalidated result.
///
/// Cancellation during any wait returns [`ResolveError::Cancelled`] without
/// waiting for in-flight lookups.
pub async fn concurrent_dns_lookup<L>(
    cancel: CancellationToken,
    host: &str,
    lookup: L,
    resolution_delay: Duration,
    metrics: Option<Arc<Metrics>>,
) -> Result<(Vec<IpAddr>, bool), ResolveError<L::Error>>
where
    L: FamilyLookup + Clone + 'static,
    L::Error: 'static,
{
    let (tx, mut rx) = mpsc::channel(2);

    spawn_query(
        lookup.clone(),
        cancel.clone(),
        Family::V6,
        host.to_string(),
        metrics.clone(),
        tx.clone(),
    );

    tokio::select! {
        _ = cancel.cancelled() => return Err(ResolveError::Cancelled),
        _ = tokio::time::sleep(resolution_delay) => {}
    }

    spawn_query(
        lookup,
        cancel.clone(),
        Family::V4,
        host.to_string(),
        metrics,
        tx,
    );

    let mut merged = Vec::new();
    let mut secure = true;
    let mut last_err = None;

    for _ in 0..2 {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(ResolveError::Cancelled),
            outcome = rx.recv() => outcome,
        };
        match outcome {
            Some(Ok((ips, validated))) => {
                merged.extend(ips);
                secure = secure && validated;
            }
            Some(Err(err)) => {
                last_err = Some(err);
                secure = false;
            }
            // A query task can only vanish without sending if it panicked.
            None => break,
        }
    }

    if merged.is_empty() {
        return match last_err {
            Some(err) => Err(ResolveError::Lookup(err)),
            None => Ok((merged, false)),
        };
    }
    Ok((merged, secure))
}

type QueryResult<E> = Result<(Vec<IpAddr>, bool), E>;

fn spawn_query<L>(
    lookup: L,
    cancel: CancellationToken,
    family: Family,
    host: String,
    metrics: Option<Arc<Metrics>>,
    tx: mpsc::Sender<QueryResult<L::Error>>,
) where
    L: FamilyLookup + 'static,
    L::Error: 'static,
{
    tokio::spawn(async move {
        let started_at = std::time::Instant::now();
        let result = lookup.lookup(cancel, family, &host).await;
        let finished_at = std::time::Instant::now();

        if let Some(metrics) = &metrics {
            metrics.record_dns_resolution(DnsResolution {
                host,
                family,
                started_at,
                finished_at,
                address_count: result.as_ref().map_or(0, |(ips, _)| ips.len()),
                success: result.is_ok(),
                error: result.as_ref().err().map(|e| format!("{e:?}")),
            });
        }

        // The receiver may be gone if the resolution was cancelled.
        let _ = tx.send(result).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Canned per-family answers, recording when each family was queried.
    #[derive(Clone)]
    struct FakeLookup {
        v6: Result<(Vec<IpAddr>, bool), String>,
        v4: Result<(Vec<IpAddr>, bool), String>,
        calls: Arc<Mutex<Vec<(Family, std::time::Instant)>>>,
    }

    impl FakeLookup {
        fn new(
            v6: Result<(Vec<IpAddr>, bool), String>,
            v4: Result<(Vec<IpAddr>, bool), String>,
        ) -> Self {
            FakeLookup {
                v6,
                v4,
                calls: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl FamilyLookup for FakeLookup {
        type Error = String;

        async fn lookup(
            &self,
            _cancel: CancellationToken,
            family: Family,
            _host: &str,
        ) -> Result<(Vec<IpAddr>, bool), String> {
            self.calls
                .lock()
                .unwrap()
                .push((family, std::time::Instant::now()));
            match family {
                Family::V6 => self.v6.clone(),
                Family::V4 => self.v4.clone(),
            }
        }
    }

    fn ips(addrs: &[&str]) -> Vec<IpAddr> {
        addrs.iter().map(|a| a.parse().unwrap()).collect()
    }

    #[tokio::test]
    async fn merges_both_families() {
        let lookup = FakeLookup::new(
            Ok((ips(&["2001:db8::1", "2001:db8::2"]), true)),
            Ok((ips(&["192.0.2.1", "192.0.2.2"]), true)),
        );
        let cancel = CancellationToken::new();
        let (merged, secure) = concurrent_dns_lookup(
            cancel,
            "example.com",
            lookup,
            Duration::from_millis(10),
            None,
        )
        .await
        .unwrap();

        assert_eq!(merged.len(), 4);
        assert!(secure);
    }

    #[tokio::test]
    async fn one_failed_family_is_not_fatal() {
        let lookup = FakeLookup::new(
            Ok((ips(&["2001:db8::1"]), true)),
            Err(String::from("no ipv4 addresses")),
        );
        let cancel = CancellationToken::new();
        let (merged, secure) = concurrent_dns_lookup(
            cancel,
            "example.com",
            lookup,
            Duration::from_millis(10),
            None,
        )
        .await
        .unwrap();

        assert_eq!(merged, ips(&["2001:db8::1"]));
        // A failed family counts as unvalidated.
        assert!(!secure);
    }

    #[tokio::test]
    async fn both_failed_returns_an_error() {
        let lookup = FakeLookup::new(
            Err(String::from("lookup failed")),
            Err(String::from("lookup failed")),
        );
        let cancel = CancellationToken::new();
        let err = concurrent_dns_lookup(
            cancel,
            "example.com",
            lookup,
            Duration::from_millis(10),
            None,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ResolveError::Lookup(_)));
    }

    #[tokio::test]
    async fn secure_is_the_conjunction_of_both_flags() {
        let lookup = FakeLookup::new(
            Ok((ips(&["2001:db8::1"]), true)),
            Ok((ips(&["192.0.2.1"]), false)),
        );
        let cancel = CancellationToken::new();
        let (_, secure) = concurrent_dns_lookup(
            cancel,
            "example.com",
            lookup,
            Duration::from_millis(10),
            None,
        )
        .await
        .unwrap();

        assert!(!secure);
    }

    #[tokio::test]
    async fn ipv4_waits_for_the_resolution_delay() {
        let delay = Duration::from_millis(50);
        let lookup = FakeLookup::new(
            Ok((ips(&["2001:db8::1"]), true)),
            Ok((ips(&["192.0.2.1"]), true)),
        );
        let calls = Arc::clone(&lookup.calls);
        let cancel = CancellationToken::new();
        let start = std::time::Instant::now();

        concurrent_dns_lookup(cancel, "example.com", lookup, delay, None)
            .await
            .unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(calls[0].0, Family::V6);
        let (_, v4_at) = calls
            .iter()
            .find(|(family, _)| *family == Family::V4)
            .copied()
            .expect("ipv4 never queried");
        assert!(v4_at.duration_since(start) >= delay);
    }

    #[tokio::test]
    async fn cancelled_before_the_head_start_elapses() {
        let lookup = FakeLookup::new(
            Ok((ips(&["2001:db8::1"]), true)),
            Ok((ips(&["192.0.2.1"]), true)),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = concurrent_dns_lookup(
            cancel,
            "example.com",
            lookup,
            Duration::from_secs(5),
            None,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ResolveError::Cancelled));
    }

    #[tokio::test]
    async fn records_one_resolution_per_family() {
        let metrics = Arc::new(Metrics::new(true, false, None));
        let lookup = FakeLookup::new(
            Ok((ips(&["2001:db8::1"]), true)),
            Err(String::from("no ipv4 addresses")),
        );
        let cancel = CancellationToken::new();

        concurrent_dns_lookup(
            cancel,
            "example.com",
            lookup,
            Duration::from_millis(10),
            Some(Arc::clone(&metrics)),
        )
        .await
        .unwrap();

        assert!(metrics.summary().contains("DNS resolutions: 2 total"));
    }
}
