//! Staggered racing dialers.

use std::{
    fmt,
    future::Future,
    io,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::{net::TcpStream, sync::mpsc, time::sleep};
use tokio_util::sync::CancellationToken;

use crate::{
    address::{sort_and_interleave, Family},
    config::Config,
    metrics::{ConnectionAttempt, Metrics},
};

mod tls;

/// Errors encountered by a [`Dialer`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The candidate list was empty.
    #[error("no addresses to dial")]
    NoAddresses,
    /// The caller's cancellation token fired before a connection was made.
    #[error("dial cancelled")]
    Cancelled,
    /// Every attempt was cancelled before reporting an error of its own.
    #[error("all connection attempts failed")]
    AllAttemptsFailed,
    /// A transport connection to one candidate failed.
    #[error("connect to {addr} failed: {source}")]
    Connect {
        /// The candidate that was dialed.
        addr: SocketAddr,
        /// The transport's error.
        source: io::Error,
    },
    /// A TLS handshake over an established transport connection failed.
    #[error("tls handshake with {addr} failed: {source}")]
    Handshake {
        /// The candidate the handshake ran against.
        addr: SocketAddr,
        /// The handshake error.
        source: io::Error,
    },
    /// The host is not usable as a TLS server name.
    #[error("host {0:?} is not a valid tls server name")]
    InvalidServerName(String),
}

/// A socket-producing transport dialer.
///
/// Implementations must be safe to call concurrently; one race borrows a
/// single transport for all of its attempts.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a transport connection to `addr`.
    async fn connect(&self, addr: SocketAddr) -> io::Result<TcpStream>;
}

/// The default [`Transport`]: plain TCP with an optional per-attempt
/// connect timeout.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    /// Cap on how long a single connect may take. `None` defers entirely to
    /// the caller's cancellation and the operating system.
    pub connect_timeout: Option<Duration>,
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, TcpStream::connect(addr))
                .await
                .map_err(|_| {
                    io::Error::new(io::ErrorKind::TimedOut, format!("connect to {addr} timed out"))
                })?,
            None => TcpStream::connect(addr).await,
        }
    }
}

/// Happy Eyeballs dialer: races staggered connection attempts across an
/// interleaved candidate list and returns the first success.
///
/// # Usage
///
/// A dialer is created once with [`Dialer::new`] and reused for every dial.
/// [`dial`] races plain transport connections; [`dial_tls`] races TLS
/// handshakes over them. Both cancel every losing attempt the moment one
/// succeeds, and close every connection they do not return.
///
/// The transport is determined by the dialer's [`Transport`] and can be
/// swapped with [`Dialer::transport`].
///
/// [`dial`]: Dialer::dial()
/// [`dial_tls`]: Dialer::dial_tls()
pub struct Dialer<T = TcpTransport> {
    transport: Arc<T>,
    config: Config,
    metrics: Option<Arc<Metrics>>,
}

impl<T> Dialer<T> {
    /// Creates a dialer over `transport`.
    pub fn new(transport: T, config: Config, metrics: Option<Arc<Metrics>>) -> Self {
        Dialer {
            transport: Arc::new(transport),
            config,
            metrics,
        }
    }

    /// Sets the configuration of the dialer.
    pub fn config(self, config: Config) -> Self {
        Self { config, ..self }
    }

    /// Sets the metrics recorder of the dialer.
    pub fn metrics(self, metrics: Option<Arc<Metrics>>) -> Self {
        Self { metrics, ..self }
    }

    /// Sets the transport of the dialer.
    pub fn transport<U>(self, transport: U) -> Dialer<U> {
        Dialer {
            transport: Arc::new(transport),
            config: self.config,
            metrics: self.metrics,
        }
    }
}

impl Default for Dialer<TcpTransport> {
    fn default() -> Self {
        Dialer::new(TcpTransport::default(), Config::default(), None)
    }
}

impl<T: fmt::Debug> fmt::Debug for Dialer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dialer")
            .field("transport", &self.transport)
            .field("config", &self.config)
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}

/// Result of one attempt, tagged with its target for the winner record.
struct Outcome<C> {
    ip: IpAddr,
    family: Family,
    result: Result<C, Error>,
}

impl<T: Transport + 'static> Dialer<T> {
    /// Dials `host` by racing connection attempts across `ips`.
    ///
    /// Candidates are sorted and interleaved so IPv6 leads; each attempt
    /// after the first starts [`Config::connection_delay`] after its
    /// predecessor. The first attempt to produce a connection wins the race,
    /// every other attempt is cancelled, and every connection that is not
    /// returned is closed. On total failure the first error observed is
    /// returned.
    ///
    /// `host` is only used for observability; resolution has already
    /// happened by the time this is called.
    pub async fn dial(
        &self,
        cancel: CancellationToken,
        host: &str,
        port: u16,
        ips: &[IpAddr],
    ) -> Result<TcpStream, Error> {
        let transport = Arc::clone(&self.transport);
        let make = move |ip: IpAddr| {
            let transport = Arc::clone(&transport);
            async move {
                let addr = SocketAddr::new(ip, port);
                transport
                    .connect(addr)
                    .await
                    .map_err(|source| Error::Connect { addr, source })
            }
        };
        self.run(cancel, host, ips, make).await
    }

    /// Races the supplied attempts, dispatching on the candidate count.
    async fn run<C, F, Fut>(
        &self,
        cancel: CancellationToken,
        host: &str,
        ips: &[IpAddr],
        make: F,
    ) -> Result<C, Error>
    where
        C: Send + 'static,
        F: Fn(IpAddr) -> Fut,
        Fut: Future<Output = Result<C, Error>> + Send + 'static,
    {
        match ips {
            [] => Err(Error::NoAddresses),
            [ip] => self.dial_single(cancel, host, *ip, make(*ip)).await,
            _ => {
                let sorted = sort_and_interleave(ips);
                let attempts = sorted.iter().map(|&ip| (ip, make(ip))).collect();
                self.race(cancel, host, attempts).await
            }
        }
    }

    /// Single-candidate fast path: one synchronous attempt, recorded with
    /// `winner` equal to its success flag.
    async fn dial_single<C, Fut>(
        &self,
        cancel: CancellationToken,
        host: &str,
        ip: IpAddr,
        attempt: Fut,
    ) -> Result<C, Error>
    where
        Fut: Future<Output = Result<C, Error>>,
    {
        let started_at = Instant::now();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = attempt => result,
        };
        let finished_at = Instant::now();

        if let Some(metrics) = &self.metrics {
            metrics.record_connection_attempt(ConnectionAttempt {
                host: host.to_string(),
                ip,
                family: Family::of(ip),
                started_at,
                finished_at,
                success: result.is_ok(),
                error: result.as_ref().err().map(|e| e.to_string()),
                winner: result.is_ok(),
            });
        }

        result
    }

    /// The race proper: a scheduler task starts attempts on the stagger
    /// interval while the collector awaits the first success.
    async fn race<C, Fut>(
        &self,
        cancel: CancellationToken,
        host: &str,
        attempts: Vec<(IpAddr, Fut)>,
    ) -> Result<C, Error>
    where
        C: Send + 'static,
        Fut: Future<Output = Result<C, Error>> + Send + 'static,
    {
        let child = cancel.child_token();
        let race_start = Instant::now();
        // Capacity matches the candidate count: an attempt finishing after
        // the race is decided can still deposit its result without blocking.
        let (tx, mut rx) = mpsc::channel(attempts.len());

        {
            let child = child.clone();
            let host = host.to_string();
            let metrics = self.metrics.clone();
            let delay = self.config.connection_delay;
            #[cfg(feature = "log")]
            let verbose = self.config.verbose_logging;
            tokio::spawn(async move {
                for (i, (ip, attempt)) in attempts.into_iter().enumerate() {
                    if i > 0 {
                        #[cfg(feature = "log")]
                        if verbose {
                            tracing::debug!(
                                %ip,
                                family = %Family::of(ip),
                                ?delay,
                                "delaying connection attempt",
                            );
                        }
                        tokio::select! {
                            biased;
                            _ = child.cancelled() => break,
                            _ = sleep(delay) => {}
                        }
                    }
                    spawn_attempt(
                        attempt,
                        ip,
                        child.clone(),
                        host.clone(),
                        metrics.clone(),
                        tx.clone(),
                    );
                }
                // The scheduler's sender drops here; the channel closes once
                // every spawned attempt has finished with its clone.
            });
        }

        let mut first_err = None;
        while let Some(outcome) = rx.recv().await {
            match outcome.result {
                Ok(conn) => {
                    child.cancel();
                    if let Some(metrics) = &self.metrics {
                        metrics.record_connection_attempt(ConnectionAttempt {
                            host: host.to_string(),
                            ip: outcome.ip,
                            family: outcome.family,
                            started_at: race_start,
                            finished_at: Instant::now(),
                            success: true,
                            error: None,
                            winner: true,
                        });
                    }
                    return Ok(conn);
                }
                Err(err) => {
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        }

        Err(first_err.unwrap_or(Error::AllAttemptsFailed))
    }
}

/// Runs one attempt to completion, records it, and delivers its result.
fn spawn_attempt<C, Fut>(
    attempt: Fut,
    ip: IpAddr,
    child: CancellationToken,
    host: String,
    metrics: Option<Arc<Metrics>>,
    tx: mpsc::Sender<Outcome<C>>,
) where
    C: Send + 'static,
    Fut: Future<Output = Result<C, Error>> + Send + 'static,
{
    tokio::spawn(async move {
        let started_at = Instant::now();
        let family = Family::of(ip);
        let result = tokio::select! {
            biased;
            _ = child.cancelled() => Err(Error::Cancelled),
            result = attempt => result,
        };
        let finished_at = Instant::now();

        if let Some(metrics) = &metrics {
            metrics.record_connection_attempt(ConnectionAttempt {
                host,
                ip,
                family,
                started_at,
                finished_at,
                success: result.is_ok(),
                error: result.as_ref().err().map(|e| e.to_string()),
                winner: false,
            });
        }

        match result {
            Ok(conn) => {
                let send = tx.send(Outcome {
                    ip,
                    family,
                    result: Ok(conn),
                });
                // If the race is already decided, dropping the un-sent
                // outcome closes the connection.
                tokio::select! {
                    biased;
                    _ = child.cancelled() => {}
                    _ = send => {}
                }
            }
            Err(err) => {
                let _ = tx
                    .send(Outcome {
                        ip,
                        family,
                        result: Err(err),
                    })
                    .await;
            }
        }
    });
}
