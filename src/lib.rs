#![deny(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

/*!
Happy Eyeballs v2 connection establishment, as described by
[RFC 8305](https://tools.ietf.org/html/rfc8305).

# Introduction

A host name often resolves to several addresses spanning IPv4 and IPv6.
Trying them one after another wastes seconds on dead paths; connecting to
all of them at once floods the network and the remote endpoint. Happy
Eyeballs stages the work so the *first successful* connection wins with
minimal latency while preferring IPv6 when it is healthy:

1. Both address families are resolved concurrently, with the IPv6 query
   granted a configurable head start ([`concurrent_dns_lookup`]).
2. The merged candidates are ordered family-first and interleaved, IPv6
   leading ([`sort_and_interleave`]).
3. Connection attempts start in that order, each staggered behind its
   predecessor by a connection delay, and truly race once started. The
   first success cancels every other attempt ([`Dialer::dial`]).
4. The same race can run over TLS handshakes instead of bare transport
   connections ([`Dialer::dial_tls`]).

Every connection a race opens is either returned (exactly one) or closed,
including connections that complete after the race is already decided.

# Example

```no_run
use std::sync::Arc;

use eyeballs_rs::{Config, Dialer, Metrics, TcpTransport};
use tokio_util::sync::CancellationToken;

# async fn dial() -> Result<(), eyeballs_rs::Error> {
let metrics = Arc::new(Metrics::new(true, false, None));
let dialer = Dialer::new(
    TcpTransport::default(),
    Config::from_env(),
    Some(Arc::clone(&metrics)),
);

let ips: Vec<std::net::IpAddr> = vec![
    "2001:db8::1".parse().unwrap(),
    "192.0.2.1".parse().unwrap(),
];
let conn = dialer
    .dial(CancellationToken::new(), "example.com", 443, &ips)
    .await?;
# drop(conn);

println!("{}", metrics.summary());
# Ok(())
# }
```

# Alternative Transports and DNS Backends

The transport used for connection attempts is determined by a dialer's
[`Transport`] and can be set with [`Dialer::transport`]. DNS resolution is
supplied by the caller as a [`FamilyLookup`] implementation; a ready-made
backend is enabled by the following feature:

- `hickory` (wrapping a [hickory-resolver](https://docs.rs/hickory-resolver)
  handle in `resolver::HickoryLookup`)
*/

mod address;
pub use address::{interleave, sort_and_interleave, Family};

mod config;
pub use config::Config;

mod dialer;
pub use dialer::{Dialer, Error, TcpTransport, Transport};

mod metrics;
pub use metrics::{
    ConnectionAttempt, DnsResolution, MemoryStore, Metrics, MetricsStore, StoreError,
};

pub mod resolver;
pub use resolver::{concurrent_dns_lookup, FamilyLookup, ResolveError};
