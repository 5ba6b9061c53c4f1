//! [`FamilyLookup`] backed by [`hickory_resolver`].

use std::net::IpAddr;

use async_trait::async_trait;
use hickory_resolver::{name_server::ConnectionProvider, ResolveError, Resolver};
use tokio_util::sync::CancellationToken;

use super::FamilyLookup;
use crate::address::Family;

/// Adapter turning a [`hickory_resolver::Resolver`] handle into a
/// [`FamilyLookup`]: AAAA lookups for IPv6, A lookups for IPv4.
///
/// Hickory's high-level lookups do not report per-answer authenticity, so
/// the validated flag is fixed at construction: leave it off unless the
/// wrapped resolver is configured to require DNSSEC validation, in which
/// case every answer that arrives has been validated and
/// [`HickoryLookup::assume_validated`] applies.
#[derive(Clone)]
pub struct HickoryLookup<P: ConnectionProvider> {
    resolver: Resolver<P>,
    validated: bool,
}

impl<P: ConnectionProvider> HickoryLookup<P> {
    /// Wraps a resolver handle, reporting answers as unvalidated.
    pub fn new(resolver: Resolver<P>) -> Self {
        HickoryLookup {
            resolver,
            validated: false,
        }
    }

    /// Marks every answer from this resolver as DNSSEC-validated.
    pub fn assume_validated(self) -> Self {
        HickoryLookup {
            validated: true,
            ..self
        }
    }
}

#[async_trait]
impl<P> FamilyLookup for HickoryLookup<P>
where
    P: ConnectionProvider,
{
    type Error = ResolveError;

    async fn lookup(
        &self,
        cancel: CancellationToken,
        family: Family,
        host: &str,
    ) -> Result<(Vec<IpAddr>, bool), ResolveError> {
        let query = async {
            match family {
                Family::V6 => self
                    .resolver
                    .ipv6_lookup(host)
                    .await
                    .map(|lookup| lookup.iter().map(|aaaa| IpAddr::V6(aaaa.0)).collect()),
                Family::V4 => self
                    .resolver
                    .ipv4_lookup(host)
                    .await
                    .map(|lookup| lookup.iter().map(|a| IpAddr::V4(a.0)).collect()),
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(ResolveError::from("lookup cancelled")),
            result = query => result.map(|ips: Vec<IpAddr>| (ips, self.validated)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn validated_flag_is_off_by_default() {
        let resolver = Resolver::builder_tokio().unwrap().build();
        let lookup = HickoryLookup::new(resolver);
        assert!(!lookup.validated);
        assert!(lookup.clone().assume_validated().validated);
    }
}
