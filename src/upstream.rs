//! Upstream resolver used by the Forward strategy.
//!
//! The dispatcher talks to a trait so tests can substitute a stub
//! resolver. The production implementation wraps hickory's tokio
//! resolver, built either from the system resolver configuration or a
//! single explicitly configured nameserver.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::rr::{Name, RData, RecordType};
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig};
use hickory_resolver::{Resolver, TokioResolver};
use hickory_resolver::name_server::TokioConnectionProvider;
use thiserror::Error;
use tracing::debug;

/// Hard deadline for one upstream lookup, separate from the listener's
/// own wait. A forward that exceeds it fails that one query only.
pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("failed to build upstream resolver: {0}")]
    Build(String),

    #[error("upstream lookup failed: {0}")]
    Lookup(String),

    #[error("upstream lookup timed out after {}s", LOOKUP_TIMEOUT.as_secs())]
    Timeout,
}

/// A-record lookup seam between dispatch and the resolver library.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Resolves `name` to its A records, preserving upstream order.
    async fn lookup_a(&self, name: &Name) -> Result<Vec<Ipv4Addr>, UpstreamError>;
}

/// Production upstream backed by `hickory_resolver`.
pub struct HickoryUpstream {
    resolver: TokioResolver,
}

impl HickoryUpstream {
    /// Resolver from the system configuration (resolv.conf or platform
    /// equivalent).
    pub fn from_system() -> Result<Self, UpstreamError> {
        let builder =
            Resolver::builder_tokio().map_err(|e| UpstreamError::Build(e.to_string()))?;
        Ok(Self {
            resolver: builder.build(),
        })
    }

    /// Resolver pinned to one nameserver, plain UDP/TCP on the given
    /// address.
    pub fn with_nameserver(addr: SocketAddr) -> Self {
        let group = NameServerConfigGroup::from_ips_clear(&[addr.ip()], addr.port(), true);
        let config = ResolverConfig::from_parts(None, Vec::new(), group);
        let builder = Resolver::builder_with_config(config, TokioConnectionProvider::default());
        Self {
            resolver: builder.build(),
        }
    }
}

#[async_trait]
impl Upstream for HickoryUpstream {
    async fn lookup_a(&self, name: &Name) -> Result<Vec<Ipv4Addr>, UpstreamError> {
        let lookup = tokio::time::timeout(
            LOOKUP_TIMEOUT,
            self.resolver.lookup(name.clone(), RecordType::A),
        )
        .await
        .map_err(|_| UpstreamError::Timeout)?
        .map_err(|e| UpstreamError::Lookup(e.to_string()))?;

        let mut addresses = Vec::new();
        for record in lookup.record_iter() {
            if let RData::A(a) = record.data() {
                addresses.push(a.0);
            } else {
                debug!(name = %name, rtype = %record.record_type(), "skipping non-A record");
            }
        }
        Ok(addresses)
    }
}
