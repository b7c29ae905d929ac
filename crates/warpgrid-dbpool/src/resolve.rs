//! One-time database host resolution.
//!
//! A pool resolves its configured host exactly once and dials the cached
//! address for every connection it opens afterwards. The worker-startup hook
//! normally triggers the resolution before the first `acquire()`; if it does
//! not, the first connection attempt does.

use std::future::Future;
use std::net::IpAddr;

use tokio::sync::OnceCell;

use crate::error::{PoolError, PoolResult, ResolveError};

/// Name → addresses lookup used by [`HostResolver`].
pub trait Resolve {
    fn resolve(&self, host: &str) -> impl Future<Output = Result<Vec<IpAddr>, ResolveError>>;
}

/// Resolves through the host system's DNS via `tokio::net::lookup_host`.
///
/// IP literals are returned as-is without a lookup.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemResolver;

impl Resolve for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let lookup_addr = format!("{host}:0");
        match tokio::net::lookup_host(&lookup_addr).await {
            Ok(addrs) => {
                let ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
                if ips.is_empty() {
                    Err(ResolveError::HostNotFound(host.to_string()))
                } else {
                    Ok(ips)
                }
            }
            Err(e) => {
                tracing::debug!(host = %host, error = %e, "system DNS lookup failed");
                Err(ResolveError::Lookup {
                    host: host.to_string(),
                    source: e,
                })
            }
        }
    }
}

/// Memoizes the resolution of a single host for the lifetime of a pool.
///
/// Concurrent first callers share one lookup; a failed lookup is not
/// cached, so a later call retries.
pub struct HostResolver<R = SystemResolver> {
    host: String,
    resolver: R,
    resolved: OnceCell<IpAddr>,
}

impl<R: Resolve> HostResolver<R> {
    pub fn new(host: &str, resolver: R) -> Self {
        Self {
            host: host.to_string(),
            resolver,
            resolved: OnceCell::new(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// The cached address, if resolution already succeeded.
    pub fn cached(&self) -> Option<IpAddr> {
        self.resolved.get().copied()
    }

    /// Resolve the host, or return the address cached by an earlier call.
    ///
    /// Picks the first IPv4 address when the lookup returns several, falling
    /// back to the first address of any family.
    pub async fn resolve(&self) -> PoolResult<IpAddr> {
        let addr = self
            .resolved
            .get_or_try_init(|| async {
                let addrs = self.resolver.resolve(&self.host).await.map_err(|e| {
                    PoolError::ConnectionUnavailable {
                        host: self.host.clone(),
                        reason: e.to_string(),
                    }
                })?;
                let addr = addrs
                    .iter()
                    .copied()
                    .find(IpAddr::is_ipv4)
                    .or_else(|| addrs.first().copied())
                    .ok_or_else(|| PoolError::ConnectionUnavailable {
                        host: self.host.clone(),
                        reason: ResolveError::HostNotFound(self.host.clone()).to_string(),
                    })?;
                tracing::info!(
                    host = %self.host,
                    addr = %addr,
                    candidates = addrs.len(),
                    "database host resolved"
                );
                Ok::<IpAddr, PoolError>(addr)
            })
            .await?;
        Ok(*addr)
    }
}

impl<R> std::fmt::Debug for HostResolver<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostResolver")
            .field("host", &self.host)
            .field("resolved", &self.resolved.get())
            .finish_non_exhaustive()
    }
}
