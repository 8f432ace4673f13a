//! Target addresses and endpoint discovery for tunnel clients.
//!
//! # Responsibilities
//! - Parse `direct://`, `kubernetes://` and bare `service[.namespace]:port`
//! - Resolve a service to its current set of endpoints
//! - Keep a balanced channel's membership in sync with the resolver
//!
//! # Design Decisions
//! - Resolution is a trait so tests and non-cluster deployments can plug in
//!   their own source of endpoints
//! - The watch loop diffs successive answers and only pushes changes

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower04::discover::Change;
use tonic::transport::Endpoint;
use url::Url;

use crate::tunnel::error::TunnelError;

/// How often the balanced channel re-resolves its service.
pub const DEFAULT_RESOLVE_INTERVAL: Duration = Duration::from_secs(10);

const DEFAULT_NAMESPACE: &str = "default";

/// A service inside a cluster namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceTarget {
    pub service: String,
    pub namespace: String,
    pub port: u16,
}

impl fmt::Display for ServiceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}:{}", self.service, self.namespace, self.port)
    }
}

/// Where a tunnel client sends its calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A single `host:port`, dialled as-is.
    Direct(String),
    /// A service whose endpoints come from an [`EndpointResolver`].
    Service(ServiceTarget),
}

impl Target {
    /// Parse a client address. Addresses without a scheme are services.
    pub fn parse(address: &str) -> Result<Self, TunnelError> {
        let invalid = |reason: String| TunnelError::InvalidAddress {
            address: address.to_owned(),
            reason,
        };

        let normalized = if address.contains("://") {
            address.to_owned()
        } else {
            format!("kubernetes://{address}")
        };
        let url = Url::parse(&normalized).map_err(|e| invalid(e.to_string()))?;

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host".into()))?;
        let port = url.port().ok_or_else(|| invalid("missing port".into()))?;

        match url.scheme() {
            "direct" => Ok(Target::Direct(format!("{host}:{port}"))),
            "kubernetes" => {
                let (service, namespace) = match host.split_once('.') {
                    Some((service, namespace)) => (service, namespace),
                    None => (host, DEFAULT_NAMESPACE),
                };
                Ok(Target::Service(ServiceTarget {
                    service: service.to_owned(),
                    namespace: namespace.to_owned(),
                    port,
                }))
            }
            other => Err(TunnelError::UnsupportedScheme(other.to_owned())),
        }
    }
}

/// Source of endpoints for a service.
pub trait EndpointResolver: Send + Sync + 'static {
    fn resolve(&self, target: &ServiceTarget) -> BoxFuture<'static, io::Result<Vec<SocketAddr>>>;
}

/// Resolves services through cluster DNS
/// (`service.namespace.svc.cluster.local`).
#[derive(Debug, Clone, Default)]
pub struct DnsResolver;

impl EndpointResolver for DnsResolver {
    fn resolve(&self, target: &ServiceTarget) -> BoxFuture<'static, io::Result<Vec<SocketAddr>>> {
        let host = format!(
            "{}.{}.svc.cluster.local:{}",
            target.service, target.namespace, target.port
        );
        Box::pin(async move { Ok(tokio::net::lookup_host(host).await?.collect()) })
    }
}

/// Feed a balanced channel with the resolver's answers until `cancel` fires
/// or the channel goes away.
pub(crate) async fn watch_endpoints(
    resolver: Arc<dyn EndpointResolver>,
    target: ServiceTarget,
    changes: mpsc::Sender<Change<SocketAddr, Endpoint>>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut current: HashSet<SocketAddr> = HashSet::new();
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let next: HashSet<SocketAddr> = match resolver.resolve(&target).await {
            Ok(addrs) => addrs.into_iter().collect(),
            Err(e) => {
                tracing::warn!(target = %target, error = %e, "Endpoint resolution failed");
                continue;
            }
        };

        for gone in current.difference(&next) {
            tracing::debug!(target = %target, endpoint = %gone, "Removing endpoint");
            if changes.send(Change::Remove(*gone)).await.is_err() {
                return;
            }
        }
        for added in next.difference(&current) {
            let endpoint = match Endpoint::from_shared(format!("http://{added}")) {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    tracing::warn!(endpoint = %added, error = %e, "Skipping invalid endpoint");
                    continue;
                }
            };
            tracing::debug!(target = %target, endpoint = %added, "Adding endpoint");
            if changes.send(Change::Insert(*added, endpoint)).await.is_err() {
                return;
            }
        }
        current = next;
    }
}
