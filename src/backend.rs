//! Resolver listing backend used by recursion.
//!
//! The backend is itself registered in the directory, so its address is
//! found through the tree cache before every listing.

use std::net::{IpAddr, Ipv4Addr};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, trace};

use crate::config::BackendConfig;
use crate::error::BinderError;
use crate::record::Record;
use crate::tree::TreeCache;

/// One resolver registered for a region.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResolverEntry {
    /// Datacenter the resolver serves.
    pub datacenter: String,
    /// Address the resolver listens on.
    pub ip: IpAddr,
}

/// Lists every resolver registered in a region.
#[async_trait]
pub trait ResolverSource: Send + Sync {
    /// Fetch the current listing for `region`.
    async fn list_resolvers(&self, region: &str) -> Result<Vec<ResolverEntry>, BinderError>;
}

/// Fetches the listing over HTTP from a backend registered in the directory.
#[derive(Debug, Clone)]
pub struct HttpResolverSource {
    client: reqwest::Client,
    cache: TreeCache,
    backend: BackendConfig,
}

impl HttpResolverSource {
    /// Create a source that locates `backend` through `cache`.
    ///
    /// Every request, connect included, is bounded by the backend timeout.
    pub fn new(cache: TreeCache, backend: BackendConfig) -> Result<Self, BinderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(backend.timeout())
            .timeout(backend.timeout())
            .build()?;
        Ok(Self {
            client,
            cache,
            backend,
        })
    }

    /// Current address of the backend according to the tree.
    pub fn backend_address(&self) -> Result<Ipv4Addr, BinderError> {
        locate(&self.cache, &self.backend.domain)
    }
}

#[async_trait]
impl ResolverSource for HttpResolverSource {
    async fn list_resolvers(&self, region: &str) -> Result<Vec<ResolverEntry>, BinderError> {
        let addr = self.backend_address()?;
        let url = format!("http://{}:{}{}", addr, self.backend.port, self.backend.path);
        debug!(%url, region, "listing resolvers");

        let response = self
            .client
            .get(&url)
            .query(&[("region", region)])
            .send()
            .await?
            .error_for_status()?;
        let entries: Vec<ResolverEntry> = response.json().await?;
        trace!(count = entries.len(), "resolver listing received");
        Ok(entries)
    }
}

/// Find an address for `domain` in the tree.
///
/// Hosts yield their own address, databases the host of their primary, and a
/// service the first member that has one.
fn locate(cache: &TreeCache, domain: &str) -> Result<Ipv4Addr, BinderError> {
    let domain = domain.trim_end_matches('.').to_ascii_lowercase();
    let node = cache
        .lookup(&domain)
        .ok_or_else(|| BinderError::Backend(format!("{domain} is not registered")))?;

    let found = match node.data.as_deref() {
        Some(Record::Service(_)) => cache.children(&node).iter().find_map(|child| {
            match child.data.as_deref() {
                Some(Record::Host(host)) if host.kind.is_member() => host.address,
                _ => None,
            }
        }),
        Some(Record::Database(db)) => Some(db.address),
        Some(record) => record.host_address(),
        None => None,
    };
    found.ok_or_else(|| BinderError::Backend(format!("{domain} has no usable address")))
}
