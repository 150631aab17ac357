//! DNS server setup and lifecycle management.

use hickory_server::ServerFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use crate::backend::HttpResolverSource;
use crate::config::Config;
use crate::directory::{Directory, DirectoryEvent};
use crate::error::{BinderError, DirectoryError};
use crate::handler::BinderHandler;
use crate::hints::RootHints;
use crate::interfaces::InterfaceAddrs;
use crate::recursion::Recursion;
use crate::resolver::Resolver;
use crate::sync::TreeSync;
use crate::tree::TreeCache;
use crate::upstream::UdpUpstream;

/// Interval for emitting tree metrics.
const METRICS_INTERVAL: Duration = Duration::from_secs(10);

/// Periodically emit tree metrics.
async fn metrics_loop(cache: TreeCache, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(METRICS_INTERVAL);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                cache.emit_metrics();
                debug!(
                    nodes = cache.len(),
                    watches = cache.watch_count(),
                    ready = cache.is_ready(),
                    "emitted tree metrics"
                );
            }
            _ = shutdown.wait_for(|stop| *stop) => {
                debug!("metrics loop shutting down");
                return;
            }
        }
    }
}

/// DNS server backed by a directory tree.
pub struct DnsServer {
    config: Config,
}

impl DnsServer {
    /// Create a new DNS server with the given configuration.
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// The server configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run until `shutdown` flips to true.
    ///
    /// `directory` and `events` are the two halves of a directory client;
    /// the caller keeps its session alive. Returns an error if the event
    /// stream ends, since the tree can no longer be trusted.
    pub async fn run_with_directory(
        self,
        directory: Arc<dyn Directory>,
        events: mpsc::UnboundedReceiver<DirectoryEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), BinderError> {
        self.config.validate()?;
        let dns = &self.config.dns;
        let root_domain = self.config.directory.root_domain(dns)?;

        info!(
            listen_addr = %dns.listen_addr,
            dns_domain = ?dns.dns_domain,
            datacenter = ?dns.datacenter_name,
            root_domain = %root_domain,
            recursion = self.config.recursion.is_some(),
            "Starting binder DNS server"
        );

        let hints = Arc::new(RootHints::load(dns.root_hints.as_deref())?);
        let cache = TreeCache::new(directory, &root_domain);

        let recursion = match (&self.config.recursion, &dns.dns_domain, &dns.datacenter_name) {
            (Some(config), Some(zone), Some(datacenter)) => {
                let source = HttpResolverSource::new(cache.clone(), config.backend.clone())?;
                Some(Arc::new(Recursion::new(
                    config.clone(),
                    zone,
                    datacenter,
                    Arc::new(source),
                    Arc::new(UdpUpstream::new()),
                    InterfaceAddrs::system(),
                )))
            }
            _ => None,
        };

        let resolver = Resolver::new(
            cache.clone(),
            dns.dns_domain.clone(),
            dns.datacenter_name.clone(),
            hints,
            recursion.is_some(),
        );
        let handler = BinderHandler::new(resolver, recursion.clone());

        // Start the tree sync
        let mut sync_handle = tokio::spawn(TreeSync::new(cache.clone(), events).run(shutdown.clone()));

        // Start recursion refresh
        let recursion_handle = recursion
            .clone()
            .map(|recursion| tokio::spawn(recursion.run(shutdown.clone())));

        // Create server
        let mut server = ServerFuture::new(handler);

        // Bind UDP
        let udp_socket = UdpSocket::bind(dns.listen_addr).await?;
        info!(addr = %udp_socket.local_addr()?, "DNS UDP listening");
        server.register_socket(udp_socket);

        // Bind TCP
        let tcp_listener = TcpListener::bind(dns.listen_addr).await?;
        info!(addr = %tcp_listener.local_addr()?, "DNS TCP listening");
        server.register_listener(tcp_listener, dns.tcp_idle_timeout());

        let mut stop = shutdown.clone();
        if let Some(recursion) = &recursion {
            info!("Waiting for recursion to initialise...");
            tokio::select! {
                biased;
                _ = stop.wait_for(|stop| *stop) => {
                    info!("Shutdown requested before recursion was ready");
                }
                _ = recursion.wait_ready() => {
                    info!("Recursion ready");
                }
            }
        }

        info!(root_domain = %root_domain, "DNS server ready to serve queries");

        // Start metrics loop
        let metrics_handle = tokio::spawn(metrics_loop(cache.clone(), shutdown.clone()));
        cache.emit_metrics();

        // Run server until shutdown
        let result = tokio::select! {
            _ = stop.wait_for(|stop| *stop) => {
                info!("DNS server shutdown requested");
                Ok(())
            }
            joined = &mut sync_handle => {
                error!("Tree sync stopped, shutting down");
                match joined {
                    Ok(result) => result,
                    Err(e) => Err(DirectoryError::Backend(format!("tree sync task failed: {e}")).into()),
                }
            }
            served = server.block_until_done() => {
                if let Err(e) = served {
                    error!("DNS server error: {}", e);
                }
                Ok(())
            }
        };

        let _ = metrics_handle.await;
        if let Some(handle) = recursion_handle {
            let _ = handle.await;
        }
        if !sync_handle.is_finished() {
            let _ = sync_handle.await;
        }

        info!("DNS server stopped");
        result
    }
}
