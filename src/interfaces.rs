//! Addresses bound to this machine's network interfaces.
//!
//! Recursion must never forward a query to ourselves, so upstream candidates
//! are checked against this set. The snapshot is re-read at most every
//! [`REFRESH_INTERVAL`].

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{trace, warn};

/// Maximum age of an interface snapshot.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Lazily refreshed set of local addresses.
#[derive(Debug, Clone)]
pub struct InterfaceAddrs {
    inner: Arc<Mutex<Snapshot>>,
    fixed: bool,
}

#[derive(Debug, Default)]
struct Snapshot {
    addrs: HashSet<IpAddr>,
    fetched: Option<Instant>,
}

impl InterfaceAddrs {
    /// Read addresses from the operating system.
    pub fn system() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Snapshot::default())),
            fixed: false,
        }
    }

    /// A fixed set that is never refreshed.
    pub fn fixed(addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Snapshot {
                addrs: addrs.into_iter().collect(),
                fetched: Some(Instant::now()),
            })),
            fixed: true,
        }
    }

    /// True if `addr` is bound locally.
    pub fn contains(&self, addr: &IpAddr) -> bool {
        let mut snapshot = self.inner.lock();
        self.refresh_if_stale(&mut snapshot);
        snapshot.addrs.contains(addr)
    }

    /// The current set of local addresses.
    pub fn snapshot(&self) -> HashSet<IpAddr> {
        let mut snapshot = self.inner.lock();
        self.refresh_if_stale(&mut snapshot);
        snapshot.addrs.clone()
    }

    fn refresh_if_stale(&self, snapshot: &mut Snapshot) {
        if self.fixed {
            return;
        }
        if snapshot
            .fetched
            .is_some_and(|at| at.elapsed() < REFRESH_INTERVAL)
        {
            return;
        }

        match read_interfaces() {
            Ok(addrs) => {
                trace!(count = addrs.len(), "refreshed local interface addresses");
                snapshot.addrs = addrs;
            }
            // Keep the previous snapshot; retry after the next interval.
            Err(e) => warn!(error = %e, "failed to read interface addresses"),
        }
        snapshot.fetched = Some(Instant::now());
    }
}

#[cfg(unix)]
fn read_interfaces() -> std::io::Result<HashSet<IpAddr>> {
    use nix::sys::socket::SockaddrLike;
    use std::net::{SocketAddrV4, SocketAddrV6};

    let mut addrs = HashSet::new();
    for ifaddr in nix::ifaddrs::getifaddrs().map_err(std::io::Error::from)? {
        let Some(storage) = ifaddr.address else {
            continue;
        };
        if let Some(v4) = storage.as_sockaddr_in() {
            addrs.insert(IpAddr::V4(*SocketAddrV4::from(*v4).ip()));
        } else if let Some(v6) = storage.as_sockaddr_in6() {
            addrs.insert(IpAddr::V6(*SocketAddrV6::from(*v6).ip()));
        } else {
            trace!(family = ?storage.family(), "skipping non-IP interface address");
        }
    }
    Ok(addrs)
}

#[cfg(not(unix))]
fn read_interfaces() -> std::io::Result<HashSet<IpAddr>> {
    Ok(HashSet::new())
}
