//! [`Directory`] over a ZooKeeper ensemble.
//!
//! ZooKeeper watches fire once; every watch task re-reads its node after a
//! firing, which both delivers the new value and arms the next watch. A
//! failed read is retried with backoff, and a missing node is waited for
//! with an existence watch. Watches end with their session. The tree cache
//! re-arms all of them when it sees the next
//! [`DirectoryEvent::SessionEstablished`].

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};
use zookeeper_client as zk;

use crate::directory::{Directory, DirectoryEvent, WatchHandle, WatchToken};
use crate::error::{BinderError, DirectoryError};
use crate::metrics::{self, SessionTransition};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// A ZooKeeper-backed directory.
#[derive(Clone)]
pub struct ZkDirectory {
    cluster: String,
    client: Arc<RwLock<Option<zk::Client>>>,
    events: mpsc::UnboundedSender<DirectoryEvent>,
    runtime: Handle,
}

impl std::fmt::Debug for ZkDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZkDirectory")
            .field("cluster", &self.cluster)
            .field("connected", &self.client.read().is_some())
            .finish()
    }
}

impl ZkDirectory {
    /// Create a directory for `cluster` (`host:port,host:port`).
    ///
    /// Must be called from within a tokio runtime. Nothing connects until
    /// [`ZkDirectory::run`] is polled.
    pub fn new(cluster: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<DirectoryEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let directory = Self {
            cluster: cluster.into(),
            client: Arc::new(RwLock::new(None)),
            events,
            runtime: Handle::current(),
        };
        (directory, rx)
    }

    /// Maintain a session until shutdown, reconnecting with backoff.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), BinderError> {
        let mut backoff = Backoff::new();
        loop {
            let connect = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => return Ok(()),
                result = zk::Client::connect(&self.cluster) => result,
            };

            let client = match connect {
                Ok(client) => client,
                Err(e) => {
                    let delay = backoff.next();
                    warn!(cluster = %self.cluster, error = %e, retry_in = ?delay, "failed to connect to directory");
                    metrics::record_session(SessionTransition::ConnectFailed);
                    tokio::select! {
                        biased;
                        _ = shutdown.wait_for(|stop| *stop) => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
            };

            backoff.reset();
            info!(cluster = %self.cluster, "directory session established");
            let mut states = client.state_watcher();
            *self.client.write() = Some(client);
            if self.events.send(DirectoryEvent::SessionEstablished).is_err() {
                return Err(DirectoryError::Backend("event consumer is gone".into()).into());
            }

            loop {
                let state = tokio::select! {
                    biased;
                    _ = shutdown.wait_for(|stop| *stop) => {
                        self.client.write().take();
                        return Ok(());
                    }
                    state = states.changed() => state,
                };

                match state {
                    zk::SessionState::SyncConnected | zk::SessionState::ConnectedReadOnly => {
                        debug!("directory connection restored");
                    }
                    zk::SessionState::Disconnected => {
                        warn!("directory connection lost, waiting for the session to resume");
                    }
                    other => {
                        error!(state = ?other, "directory session ended");
                        self.client.write().take();
                        let _ = self.events.send(DirectoryEvent::Disconnected);
                        break;
                    }
                }
            }
        }
    }

    fn spawn_watch(&self, client: zk::Client, path: String, token: WatchToken) {
        let events = self.events.clone();
        self.runtime.spawn(watch_data(
            client.clone(),
            path.clone(),
            token.clone(),
            events.clone(),
        ));
        self.runtime.spawn(watch_children(client, path, token, events));
    }
}

impl Directory for ZkDirectory {
    fn watch(&self, path: &str) -> WatchHandle {
        let (handle, token) = WatchHandle::new(path);
        match self.client.read().clone() {
            Some(client) => self.spawn_watch(client, path.to_string(), token),
            None => trace!(path, "no session, watch deferred to the next one"),
        }
        handle
    }
}

/// What a watch task does after a failed read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadFailure {
    /// The node is gone; wait for it to be created.
    Missing,
    /// The session is over; the next session rebinds every watch.
    SessionOver,
    /// Anything else; read again after a backoff.
    Transient,
}

impl ReadFailure {
    fn of(error: &zk::Error) -> Self {
        match error {
            zk::Error::NoNode => Self::Missing,
            zk::Error::SessionExpired | zk::Error::ClientClosed => Self::SessionOver,
            _ => Self::Transient,
        }
    }
}

/// Exponential delay between attempts, capped at [`MAX_BACKOFF`].
#[derive(Debug)]
struct Backoff(Duration);

impl Backoff {
    fn new() -> Self {
        Self(INITIAL_BACKOFF)
    }

    /// The delay to wait now; doubles the next one.
    fn next(&mut self) -> Duration {
        let delay = self.0;
        self.0 = (self.0 * 2).min(MAX_BACKOFF);
        delay
    }

    fn reset(&mut self) {
        self.0 = INITIAL_BACKOFF;
    }
}

/// How often a parked watch task checks whether its handle was dropped.
const CANCEL_POLL: Duration = Duration::from_secs(30);

/// Wait for `watcher` to fire, giving up once `token` is cancelled.
async fn fired(watcher: zk::OneshotWatcher, token: &WatchToken) -> Option<zk::WatchedEvent> {
    let changed = watcher.changed();
    tokio::pin!(changed);
    loop {
        tokio::select! {
            event = &mut changed => return Some(event),
            _ = tokio::time::sleep(CANCEL_POLL) => {
                if !token.is_active() {
                    return None;
                }
            }
        }
    }
}

async fn watch_data(
    client: zk::Client,
    path: String,
    token: WatchToken,
    events: mpsc::UnboundedSender<DirectoryEvent>,
) {
    let mut backoff = Backoff::new();
    while token.is_active() {
        let watcher = match client.get_and_watch_data(&path).await {
            Ok((data, _stat, watcher)) => {
                backoff.reset();
                if !token.is_active() {
                    return;
                }
                let event = DirectoryEvent::DataChanged {
                    path: path.clone(),
                    data,
                };
                if events.send(event).is_err() {
                    return;
                }
                watcher
            }
            Err(e) => match recover(&client, &path, &e, &mut backoff).await {
                Some(Some(watcher)) => watcher,
                Some(None) => continue,
                None => return,
            },
        };

        let Some(event) = fired(watcher, &token).await else {
            return;
        };
        trace!(path = %path, event = ?event.event_type, "data watch fired");
        if matches!(event.event_type, zk::EventType::Session) {
            return;
        }
    }
}

async fn watch_children(
    client: zk::Client,
    path: String,
    token: WatchToken,
    events: mpsc::UnboundedSender<DirectoryEvent>,
) {
    let mut backoff = Backoff::new();
    while token.is_active() {
        let watcher = match client.get_and_watch_children(&path).await {
            Ok((children, _stat, watcher)) => {
                backoff.reset();
                if !token.is_active() {
                    return;
                }
                let event = DirectoryEvent::ChildrenChanged {
                    path: path.clone(),
                    children,
                };
                if events.send(event).is_err() {
                    return;
                }
                watcher
            }
            Err(e) => match recover(&client, &path, &e, &mut backoff).await {
                Some(Some(watcher)) => watcher,
                Some(None) => continue,
                None => return,
            },
        };

        let Some(event) = fired(watcher, &token).await else {
            return;
        };
        trace!(path = %path, event = ?event.event_type, "children watch fired");
        if matches!(event.event_type, zk::EventType::Session) {
            return;
        }
    }
}

/// Handle a failed read of `path`.
///
/// `None` ends the task. `Some(Some(watcher))` parks it on an existence
/// watch for a missing node; `Some(None)` reads again straight away.
async fn recover(
    client: &zk::Client,
    path: &str,
    error: &zk::Error,
    backoff: &mut Backoff,
) -> Option<Option<zk::OneshotWatcher>> {
    match ReadFailure::of(error) {
        ReadFailure::SessionOver => {
            debug!(path, error = %error, "watch ended with its session");
            None
        }
        ReadFailure::Missing => match client.check_and_watch_stat(path).await {
            Ok((Some(_), _)) => Some(None),
            Ok((None, watcher)) => {
                debug!(path, "watched node does not exist, waiting for it");
                Some(Some(watcher))
            }
            Err(e) => {
                let delay = backoff.next();
                warn!(path, error = %e, retry_in = ?delay, "failed to watch for node creation");
                tokio::time::sleep(delay).await;
                Some(None)
            }
        },
        ReadFailure::Transient => {
            let delay = backoff.next();
            warn!(path, error = %error, retry_in = ?delay, "failed to read watched node");
            tokio::time::sleep(delay).await;
            Some(None)
        }
    }
}
