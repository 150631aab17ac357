//! Single-writer task applying directory events to the tree cache.

use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use crate::directory::DirectoryEvent;
use crate::error::{BinderError, DirectoryError};
use crate::tree::TreeCache;

/// Owns the directory event stream and feeds it into a [`TreeCache`].
pub struct TreeSync {
    cache: TreeCache,
    events: mpsc::UnboundedReceiver<DirectoryEvent>,
}

impl TreeSync {
    /// Create a new sync task over `events`.
    pub fn new(cache: TreeCache, events: mpsc::UnboundedReceiver<DirectoryEvent>) -> Self {
        Self { cache, events }
    }

    /// Apply events until shutdown.
    ///
    /// Returns an error if the directory client stops producing events; the
    /// process cannot serve a live tree after that.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), BinderError> {
        info!(root = %self.cache.root_domain(), "starting tree sync");
        loop {
            tokio::select! {
                biased;

                _ = shutdown.wait_for(|stop| *stop) => {
                    info!("tree sync shutting down");
                    return Ok(());
                }

                event = self.events.recv() => match event {
                    Some(event) => self.cache.apply(event),
                    None => {
                        error!("directory event stream closed");
                        return Err(DirectoryError::SessionLost.into());
                    }
                },
            }
        }
    }

    /// Apply every event already queued, including those produced while
    /// applying. Returns how many were applied.
    pub fn apply_pending(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(event) = self.events.try_recv() {
            self.cache.apply(event);
            applied += 1;
        }
        applied
    }

    /// The cache this task writes to.
    pub fn cache(&self) -> &TreeCache {
        &self.cache
    }
}
