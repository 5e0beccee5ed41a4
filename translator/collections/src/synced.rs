use std::sync::Arc;
use tokio::sync::watch;

/// Becomes true, once, when a collection's initial state is complete.
#[derive(Clone, Debug)]
pub struct Synced(Arc<watch::Sender<bool>>);

impl Synced {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self(Arc::new(tx))
    }

    /// A signal that starts out synced.
    pub fn ready() -> Self {
        let synced = Self::new();
        synced.mark();
        synced
    }

    pub fn has_synced(&self) -> bool {
        *self.0.borrow()
    }

    /// Marks the signal as synced, returning true if it was not already.
    pub(crate) fn mark(&self) -> bool {
        self.0.send_if_modified(|synced| {
            if *synced {
                return false;
            }
            *synced = true;
            true
        })
    }

    pub fn watch(&self) -> watch::Receiver<bool> {
        self.0.subscribe()
    }

    pub async fn wait_until_synced(&self) {
        let mut rx = self.watch();
        // The sender is owned by this handle, so the channel cannot close
        // while we wait.
        let _ = rx.wait_for(|synced| *synced).await;
    }
}

impl Default for Synced {
    fn default() -> Self {
        Self::new()
    }
}

/// Waits until every signal is synced.
pub async fn wait_for_all(signals: impl IntoIterator<Item = Synced>) {
    for synced in signals {
        synced.wait_until_synced().await;
    }
}
