use crate::{Dependent, Source, SourceId};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

/// Delivers the keys changed in a collection to a task outside the
/// collection graph.
pub struct Changes {
    rx: mpsc::UnboundedReceiver<Vec<String>>,
    _forward: Arc<Forward>,
}

struct Forward(mpsc::UnboundedSender<Vec<String>>);

/// Subscribes to the changes of a source. The subscription ends when the
/// returned handle is dropped.
pub fn changes<S: Source + ?Sized>(source: &S) -> Changes {
    let (tx, rx) = mpsc::unbounded_channel();
    let forward = Arc::new(Forward(tx));
    let dependent: Weak<dyn Dependent> = Arc::downgrade(&forward) as Weak<dyn Dependent>;
    source.subscribe(dependent);
    Changes {
        rx,
        _forward: forward,
    }
}

impl Changes {
    pub async fn recv(&mut self) -> Option<Vec<String>> {
        self.rx.recv().await
    }

    /// Drains every batch of changes that is ready, returning the deduplicated
    /// keys.
    pub fn drain(&mut self) -> Vec<String> {
        let mut keys = std::collections::BTreeSet::new();
        while let Ok(batch) = self.rx.try_recv() {
            keys.extend(batch);
        }
        keys.into_iter().collect()
    }
}

impl Dependent for Forward {
    fn on_change(&self, _: SourceId, keys: &[String]) {
        // The receiver is owned alongside this sender, so sends only fail
        // while the handle is being dropped.
        let _ = self.0.send(keys.to_vec());
    }

    fn on_synced(&self, _: SourceId) {}
}
