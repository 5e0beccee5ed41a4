use crate::collections::{changes, Collection};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::watch;

/// The current contents of a collection, by key.
pub type Published<T> = Arc<BTreeMap<String, Arc<T>>>;

/// Publishes the contents of a collection to a watch each time it changes.
///
/// Nothing is published until the collection is synced, so that consumers
/// never observe a partial view of the cluster.
pub async fn publish<T, C>(collection: Arc<C>, tx: watch::Sender<Published<T>>)
where
    C: Collection<T> + ?Sized,
{
    let mut changes = changes(&*collection);
    collection.synced().wait_until_synced().await;

    let mut current = collection
        .keys()
        .into_iter()
        .filter_map(|k| collection.get(&k).map(|v| (k, v)))
        .collect::<BTreeMap<_, _>>();
    tracing::info!(collection = %collection.name(), entries = current.len(), "Synced");
    tx.send_replace(Arc::new(current.clone()));

    // Everything up to the initial publication is already reflected.
    changes.drain();

    while let Some(mut keys) = changes.recv().await {
        keys.extend(changes.drain());
        for key in keys {
            match collection.get(&key) {
                Some(value) => {
                    tracing::debug!(collection = %collection.name(), %key, "Updated");
                    current.insert(key, value);
                }
                None => {
                    if current.remove(&key).is_some() {
                        tracing::debug!(collection = %collection.name(), %key, "Removed");
                    }
                }
            }
        }
        tx.send_replace(Arc::new(current.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collections::StaticCollection;

    #[tokio::test]
    async fn publishes_once_synced() {
        let _tracing = tracing_subscriber::fmt().with_test_writer().try_init();

        let values = StaticCollection::new("values", |v: &String| v.clone()).shared();
        values.apply("a".to_string());

        let (tx, mut rx) = watch::channel(Published::<String>::default());
        let task = tokio::spawn(publish(values.clone(), tx));

        tokio::task::yield_now().await;
        assert!(rx.borrow().is_empty(), "must not publish before sync");

        values.mark_synced();
        rx.changed().await.expect("publisher must be running");
        assert_eq!(
            rx.borrow_and_update().keys().collect::<Vec<_>>(),
            vec!["a"]
        );

        values.apply("b".to_string());
        values.delete("a");
        rx.changed().await.expect("publisher must be running");
        assert_eq!(
            rx.borrow_and_update().keys().collect::<Vec<_>>(),
            vec!["b"]
        );

        task.abort();
    }
}
