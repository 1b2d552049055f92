use crate::config::NamespaceFilter;
use crate::workload::Workload;
use crate::workqueue::WorkQueue;
use kube::ResourceExt;
use kube::runtime::reflector::Store;
use tracing::{debug, warn};

/// Turns cache notifications into queue keys. Only the identity of the object
/// is kept; the reconciler reads the current state from the cache itself.
#[derive(Clone)]
pub struct EventRouter {
    queue: WorkQueue,
    namespaces: NamespaceFilter,
}

impl EventRouter {
    pub fn new(queue: WorkQueue, namespaces: NamespaceFilter) -> Self {
        Self { queue, namespaces }
    }

    pub fn on_add<W: Workload>(&self, obj: &W) {
        self.enqueue(obj);
    }

    pub fn on_update<W: Workload>(&self, _old: &W, new: &W) {
        self.enqueue(new);
    }

    /// Re-notifies every cached object as an update of itself.
    pub fn resync<W: Workload>(&self, store: &Store<W>) {
        let objects = store.state();
        debug!("Resyncing {} {} objects", objects.len(), W::KIND);
        for obj in objects {
            self.on_update(obj.as_ref(), obj.as_ref());
        }
    }

    fn enqueue<W: Workload>(&self, obj: &W) {
        let Some(key) = obj.work_item_key() else {
            warn!(
                "Ignoring {} {} without namespace or name",
                W::KIND,
                obj.name_any()
            );
            return;
        };
        if self.namespaces.is_excluded(&key.namespace) {
            debug!("Ignoring {} in excluded namespace", key);
            return;
        }
        self.queue.add(key.to_string());
    }
}
