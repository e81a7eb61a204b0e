use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use router_tree::RadixTree;

use crate::error::RouterError;
use crate::transport::WorkerTransport;
use crate::types::WorkerId;

/// Everything the dispatcher needs for one worker: its own lock on its
/// radix tree (dispatches to different workers never contend with each
/// other), an in-flight counter, and a transport handle the core treats
/// as opaque.
pub struct WorkerRecord {
    pub id: WorkerId,
    pub address: String,
    pub in_flight: AtomicU64,
    pub tree: Mutex<RadixTree>,
    pub transport: Arc<dyn WorkerTransport>,
}

impl WorkerRecord {
    fn new(id: WorkerId, address: String, transport: Arc<dyn WorkerTransport>) -> Self {
        Self {
            id,
            address,
            in_flight: AtomicU64::new(0),
            tree: Mutex::new(RadixTree::new()),
            transport,
        }
    }
}

/// The set of active workers. Keeps both a hash map (O(1) lookup by id)
/// and an insertion-ordered list, because the dispatcher's tie-breaking
/// rule is insertion order, which a bare hash map cannot give cheaply.
pub struct WorkerRegistry {
    workers: DashMap<WorkerId, Arc<WorkerRecord>>,
    order: Mutex<Vec<WorkerId>>,
    transport_factory: Box<dyn Fn(&str) -> Arc<dyn WorkerTransport> + Send + Sync>,
}

impl WorkerRegistry {
    pub fn new(
        transport_factory: impl Fn(&str) -> Arc<dyn WorkerTransport> + Send + Sync + 'static,
    ) -> Self {
        Self {
            workers: DashMap::new(),
            order: Mutex::new(Vec::new()),
            transport_factory: Box::new(transport_factory),
        }
    }

    pub fn add(&self, id: WorkerId, address: String) -> Result<(), RouterError> {
        if self.workers.contains_key(&id) {
            return Err(RouterError::AlreadyExists(id));
        }
        let transport = (self.transport_factory)(&address);
        let record = Arc::new(WorkerRecord::new(id.clone(), address, transport));
        self.workers.insert(id.clone(), record);
        self.order.lock().expect("lock poisoned").push(id.clone());
        tracing::info!(worker = %id, "worker registered");
        Ok(())
    }

    pub fn remove(&self, id: &WorkerId) {
        self.workers.remove(id);
        self.order.lock().expect("lock poisoned").retain(|w| w != id);
        tracing::info!(worker = %id, "worker removed");
    }

    pub fn exists(&self, id: &WorkerId) -> bool {
        self.workers.contains_key(id)
    }

    /// A snapshot of the live worker set in registration order. Workers
    /// added or removed between snapshot and use are a hint, not a
    /// correctness property.
    pub fn workers_in_order(&self) -> Vec<Arc<WorkerRecord>> {
        let order = self.order.lock().expect("lock poisoned");
        order
            .iter()
            .filter_map(|id| self.workers.get(id).map(|r| Arc::clone(r.value())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::NoopTransport;

    fn registry() -> WorkerRegistry {
        WorkerRegistry::new(|_addr| Arc::new(NoopTransport))
    }

    #[test]
    fn add_then_exists() {
        let reg = registry();
        reg.add(WorkerId::from("w1"), "http://localhost:9000".into())
            .unwrap();
        assert!(reg.exists(&WorkerId::from("w1")));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn duplicate_add_fails() {
        let reg = registry();
        reg.add(WorkerId::from("w1"), "http://a".into()).unwrap();
        let err = reg.add(WorkerId::from("w1"), "http://b".into()).unwrap_err();
        assert!(matches!(err, RouterError::AlreadyExists(_)));
    }

    #[test]
    fn remove_drops_worker() {
        let reg = registry();
        reg.add(WorkerId::from("w1"), "http://a".into()).unwrap();
        reg.remove(&WorkerId::from("w1"));
        assert!(!reg.exists(&WorkerId::from("w1")));
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn insertion_order_is_preserved() {
        let reg = registry();
        reg.add(WorkerId::from("w1"), "http://a".into()).unwrap();
        reg.add(WorkerId::from("w2"), "http://b".into()).unwrap();
        reg.add(WorkerId::from("w3"), "http://c".into()).unwrap();
        reg.remove(&WorkerId::from("w2"));
        reg.add(WorkerId::from("w4"), "http://d".into()).unwrap();
        let ids: Vec<_> = reg.workers_in_order().into_iter().map(|w| w.id.clone()).collect();
        assert_eq!(
            ids,
            vec![WorkerId::from("w1"), WorkerId::from("w3"), WorkerId::from("w4")]
        );
    }
}
