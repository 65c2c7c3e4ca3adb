use std::sync::Arc;

use dashmap::DashMap;

use super::SlurmClient;
use crate::api::ObjectKey;

/// Scheduler clients keyed by the controller object they talk to.
#[derive(Default)]
pub struct ClientMap {
    clients: DashMap<ObjectKey, Arc<dyn SlurmClient>>,
}

impl ClientMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, key: ObjectKey, client: Arc<dyn SlurmClient>) {
        self.clients.insert(key, client);
    }

    pub fn remove(&self, key: &ObjectKey) -> bool {
        self.clients.remove(key).is_some()
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<dyn SlurmClient>> {
        self.clients.get(key).map(|c| Arc::clone(c.value()))
    }

    pub fn has(&self, key: &ObjectKey) -> bool {
        self.clients.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slurm::fake::FakeClient;

    #[test]
    fn test_client_map() {
        let map = ClientMap::new();
        let key = ObjectKey::new("slurm", "slurm");
        assert!(map.get(&key).is_none());

        map.add(key.clone(), Arc::new(FakeClient::new()));
        assert!(map.has(&key));
        assert_eq!(map.len(), 1);

        assert!(map.remove(&key));
        assert!(map.is_empty());
    }
}
