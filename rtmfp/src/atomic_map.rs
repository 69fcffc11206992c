use std::hash::Hash;
use std::sync::{Arc, RwLock};
use rustc_hash::FxHashMap;

/// A copy-on-write map for read-mostly tables: readers get a cheap snapshot, writers replace the
///  whole map. Readers never wait for a writer's update closure.
pub struct AtomicMap<K,V> {
    map: RwLock<Arc<FxHashMap<K,V>>>,
}
impl <K: Hash+Eq+Clone+Sync+Send,V:Clone+Sync+Send> Default for AtomicMap<K,V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash+Eq+Clone+Sync+Send, V:Clone+Sync+Send> AtomicMap<K,V> {
    pub fn new() -> AtomicMap<K,V> {
        AtomicMap {
            map: RwLock::new(Arc::new(FxHashMap::default())),
        }
    }

    pub fn load(&self) -> Arc<FxHashMap<K,V>> {
        self.map.read().unwrap().clone()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.map.read().unwrap()
            .get(key)
            .cloned()
    }

    pub fn update<T>(&self, f: impl FnOnce(&mut FxHashMap<K,V>) -> T) -> T {
        let mut guard = self.map.write().unwrap();
        let mut map: FxHashMap<K,V> = (**guard).clone();
        let result = f(&mut map);
        *guard = Arc::new(map);
        result
    }
}
