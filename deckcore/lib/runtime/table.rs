use std::{
    collections::{hash_map::DefaultHasher, HashMap},
    hash::{Hash, Hasher},
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default number of shards in a [`ProcessTable`].
pub const DEFAULT_TABLE_SHARDS: usize = 16;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A concurrent map from process id to process handle.
///
/// Keys are spread over independently locked shards. Every operation takes exactly one shard
/// lock and releases it before returning, so callers need no locking of their own and may use
/// the table from any number of tasks. No lock is ever held across an `.await`.
///
/// [`ProcessTable::remove`] hands the value to exactly one caller: concurrent removals of the
/// same id see `Some` at most once.
#[derive(Debug)]
pub struct ProcessTable<V> {
    shards: Vec<RwLock<HashMap<String, V>>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl<V: Clone> ProcessTable<V> {
    /// Creates a table with [`DEFAULT_TABLE_SHARDS`] shards.
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_TABLE_SHARDS)
    }

    /// Creates a table with the given number of shards (at least one).
    pub fn with_shards(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1))
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
        }
    }

    /// Inserts `value` under `id` unless the id is already present. Returns whether it was
    /// inserted.
    pub fn insert(&self, id: impl Into<String>, value: V) -> bool {
        let id = id.into();
        let mut shard = self.write(&id);
        if shard.contains_key(&id) {
            return false;
        }
        shard.insert(id, value);
        true
    }

    /// Returns a clone of the value stored under `id`.
    pub fn get(&self, id: &str) -> Option<V> {
        self.read(id).get(id).cloned()
    }

    /// Removes and returns the value stored under `id`.
    pub fn remove(&self, id: &str) -> Option<V> {
        self.write(id).remove(id)
    }

    /// Whether `id` is present.
    pub fn contains(&self, id: &str) -> bool {
        self.read(id).contains_key(id)
    }

    /// The number of entries across all shards.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.read().unwrap_or_else(|e| e.into_inner()).len())
            .sum()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A snapshot of all ids.
    pub fn ids(&self) -> Vec<String> {
        self.shards
            .iter()
            .flat_map(|shard| {
                shard
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    fn shard_index(&self, id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    // A panic while a shard was locked cannot leave a HashMap half-updated, so poisoning is
    // ignored.
    fn read(&self, id: &str) -> RwLockReadGuard<'_, HashMap<String, V>> {
        self.shards[self.shard_index(id)]
            .read()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self, id: &str) -> RwLockWriteGuard<'_, HashMap<String, V>> {
        self.shards[self.shard_index(id)]
            .write()
            .unwrap_or_else(|e| e.into_inner())
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl<V: Clone> Default for ProcessTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let table = ProcessTable::new();

        assert!(table.insert("1700000000000-42", 42u32));
        assert!(!table.insert("1700000000000-42", 43u32));
        assert_eq!(table.get("1700000000000-42"), Some(42));
        assert_eq!(table.len(), 1);

        assert_eq!(table.remove("1700000000000-42"), Some(42));
        assert_eq!(table.remove("1700000000000-42"), None);
        assert!(table.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_removal_yields_value_once() {
        let table = Arc::new(ProcessTable::with_shards(4));
        for i in 0..64 {
            table.insert(format!("p-{i}"), i);
        }

        let removed = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let table = Arc::clone(&table);
            let removed = Arc::clone(&removed);
            handles.push(tokio::spawn(async move {
                for i in 0..64 {
                    if table.remove(&format!("p-{i}")).is_some() {
                        removed.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(removed.load(Ordering::SeqCst), 64);
        assert!(table.is_empty());
    }

    #[test]
    fn test_ids_spans_all_shards() {
        let table = ProcessTable::with_shards(3);
        for i in 0..10 {
            table.insert(i.to_string(), ());
        }

        let mut ids = table.ids();
        ids.sort();
        assert_eq!(ids.len(), 10);
        assert!(table.contains("7"));
    }
}
