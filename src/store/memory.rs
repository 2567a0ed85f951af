//! In-memory object store.
//!
//! [`InMemoryObjectStore`] keeps payloads in a `DashMap` and tracks which
//! nodes host a copy of each one. [`evict_node`](ObjectStore::evict_node)
//! simulates losing a node: copies on it vanish, and payloads left with no
//! copy are dropped.

use std::collections::BTreeSet;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::types::{NodeId, ObjectRef};

use super::{ObjectStore, StoreError};

#[derive(Debug)]
struct StoredObject {
    data: Vec<u8>,
    locations: BTreeSet<NodeId>,
}

/// Thread-safe in-memory [`ObjectStore`].
///
/// # Examples
///
/// ```
/// use refgen::store::InMemoryObjectStore;
///
/// let store = InMemoryObjectStore::new().with_max_objects(1024);
/// assert!(store.is_empty());
/// ```
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: DashMap<ObjectRef, StoredObject>,
    max_objects: Option<usize>,
}

impl InMemoryObjectStore {
    /// Creates an empty, unbounded store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps the number of stored payloads. Puts of new ids beyond the cap
    /// fail with [`StoreError::CapacityExceeded`].
    pub fn with_max_objects(mut self, max: usize) -> Self {
        self.max_objects = Some(max);
        self
    }

    /// Returns the number of stored payloads.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Returns `true` if a payload for `id` is stored on some node.
    pub fn contains(&self, id: &ObjectRef) -> bool {
        self.objects.contains_key(id)
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, id: &ObjectRef, node: &NodeId, data: Vec<u8>) -> Result<(), StoreError> {
        if let Some(mut existing) = self.objects.get_mut(id) {
            existing.data = data;
            existing.locations.insert(node.clone());
            return Ok(());
        }

        if let Some(max) = self.max_objects {
            if self.objects.len() >= max {
                return Err(StoreError::CapacityExceeded {
                    message: format!("maximum of {max} objects reached"),
                });
            }
        }

        match self.objects.entry(*id) {
            Entry::Occupied(mut entry) => {
                let stored = entry.get_mut();
                stored.data = data;
                stored.locations.insert(node.clone());
            },
            Entry::Vacant(entry) => {
                entry.insert(StoredObject {
                    data,
                    locations: BTreeSet::from([node.clone()]),
                });
            },
        }
        Ok(())
    }

    async fn get(&self, id: &ObjectRef) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.objects.get(id).map(|stored| stored.data.clone()))
    }

    async fn release(&self, id: &ObjectRef) -> Result<bool, StoreError> {
        Ok(self.objects.remove(id).is_some())
    }

    async fn locations(&self, id: &ObjectRef) -> Result<Vec<NodeId>, StoreError> {
        Ok(self
            .objects
            .get(id)
            .map(|stored| stored.locations.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn evict_node(&self, node: &NodeId) -> Result<usize, StoreError> {
        for mut stored in self.objects.iter_mut() {
            stored.locations.remove(node);
        }
        let before = self.objects.len();
        self.objects.retain(|_, stored| !stored.locations.is_empty());
        Ok(before - self.objects.len())
    }

    async fn replicate(&self, id: &ObjectRef, node: &NodeId) -> Result<bool, StoreError> {
        match self.objects.get_mut(id) {
            Some(mut stored) => {
                stored.locations.insert(node.clone());
                Ok(true)
            },
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OwnerId, TaskId};
    use pretty_assertions::assert_eq;

    fn object(index: u32) -> ObjectRef {
        ObjectRef::output(OwnerId::new(), TaskId::new(), index)
    }

    #[tokio::test]
    async fn get_missing_returns_none() {
        let store = InMemoryObjectStore::new();
        assert_eq!(store.get(&object(0)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_then_get() {
        let store = InMemoryObjectStore::new();
        let id = object(0);
        store.put(&id, &NodeId::new("w"), b"1".to_vec()).await.unwrap();
        assert_eq!(store.get(&id).await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn put_overwrites_and_adds_location() {
        let store = InMemoryObjectStore::new();
        let id = object(0);
        store.put(&id, &NodeId::new("a"), b"1".to_vec()).await.unwrap();
        store.put(&id, &NodeId::new("b"), b"2".to_vec()).await.unwrap();

        assert_eq!(store.get(&id).await.unwrap(), Some(b"2".to_vec()));
        assert_eq!(
            store.locations(&id).await.unwrap(),
            vec![NodeId::new("a"), NodeId::new("b")]
        );
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let store = InMemoryObjectStore::new();
        let id = object(0);
        store.put(&id, &NodeId::new("a"), b"1".to_vec()).await.unwrap();
        assert!(store.release(&id).await.unwrap());
        assert!(!store.release(&id).await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn evict_node_loses_only_sole_copies() {
        let store = InMemoryObjectStore::new();
        let only_a = object(0);
        let a_and_b = object(1);
        let a = NodeId::new("a");
        let b = NodeId::new("b");
        store.put(&only_a, &a, b"x".to_vec()).await.unwrap();
        store.put(&a_and_b, &a, b"y".to_vec()).await.unwrap();
        assert!(store.replicate(&a_and_b, &b).await.unwrap());

        assert_eq!(store.evict_node(&a).await.unwrap(), 1);
        assert_eq!(store.get(&only_a).await.unwrap(), None);
        assert_eq!(store.get(&a_and_b).await.unwrap(), Some(b"y".to_vec()));
        assert_eq!(store.locations(&a_and_b).await.unwrap(), vec![b]);
    }

    #[tokio::test]
    async fn replicate_missing_returns_false() {
        let store = InMemoryObjectStore::new();
        assert!(!store.replicate(&object(0), &NodeId::new("a")).await.unwrap());
    }

    #[tokio::test]
    async fn capacity_limit_applies_to_new_ids_only() {
        let store = InMemoryObjectStore::new().with_max_objects(1);
        let first = object(0);
        let node = NodeId::new("a");
        store.put(&first, &node, b"1".to_vec()).await.unwrap();
        // Overwriting an existing id does not count against the cap
        store.put(&first, &node, b"2".to_vec()).await.unwrap();

        let err = store.put(&object(1), &node, b"3".to_vec()).await.unwrap_err();
        assert!(matches!(err, StoreError::CapacityExceeded { .. }));
    }
}
