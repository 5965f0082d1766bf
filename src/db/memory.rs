//! In-process document database.
//!
//! Collections are kept in key order. Every mutation publishes one fresh
//! snapshot to each listener attached to the collection.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use rand::distr::Alphanumeric;
use rand::Rng;
use tokio::sync::watch;

use super::client::{
    ClientError, Document, DocumentClient, Fields, ListenEvent, ListenerRegistration,
};

/// Length of generated document keys, same as Firestore auto ids.
const AUTO_ID_LEN: usize = 20;

#[derive(Default)]
struct State {
    collections: HashMap<String, BTreeMap<String, Document>>,
    listeners: HashMap<String, Vec<(u64, watch::Sender<ListenEvent>)>>,
    offline: bool,
}

impl State {
    fn check_online(&self) -> Result<(), ClientError> {
        if self.offline {
            Err(ClientError::Unavailable("memory client is offline".into()))
        } else {
            Ok(())
        }
    }

    fn snapshot(&self, collection: &str) -> Arc<Vec<Document>> {
        Arc::new(
            self.collections
                .get(collection)
                .map(|docs| docs.values().cloned().collect())
                .unwrap_or_default(),
        )
    }

    fn publish(&mut self, collection: &str) {
        let snapshot = self.snapshot(collection);
        if let Some(listeners) = self.listeners.get_mut(collection) {
            listeners.retain(|(_, tx)| !tx.is_closed());
            for (_, tx) in listeners.iter() {
                tx.send_replace(ListenEvent::Snapshot(Arc::clone(&snapshot)));
            }
        }
    }

    fn put(&mut self, collection: &str, key: &str, fields: Fields) {
        let doc = Document {
            key: key.to_string(),
            fields,
            update_time: Some(Utc::now()),
        };
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(key.to_string(), doc);
        self.publish(collection);
    }
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    next_listener: AtomicU64,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Document database held in memory.
///
/// Clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryClient {
    inner: Arc<Inner>,
}

impl MemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores arbitrary fields under a chosen key, bypassing any schema.
    pub fn insert_raw(&self, collection: &str, key: &str, fields: Fields) {
        self.inner.lock().put(collection, key, fields);
    }

    /// While offline every call fails with [`ClientError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().offline = offline;
    }

    /// Pushes an error to every listener on a collection and drops them.
    pub fn fail_listeners(&self, collection: &str, error: ClientError) {
        let mut state = self.inner.lock();
        if let Some(listeners) = state.listeners.remove(collection) {
            for (_, tx) in listeners {
                tx.send_replace(ListenEvent::Failed(error.clone()));
            }
        }
    }

    /// Number of listeners currently attached to a collection.
    pub fn listener_count(&self, collection: &str) -> usize {
        self.inner
            .lock()
            .listeners
            .get(collection)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn generate_key() -> String {
        rand::rng()
            .sample_iter(&Alphanumeric)
            .take(AUTO_ID_LEN)
            .map(char::from)
            .collect()
    }
}

impl std::fmt::Debug for MemoryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryClient").finish_non_exhaustive()
    }
}

impl DocumentClient for MemoryClient {
    fn listen(&self, collection: &str) -> Result<ListenerRegistration, ClientError> {
        let mut state = self.inner.lock();
        state.check_online()?;

        let (tx, rx) = watch::channel(ListenEvent::Snapshot(state.snapshot(collection)));
        let listener_id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        state
            .listeners
            .entry(collection.to_string())
            .or_default()
            .push((listener_id, tx));

        let inner = Arc::clone(&self.inner);
        let collection = collection.to_string();
        Ok(ListenerRegistration::new(rx, move || {
            let mut state = inner.lock();
            if let Some(listeners) = state.listeners.get_mut(&collection) {
                listeners.retain(|(id, _)| *id != listener_id);
                if listeners.is_empty() {
                    state.listeners.remove(&collection);
                }
            }
        }))
    }

    async fn get_collection(&self, collection: &str) -> Result<Vec<Document>, ClientError> {
        let state = self.inner.lock();
        state.check_online()?;
        Ok(state.snapshot(collection).as_ref().clone())
    }

    async fn get_document(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Option<Document>, ClientError> {
        let state = self.inner.lock();
        state.check_online()?;
        Ok(state
            .collections
            .get(collection)
            .and_then(|docs| docs.get(key))
            .cloned())
    }

    async fn add_document(&self, collection: &str, fields: Fields) -> Result<String, ClientError> {
        let mut state = self.inner.lock();
        state.check_online()?;

        let mut key = Self::generate_key();
        while state
            .collections
            .get(collection)
            .is_some_and(|docs| docs.contains_key(&key))
        {
            key = Self::generate_key();
        }

        state.put(collection, &key, fields);
        Ok(key)
    }

    async fn set_document(
        &self,
        collection: &str,
        key: &str,
        fields: Fields,
    ) -> Result<(), ClientError> {
        let mut state = self.inner.lock();
        state.check_online()?;
        state.put(collection, key, fields);
        Ok(())
    }

    async fn delete_document(&self, collection: &str, key: &str) -> Result<(), ClientError> {
        let mut state = self.inner.lock();
        state.check_online()?;

        let removed = state
            .collections
            .get_mut(collection)
            .and_then(|docs| docs.remove(key))
            .is_some();
        if removed {
            state.publish(collection);
        }
        Ok(())
    }
}
