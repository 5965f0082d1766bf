//! The document database seam.
//!
//! [`DocumentClient`] is everything the package store needs from a backend:
//! whole-collection reads, single-document reads, writes addressed by key and
//! a standing listener that publishes full collection snapshots.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::watch;

/// Field map of a stored document.
pub type Fields = Map<String, Value>;

/// Errors reported by a document database backend.
///
/// Cloneable so a failed listener can hand the same error to its snapshot
/// channel.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    #[error("Database unavailable: {0}")]
    Unavailable(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Database returned status {code}: {message}")]
    Status { code: u16, message: String },

    #[error("Invalid response: {0}")]
    Decode(String),

    #[error("Cannot encode document: {0}")]
    Encode(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Listener closed")]
    ListenerClosed,
}

/// One document read from a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Native key, unique within the collection.
    pub key: String,
    pub fields: Fields,
    /// Last write time, when the backend reports one.
    pub update_time: Option<DateTime<Utc>>,
}

impl Document {
    pub fn new(key: impl Into<String>, fields: Fields) -> Self {
        Self {
            key: key.into(),
            fields,
            update_time: None,
        }
    }

    /// Deserializes the document's fields into a domain type.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.fields.clone()))
    }
}

/// State published on a listener channel.
#[derive(Debug, Clone)]
pub enum ListenEvent {
    /// Attached, first snapshot not received yet.
    Pending,
    Snapshot(Arc<Vec<Document>>),
    Failed(ClientError),
}

/// A standing collection listener.
///
/// Only the most recent event is kept: a consumer that falls behind skips
/// straight to the newest snapshot. The listener is detached when this value
/// is dropped or [`ListenerRegistration::detach`] is called.
pub struct ListenerRegistration {
    rx: watch::Receiver<ListenEvent>,
    primed: bool,
    finished: bool,
    on_detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ListenerRegistration {
    pub fn new(
        rx: watch::Receiver<ListenEvent>,
        on_detach: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            rx,
            primed: false,
            finished: false,
            on_detach: Some(Box::new(on_detach)),
        }
    }

    /// Waits for the next snapshot.
    ///
    /// Returns `None` once the backend side has gone away or after an error
    /// has been delivered.
    pub async fn next(&mut self) -> Option<Result<Vec<Document>, ClientError>> {
        if self.finished {
            return None;
        }

        loop {
            if self.primed {
                if self.rx.changed().await.is_err() {
                    self.finished = true;
                    return None;
                }
            } else {
                self.primed = true;
            }

            let event = self.rx.borrow_and_update().clone();
            match event {
                ListenEvent::Pending => continue,
                ListenEvent::Snapshot(docs) => return Some(Ok(docs.as_ref().clone())),
                ListenEvent::Failed(err) => {
                    self.finished = true;
                    return Some(Err(err));
                }
            }
        }
    }

    /// Detaches the listener from the backend.
    pub fn detach(mut self) {
        self.run_detach();
    }

    fn run_detach(&mut self) {
        if let Some(on_detach) = self.on_detach.take() {
            on_detach();
        }
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.run_detach();
    }
}

impl std::fmt::Debug for ListenerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistration")
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

/// Backend operations used by the package store.
pub trait DocumentClient: Clone + Send + Sync + 'static {
    /// Attaches a listener to a whole collection.
    fn listen(&self, collection: &str) -> Result<ListenerRegistration, ClientError>;

    /// Reads every document in a collection.
    fn get_collection(
        &self,
        collection: &str,
    ) -> impl Future<Output = Result<Vec<Document>, ClientError>> + Send;

    /// Reads one document. `Ok(None)` if the key does not exist.
    fn get_document(
        &self,
        collection: &str,
        key: &str,
    ) -> impl Future<Output = Result<Option<Document>, ClientError>> + Send;

    /// Adds a document and returns the key the database assigned to it.
    fn add_document(
        &self,
        collection: &str,
        fields: Fields,
    ) -> impl Future<Output = Result<String, ClientError>> + Send;

    /// Replaces a document's entire content.
    fn set_document(
        &self,
        collection: &str,
        key: &str,
        fields: Fields,
    ) -> impl Future<Output = Result<(), ClientError>> + Send;

    fn delete_document(
        &self,
        collection: &str,
        key: &str,
    ) -> impl Future<Output = Result<(), ClientError>> + Send;
}
