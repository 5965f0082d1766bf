use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;

use super::client::{ClientError, Document, DocumentClient, Fields, ListenerRegistration};
use super::derived_id::{derive_id, IndexFollower, KeyIndex, Resolution};
use super::error::RepositoryError;
use crate::models::{Package, PackageDetails};

/// Name of the collection holding package documents.
pub const PACKAGE_COLLECTION: &str = "package";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Store for lodging packages.
///
/// Packages are addressed either by their document key or by the integer id
/// derived from it (see [`derive_id`]). While a [`subscribe`](Self::subscribe)
/// stream is live, `get_by_id` resolves ids through the [`KeyIndex`] it keeps
/// current. Every other id lookup, and every write addressed by id, scans the
/// whole collection so colliding keys are always detected.
#[derive(Clone)]
pub struct PackageRepository<C> {
    client: C,
    index: Arc<KeyIndex>,
    request_timeout: Duration,
}

enum LocateError {
    Client(ClientError),
    Ambiguous(Vec<String>),
}

enum Subscription<C> {
    Idle(C),
    Listening(ListenerRegistration, Option<IndexFollower>),
    Closed,
}

fn read_error(op: &'static str, source: ClientError) -> RepositoryError {
    RepositoryError::Read {
        op,
        collection: PACKAGE_COLLECTION,
        source,
    }
}

fn write_error(op: &'static str, source: ClientError) -> RepositoryError {
    RepositoryError::Write {
        op,
        collection: PACKAGE_COLLECTION,
        source,
    }
}

fn to_package(doc: &Document) -> Option<Package> {
    match doc.parse::<PackageDetails>() {
        Ok(details) => Some(Package::from_details(derive_id(&doc.key), &doc.key, details)),
        Err(e) => {
            tracing::warn!("Skipping unparsable package document {}: {}", doc.key, e);
            None
        }
    }
}

fn to_packages(docs: &[Document]) -> Vec<Package> {
    docs.iter().filter_map(to_package).collect()
}

fn to_fields(details: &PackageDetails) -> Result<Fields, RepositoryError> {
    match serde_json::to_value(details)? {
        Value::Object(fields) => Ok(fields),
        other => Err(RepositoryError::Encode(serde::ser::Error::custom(format!(
            "expected a map, got {}",
            other
        )))),
    }
}

fn rebuild_index(index: &KeyIndex, docs: &[Document]) {
    let collisions = index.rebuild(docs.iter().map(|d| d.key.as_str()));
    for id in collisions {
        tracing::warn!("Package id {} is shared by more than one document", id);
    }
}

impl<C: DocumentClient> PackageRepository<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            index: Arc::new(KeyIndex::new()),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn index(&self) -> &KeyIndex {
        &self.index
    }

    /// Runs one database request under the configured timeout.
    async fn within<T>(
        &self,
        request: impl Future<Output = Result<T, ClientError>>,
    ) -> Result<T, ClientError> {
        tokio::time::timeout(self.request_timeout, request)
            .await
            .map_err(|_| ClientError::Timeout(self.request_timeout))?
    }

    /// Reads the whole collection and refreshes the index from it.
    async fn scan(&self) -> Result<Vec<Document>, ClientError> {
        let docs = self
            .within(self.client.get_collection(PACKAGE_COLLECTION))
            .await?;
        rebuild_index(&self.index, &docs);
        Ok(docs)
    }

    /// Finds the document whose key derives to `id`.
    ///
    /// With `use_index` set and a live subscription keeping the index current,
    /// a unique hit is read directly. Otherwise the collection is scanned.
    async fn locate(&self, id: i32, use_index: bool) -> Result<Option<Document>, LocateError> {
        if use_index && self.index.is_live() {
            match self.index.resolve(id) {
                Resolution::Ambiguous(keys) => return Err(LocateError::Ambiguous(keys)),
                Resolution::Unique(key) => {
                    let doc = self
                        .within(self.client.get_document(PACKAGE_COLLECTION, &key))
                        .await
                        .map_err(LocateError::Client)?;
                    match doc {
                        Some(doc) => return Ok(Some(doc)),
                        None => {
                            tracing::debug!("Index entry {} -> {} is stale, rescanning", id, key);
                            self.index.forget(&key);
                        }
                    }
                }
                Resolution::Unknown => {}
            }
        }

        let docs = self.scan().await.map_err(LocateError::Client)?;
        let mut matches = docs.into_iter().filter(|doc| derive_id(&doc.key) == id);
        match (matches.next(), matches.next()) {
            (None, _) => Ok(None),
            (Some(doc), None) => Ok(Some(doc)),
            (Some(first), Some(second)) => {
                let mut keys = vec![first.key, second.key];
                keys.extend(matches.map(|doc| doc.key));
                keys.sort();
                Err(LocateError::Ambiguous(keys))
            }
        }
    }

    fn locate_error(
        id: i32,
        err: LocateError,
        wrap: impl FnOnce(ClientError) -> RepositoryError,
    ) -> RepositoryError {
        match err {
            LocateError::Client(e) => wrap(e),
            LocateError::Ambiguous(keys) => RepositoryError::AmbiguousId { id, keys },
        }
    }

    /// Live view of all packages.
    ///
    /// The listener is attached when the stream is first polled. Each item is
    /// the complete current list. A listener failure is yielded once and ends
    /// the stream. Dropping the stream detaches the listener.
    ///
    /// Once the first snapshot is delivered, the index counts as live and
    /// `get_by_id` resolves through it until the stream ends.
    pub fn subscribe(&self) -> BoxStream<'static, Result<Vec<Package>, RepositoryError>> {
        let index = Arc::clone(&self.index);

        stream::unfold(Subscription::Idle(self.client.clone()), move |state| {
            let index = Arc::clone(&index);
            async move {
                let (mut registration, follower) = match state {
                    Subscription::Idle(client) => match client.listen(PACKAGE_COLLECTION) {
                        Ok(registration) => {
                            tracing::debug!("Listening to {}", PACKAGE_COLLECTION);
                            (registration, None)
                        }
                        Err(e) => {
                            return Some((
                                Err(read_error("listen to packages", e)),
                                Subscription::Closed,
                            ))
                        }
                    },
                    Subscription::Listening(registration, follower) => (registration, follower),
                    Subscription::Closed => return None,
                };

                match registration.next().await {
                    Some(Ok(docs)) => {
                        rebuild_index(&index, &docs);
                        let follower = follower.or_else(|| Some(index.follow()));
                        let packages = to_packages(&docs);
                        tracing::debug!("Package list: {} package(s)", packages.len());
                        Some((Ok(packages), Subscription::Listening(registration, follower)))
                    }
                    Some(Err(e)) => {
                        tracing::warn!("Package listener failed: {}", e);
                        Some((
                            Err(read_error("listen to packages", e)),
                            Subscription::Closed,
                        ))
                    }
                    None => None,
                }
            }
        })
        .boxed()
    }

    /// Adds a package as a new document.
    ///
    /// Returns the stored package with its assigned key and derived id.
    pub async fn create(&self, package: &Package) -> Result<Package, RepositoryError> {
        let fields = to_fields(&package.details)?;
        let key = self
            .within(self.client.add_document(PACKAGE_COLLECTION, fields))
            .await
            .map_err(|e| write_error("create package", e))?;

        let id = self.index.observe(&key);
        tracing::info!("Created package {} (key {})", id, key);
        Ok(Package::from_details(id, key, package.details.clone()))
    }

    /// Reads one package by derived id.
    ///
    /// A matching document that cannot be parsed is an error here, unlike in
    /// the list operations which skip it.
    pub async fn get_by_id(&self, id: i32) -> Result<Option<Package>, RepositoryError> {
        let doc = self
            .locate(id, true)
            .await
            .map_err(|e| Self::locate_error(id, e, |e| read_error("get package", e)))?;

        let Some(doc) = doc else {
            return Ok(None);
        };
        let details = doc.parse::<PackageDetails>().map_err(|e| {
            read_error(
                "get package",
                ClientError::Decode(format!("document {}: {}", doc.key, e)),
            )
        })?;
        Ok(Some(Package::from_details(id, doc.key, details)))
    }

    /// Point-in-time read of every package.
    pub async fn get_all(&self) -> Result<Vec<Package>, RepositoryError> {
        let docs = self
            .scan()
            .await
            .map_err(|e| read_error("get packages", e))?;
        Ok(to_packages(&docs))
    }

    /// Replaces the document addressed by `package.id` with `package`'s fields.
    pub async fn update(&self, package: &Package) -> Result<(), RepositoryError> {
        let id = package.id;
        let fields = to_fields(&package.details)?;

        let doc = self
            .locate(id, false)
            .await
            .map_err(|e| Self::locate_error(id, e, |e| write_error("update package", e)))?
            .ok_or(RepositoryError::NotFound {
                collection: PACKAGE_COLLECTION,
                id,
            })?;

        self.within(self.client.set_document(PACKAGE_COLLECTION, &doc.key, fields))
            .await
            .map_err(|e| write_error("update package", e))?;

        tracing::info!("Updated package {} (key {})", id, doc.key);
        Ok(())
    }

    pub async fn delete_by_id(&self, id: i32) -> Result<(), RepositoryError> {
        let doc = self
            .locate(id, false)
            .await
            .map_err(|e| Self::locate_error(id, e, |e| write_error("delete package", e)))?
            .ok_or(RepositoryError::NotFound {
                collection: PACKAGE_COLLECTION,
                id,
            })?;

        self.delete_by_document_key(&doc.key).await
    }

    /// Deletes a package by its native key. No lookup is needed.
    pub async fn delete_by_document_key(&self, key: &str) -> Result<(), RepositoryError> {
        self.within(self.client.delete_document(PACKAGE_COLLECTION, key))
            .await
            .map_err(|e| write_error("delete package", e))?;

        self.index.forget(key);
        tracing::info!("Deleted package {} (key {})", derive_id(key), key);
        Ok(())
    }
}
