//! Document database access.
//!
//! [`PackageRepository`] sits on top of any [`DocumentClient`]:
//! - [`FirestoreClient`]: Firestore REST API (production or emulator)
//! - [`MemoryClient`]: in-process store, used by tests and embedders

mod client;
mod derived_id;
mod error;
mod firestore;
mod memory;
mod package_repo;

pub use client::{ClientError, Document, DocumentClient, Fields, ListenEvent, ListenerRegistration};
pub use derived_id::{derive_id, IndexFollower, KeyIndex, Resolution};
pub use error::RepositoryError;
pub use firestore::FirestoreClient;
pub use memory::MemoryClient;
pub use package_repo::{PackageRepository, PACKAGE_COLLECTION};
