//! Homestay Package Store
//!
//! Data access for lodging packages kept in a document database collection.

pub mod config;
pub mod db;
pub mod models;

pub use config::{Config, ConfigError, ConfigSource, ConfigValue, FirestoreConfig};
pub use db::{
    derive_id, ClientError, Document, DocumentClient, FirestoreClient, KeyIndex,
    ListenerRegistration, MemoryClient, PackageRepository, RepositoryError, Resolution,
    PACKAGE_COLLECTION,
};
pub use models::Package;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
