//! Blob-store seam consumed by the replication core.
//!
//! Real backends (local disk, S3-compatible stores, archives) live outside
//! this crate; the core only consumes these capability traits.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use blobsync_model::ObjectMetadata;

use crate::encryption::EncrypterFactory;
use crate::error::Result;

pub mod encrypted;
pub use encrypted::EncryptedStorage;

/// Streaming object payload handed across the storage seam.
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

/// Options for one page of a listing.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub prefix: String,
    pub max_results: usize,
    pub continue_from: Option<String>,
}

/// One listed object.
#[derive(Debug, Clone)]
pub struct ObjectEntry {
    pub key: String,
    pub metadata: ObjectMetadata,
}

/// One page of a listing.
#[derive(Debug, Clone, Default)]
pub struct ListResult {
    pub objects: Vec<ObjectEntry>,
    pub truncated: bool,
    pub next_token: Option<String>,
}

/// Capability set offered by a blob-store backend.
///
/// All calls are cancelled by dropping the returned future; timeouts are the
/// backend's responsibility.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Opens a streaming read of the object payload.
    async fn get(&self, key: &str) -> Result<ObjectReader>;

    /// Streams `reader` into the object, replacing any existing payload, and
    /// stores `metadata` alongside it.
    async fn put_with_metadata(
        &self,
        key: &str,
        reader: ObjectReader,
        metadata: ObjectMetadata,
    ) -> Result<()>;

    async fn get_metadata(&self, key: &str) -> Result<ObjectMetadata>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Lists objects under `options.prefix`, one page per call.
    async fn list(&self, options: ListOptions) -> Result<ListResult>;

    /// Installs the at-rest encryption factory on backends that support it.
    ///
    /// Only the `"local"` backend implements this hook; every other backend
    /// keeps this default no-op, so a backend-layer encryption policy on a
    /// remote backend is silently skipped.
    fn set_at_rest_encrypter_factory(
        &self,
        _factory: Arc<dyn EncrypterFactory>,
    ) {
    }
}

/// Builds storage backends from a policy's backend tag and opaque settings.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn create(
        &self,
        backend: &str,
        settings: &HashMap<String, String>,
    ) -> Result<Arc<dyn Storage>>;
}
