use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use blobsync_model::ObjectMetadata;

use crate::encryption::{Encrypter, EncrypterFactory};
use crate::error::Result;

use super::{ListOptions, ListResult, ObjectReader, Storage};

/// Client-side encryption wrapper around a [`Storage`].
///
/// Reads decrypt through the layer's encrypter and writes encrypt; every
/// other call delegates untouched, so listings and metadata reflect the
/// stored objects.
pub struct EncryptedStorage {
    inner: Arc<dyn Storage>,
    factory: Arc<dyn EncrypterFactory>,
}

impl EncryptedStorage {
    pub fn new(
        inner: Arc<dyn Storage>,
        factory: Arc<dyn EncrypterFactory>,
    ) -> Self {
        EncryptedStorage { inner, factory }
    }

    fn encrypter(&self) -> Result<Arc<dyn Encrypter>> {
        let key_id = self.factory.default_key_id().to_string();
        self.factory.encrypter(&key_id)
    }
}

impl fmt::Debug for EncryptedStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedStorage")
            .field("default_key_id", &self.factory.default_key_id())
            .finish()
    }
}

#[async_trait]
impl Storage for EncryptedStorage {
    async fn get(&self, key: &str) -> Result<ObjectReader> {
        let reader = self.inner.get(key).await?;
        self.encrypter()?.decrypt(reader).await
    }

    async fn put_with_metadata(
        &self,
        key: &str,
        reader: ObjectReader,
        metadata: ObjectMetadata,
    ) -> Result<()> {
        let reader = self.encrypter()?.encrypt(reader).await?;
        self.inner.put_with_metadata(key, reader, metadata).await
    }

    async fn get_metadata(&self, key: &str) -> Result<ObjectMetadata> {
        self.inner.get_metadata(key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }

    async fn list(&self, options: ListOptions) -> Result<ListResult> {
        self.inner.list(options).await
    }

    fn set_at_rest_encrypter_factory(
        &self,
        factory: Arc<dyn EncrypterFactory>,
    ) {
        self.inner.set_at_rest_encrypter_factory(factory);
    }
}
