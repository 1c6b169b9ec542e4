//! Client-side encryption seam and the identity implementation used when a
//! layer is disabled.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::storage::ObjectReader;

mod noop;
pub use noop::{NoopEncrypter, NoopEncrypterFactory};

/// Stream transform bound to one data encryption key.
#[async_trait]
pub trait Encrypter: Send + Sync {
    async fn encrypt(&self, reader: ObjectReader) -> Result<ObjectReader>;

    async fn decrypt(&self, reader: ObjectReader) -> Result<ObjectReader>;

    fn algorithm(&self) -> &str;

    fn key_id(&self) -> &str;
}

/// Hands out encrypters by key id.
///
/// Providers own key material and tear it down on `Drop`; the core never
/// sees raw keys.
pub trait EncrypterFactory: Send + Sync {
    fn encrypter(&self, key_id: &str) -> Result<Arc<dyn Encrypter>>;

    fn default_key_id(&self) -> &str;
}
