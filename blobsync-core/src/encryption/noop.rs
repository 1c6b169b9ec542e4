use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::storage::ObjectReader;

use super::{Encrypter, EncrypterFactory};

/// Identity encrypter used when an encryption layer is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEncrypter;

#[async_trait]
impl Encrypter for NoopEncrypter {
    async fn encrypt(&self, reader: ObjectReader) -> Result<ObjectReader> {
        Ok(reader)
    }

    async fn decrypt(&self, reader: ObjectReader) -> Result<ObjectReader> {
        Ok(reader)
    }

    fn algorithm(&self) -> &str {
        "none"
    }

    fn key_id(&self) -> &str {
        ""
    }
}

/// Factory that hands out one shared [`NoopEncrypter`] regardless of the
/// requested key id.
#[derive(Debug)]
pub struct NoopEncrypterFactory {
    encrypter: Arc<NoopEncrypter>,
}

impl NoopEncrypterFactory {
    pub fn new() -> Self {
        NoopEncrypterFactory {
            encrypter: Arc::new(NoopEncrypter),
        }
    }
}

impl Default for NoopEncrypterFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl EncrypterFactory for NoopEncrypterFactory {
    fn encrypter(&self, _key_id: &str) -> Result<Arc<dyn Encrypter>> {
        Ok(self.encrypter.clone())
    }

    fn default_key_id(&self) -> &str {
        ""
    }
}
