//! Static key pool with a dynamic fallback.
//!
//! Keys come from a pre-generated pool so builds stay reproducible and large
//! networks do not pay for key generation. Once the pool runs dry an optional
//! generator produces fresh pairs on a host.
//!
//! `KeyPool` is not internally synchronized: its mutating methods take
//! `&mut self`, so concurrent node tasks must share it behind a lock.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::error::KeyPoolError;
use crate::models::KeyPair;
use crate::remote::RemoteExecutor;

/// Produces a fresh key pair using a host connection.
pub type KeyGenerator = Box<
    dyn Fn(Arc<dyn RemoteExecutor>) -> BoxFuture<'static, Result<KeyPair, KeyPoolError>>
        + Send
        + Sync,
>;

pub struct KeyPool {
    private_keys: Vec<String>,
    public_keys: Vec<String>,
    index: usize,
    generator: Option<KeyGenerator>,
}

impl KeyPool {
    pub fn new(private_keys: Vec<String>, public_keys: Vec<String>) -> Result<Self, KeyPoolError> {
        if private_keys.len() != public_keys.len() {
            return Err(KeyPoolError::LengthMismatch {
                private: private_keys.len(),
                public: public_keys.len(),
            });
        }
        Ok(KeyPool {
            private_keys,
            public_keys,
            index: 0,
            generator: None,
        })
    }

    pub fn empty() -> Self {
        KeyPool {
            private_keys: Vec::new(),
            public_keys: Vec::new(),
            index: 0,
            generator: None,
        }
    }

    /// Load `<dir>/<family>/privatekeys.json` and `publickeys.json`, each a
    /// JSON array of strings. A family without a directory gets an empty pool.
    pub fn from_resource_dir(dir: &Path, family: &str) -> Result<Self, KeyPoolError> {
        let family_dir = dir.join(family);
        if !family_dir.is_dir() {
            log::debug!("no static key pool for {} under {}", family, dir.display());
            return Ok(Self::empty());
        }
        let private_keys: Vec<String> =
            serde_json::from_str(&std::fs::read_to_string(family_dir.join("privatekeys.json"))?)?;
        let public_keys: Vec<String> =
            serde_json::from_str(&std::fs::read_to_string(family_dir.join("publickeys.json"))?)?;
        log::info!("loaded {} static key pairs for {}", private_keys.len(), family);
        Self::new(private_keys, public_keys)
    }

    /// Install the generator used once the static pool is exhausted.
    pub fn with_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn(Arc<dyn RemoteExecutor>) -> BoxFuture<'static, Result<KeyPair, KeyPoolError>>
            + Send
            + Sync
            + 'static,
    {
        self.generator = Some(Box::new(generator));
        self
    }

    /// Static pairs not yet handed out.
    pub fn remaining(&self) -> usize {
        self.private_keys.len().saturating_sub(self.index)
    }

    /// Static pairs handed out so far.
    pub fn issued(&self) -> usize {
        self.index
    }

    /// Next pair from the pool, or a generated one once the pool is empty.
    pub async fn get_key_pair(&mut self, host: &Arc<dyn RemoteExecutor>) -> Result<KeyPair, KeyPoolError> {
        if self.index >= self.private_keys.len() || self.index >= self.public_keys.len() {
            return self.generate(host).await;
        }
        let pair = KeyPair {
            private_key: self.private_keys[self.index].clone(),
            public_key: self.public_keys[self.index].clone(),
        };
        self.index += 1;
        Ok(pair)
    }

    /// One key pair per identifier, in input order. Fails as a whole on the
    /// first failure.
    pub async fn get_mapped_key_pairs<S: AsRef<str>>(
        &mut self,
        ids: &[S],
        host: &Arc<dyn RemoteExecutor>,
    ) -> Result<HashMap<String, KeyPair>, KeyPoolError> {
        let mut pairs = HashMap::with_capacity(ids.len());
        for id in ids {
            let pair = self.get_key_pair(host).await.map_err(|e| {
                log::error!("key pair for {}: {}", id.as_ref(), e);
                e
            })?;
            pairs.insert(id.as_ref().to_string(), pair);
        }
        Ok(pairs)
    }

    async fn generate(&self, host: &Arc<dyn RemoteExecutor>) -> Result<KeyPair, KeyPoolError> {
        match self.generator {
            Some(ref generator) => generator(Arc::clone(host)).await,
            None => Err(KeyPoolError::NoGenerator),
        }
    }
}
