//! Typed access to one codec's values in a [`Kv`].

use std::{future::Future, marker::PhantomData, sync::Arc};

use tracing::warn;

use crate::{
    codec::Codec,
    error::{KvError, KvResult},
    kv::{CasFnError, Kv},
    mergeable::{Merge, Mergeable},
};

fn downcast<T: Merge>(key: &str, value: Box<dyn Mergeable>) -> KvResult<T> {
    value
        .into_any()
        .downcast::<T>()
        .map(|v| *v)
        .map_err(|_| KvError::UnexpectedType {
            key: key.to_string(),
            expected: std::any::type_name::<T>(),
        })
}

/// Client bound to a single value type and its codec.
pub struct Client<T> {
    kv: Arc<Kv>,
    codec: Arc<dyn Codec>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Client<T> {
    fn clone(&self) -> Self {
        Self {
            kv: self.kv.clone(),
            codec: self.codec.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Client<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("codec", &self.codec.codec_id())
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T: Merge> Client<T> {
    /// Fails if `codec_id` is not registered with the store.
    pub fn new(kv: Arc<Kv>, codec_id: &str) -> KvResult<Self> {
        let codec = kv
            .codec(codec_id)
            .ok_or_else(|| KvError::CodecNotFound(codec_id.to_string()))?;
        Ok(Self {
            kv,
            codec,
            _marker: PhantomData,
        })
    }

    pub fn kv(&self) -> &Arc<Kv> {
        &self.kv
    }

    pub fn list(&self, prefix: &str) -> Vec<String> {
        self.kv.list(prefix)
    }

    pub fn get(&self, key: &str) -> KvResult<Option<T>> {
        self.kv.get(key).map(|v| downcast(key, v)).transpose()
    }

    pub fn delete(&self, key: &str) -> KvResult<()> {
        self.kv.delete(key)
    }

    /// Typed [`Kv::cas`]. A stored value of another type aborts the update.
    pub async fn cas<F>(&self, key: &str, mut f: F) -> KvResult<()>
    where
        F: FnMut(Option<T>) -> Result<Option<T>, CasFnError> + Send,
    {
        self.kv
            .cas(key, &self.codec, |current| {
                let current = current
                    .map(|v| downcast::<T>(key, v))
                    .transpose()
                    .map_err(CasFnError::abort)?;
                Ok(f(current)?.map(|v| Box::new(v) as Box<dyn Mergeable>))
            })
            .await
    }

    pub async fn watch_key<C, F>(&self, key: &str, cancel: C, mut f: F)
    where
        C: Future<Output = ()>,
        F: FnMut(T) -> bool,
    {
        self.kv
            .watch_key(key, cancel, |value| match downcast::<T>(key, value) {
                Ok(value) => f(value),
                Err(e) => {
                    warn!(error = %e, "Skipping watched value");
                    true
                }
            })
            .await
    }

    pub async fn watch_prefix<C, F>(&self, prefix: &str, cancel: C, mut f: F)
    where
        C: Future<Output = ()>,
        F: FnMut(&str, T) -> bool,
    {
        self.kv
            .watch_prefix(prefix, cancel, |key, value| match downcast::<T>(key, value) {
                Ok(value) => f(key, value),
                Err(e) => {
                    warn!(error = %e, "Skipping watched value");
                    true
                }
            })
            .await
    }
}
