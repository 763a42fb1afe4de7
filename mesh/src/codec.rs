//! Value codecs.
//!
//! A codec turns a [`Mergeable`] into bytes and back. Every key in the store
//! remembers the id of the codec it was written with, and every gossiped
//! key/value pair carries that id so the receiver can decode it.

use std::{collections::HashMap, fmt, marker::PhantomData, sync::Arc};

use serde::{de::DeserializeOwned, Serialize};

use crate::{
    error::CodecError,
    mergeable::{Merge, Mergeable},
};

pub trait Codec: Send + Sync + fmt::Debug {
    /// Stable identifier sent on the wire next to encoded values.
    fn codec_id(&self) -> &str;

    fn decode(&self, bytes: &[u8]) -> Result<Box<dyn Mergeable>, CodecError>;

    fn encode(&self, value: &dyn Mergeable) -> Result<Vec<u8>, CodecError>;
}

/// Bincode codec for any serde-serializable [`Merge`] type.
pub struct BincodeCodec<T> {
    id: String,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> BincodeCodec<T> {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            _phantom: PhantomData,
        }
    }
}

impl<T> fmt::Debug for BincodeCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BincodeCodec")
            .field("id", &self.id)
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T> Codec for BincodeCodec<T>
where
    T: Merge + Serialize + DeserializeOwned,
{
    fn codec_id(&self) -> &str {
        &self.id
    }

    fn decode(&self, bytes: &[u8]) -> Result<Box<dyn Mergeable>, CodecError> {
        let value: T = bincode::deserialize(bytes).map_err(|source| CodecError::Bincode {
            codec: self.id.clone(),
            source,
        })?;
        Ok(Box::new(value))
    }

    fn encode(&self, value: &dyn Mergeable) -> Result<Vec<u8>, CodecError> {
        let typed = value
            .as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| CodecError::WrongType {
                codec: self.id.clone(),
                type_name: value.type_name(),
            })?;
        bincode::serialize(typed).map_err(|source| CodecError::Bincode {
            codec: self.id.clone(),
            source,
        })
    }
}

/// Codecs known to a store, by id.
#[derive(Debug, Clone, Default)]
pub struct CodecRegistry {
    codecs: HashMap<String, Arc<dyn Codec>>,
}

impl CodecRegistry {
    pub fn new(codecs: &[Arc<dyn Codec>]) -> Self {
        Self {
            codecs: codecs
                .iter()
                .map(|c| (c.codec_id().to_string(), c.clone()))
                .collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Codec>> {
        self.codecs.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_utils::{member, TestRing};

    #[test]
    fn test_bincode_codec_roundtrip_keeps_members() {
        let codec = BincodeCodec::<TestRing>::new("ring");
        let ring = TestRing::with(&[member("a", 10), member("b", 20)]);

        let bytes = codec.encode(&ring).unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        let decoded = decoded.as_any().downcast_ref::<TestRing>().unwrap();
        assert_eq!(decoded, &ring);
    }

    #[test]
    fn test_bincode_codec_rejects_foreign_type() {
        #[derive(Debug, Clone, Serialize, serde::Deserialize)]
        struct Foreign;

        impl Merge for Foreign {
            fn merge(
                &mut self,
                _: &Self,
                _: bool,
            ) -> Result<Option<Self>, crate::error::MergeError> {
                Ok(None)
            }
            fn merge_content(&self) -> Vec<String> {
                Vec::new()
            }
            fn remove_tombstones(
                &mut self,
                _: Option<chrono::DateTime<chrono::Utc>>,
            ) -> (usize, usize) {
                (0, 0)
            }
        }

        let codec = BincodeCodec::<TestRing>::new("ring");
        assert!(matches!(
            codec.encode(&Foreign),
            Err(CodecError::WrongType { .. })
        ));
        assert!(codec.decode(&[0xff, 0xff]).is_err());
    }

    #[test]
    fn test_registry_lookup_by_id() {
        let codec: Arc<dyn Codec> = Arc::new(BincodeCodec::<TestRing>::new("ring"));
        let registry = CodecRegistry::new(&[codec]);
        assert_eq!(registry.len(), 1);
        assert!(registry.get("ring").is_some());
        assert!(registry.get("other").is_none());
    }
}
