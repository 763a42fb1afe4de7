//! Merge contract for values stored in the KV store.
//!
//! Value types implement the typed [`Merge`] trait. The store itself keeps
//! values of many codecs side by side, so it works with the object-safe
//! [`Mergeable`] trait, which every [`Merge`] type gets for free.

use std::{any::Any, fmt};

use chrono::{DateTime, Utc};

use crate::error::MergeError;

/// CRDT-style merge semantics for a concrete value type.
///
/// Outside of local CAS mode `merge` must be idempotent, commutative and
/// associative: any two replicas that merged the same multiset of values
/// converge to the same state.
pub trait Merge: Clone + fmt::Debug + Send + Sync + 'static {
    /// Merges `other` into `self` in place.
    ///
    /// Returns the part of `other` that changed `self`, or `None` when the
    /// merge was a no-op. With `local_cas` set, the implementation may also
    /// record entries present in `self` but missing from `other` as
    /// tombstones, since `other` is the complete new state computed by a
    /// local CAS function.
    fn merge(&mut self, other: &Self, local_cas: bool) -> Result<Option<Self>, MergeError>;

    /// Descriptors of what this value contains. Used to detect whether one
    /// queued change subsumes another.
    fn merge_content(&self) -> Vec<String>;

    /// Removes tombstones older than `limit`, or all of them when `limit` is
    /// `None`. Returns `(total tombstones, removed tombstones)`.
    fn remove_tombstones(&mut self, limit: Option<DateTime<Utc>>) -> (usize, usize);
}

/// Object-safe view of a [`Merge`] value.
pub trait Mergeable: Any + Send + Sync + fmt::Debug {
    fn merge(
        &mut self,
        other: &dyn Mergeable,
        local_cas: bool,
    ) -> Result<Option<Box<dyn Mergeable>>, MergeError>;

    fn merge_content(&self) -> Vec<String>;

    fn remove_tombstones(&mut self, limit: Option<DateTime<Utc>>) -> (usize, usize);

    fn clone_value(&self) -> Box<dyn Mergeable>;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync>;

    fn type_name(&self) -> &'static str;
}

impl<T: Merge> Mergeable for T {
    fn merge(
        &mut self,
        other: &dyn Mergeable,
        local_cas: bool,
    ) -> Result<Option<Box<dyn Mergeable>>, MergeError> {
        let other = other
            .as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| MergeError::TypeMismatch {
                current: std::any::type_name::<T>(),
                incoming: other.type_name(),
            })?;
        let change = Merge::merge(self, other, local_cas)?;
        Ok(change.map(|c| Box::new(c) as Box<dyn Mergeable>))
    }

    fn merge_content(&self) -> Vec<String> {
        Merge::merge_content(self)
    }

    fn remove_tombstones(&mut self, limit: Option<DateTime<Utc>>) -> (usize, usize) {
        Merge::remove_tombstones(self, limit)
    }

    fn clone_value(&self) -> Box<dyn Mergeable> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

impl Clone for Box<dyn Mergeable> {
    fn clone(&self) -> Self {
        self.clone_value()
    }
}
