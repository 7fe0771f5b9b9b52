//! The contract each backing cluster implements.
//!
//! A cluster is an external collaborator that already provides a per-key,
//! per-member last-writer-wins sorted set. Transport, timeouts, and the local
//! encoding are its business; everything surfaces here as an opaque
//! [`anyhow::Error`].

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::tuple::KeyScoreMember;

pub mod memory;

/// Per-key responses: each requested key maps to its tuples in canonical
/// order, at most `limit` per key.
pub type Selection = HashMap<Bytes, Vec<KeyScoreMember>>;

/// Point-lookup state for a (key, member) pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Presence {
    /// Score of the latest accepted write, insert or delete.
    pub score: f64,
    /// Whether that write was a delete.
    pub tombstone: bool,
}

/// Operations a backing cluster must provide.
///
/// Writes are score-monotonic: a cluster that acknowledged a write at score
/// `s` never regresses `(key, member)` below `s`. On an exact score tie
/// between an insert and a delete, the delete must win. That tiebreak is not
/// enforced here; a cluster breaking it the other way will be handed the same
/// correction on every repair pass for the affected element.
///
/// Batched operations fail as a whole with an opaque transport error, never
/// per tuple.
#[async_trait]
pub trait Cluster: Send + Sync + 'static {
    /// Apply a batch of inserts, each subject to the score-monotonicity rule.
    async fn insert(&self, tuples: &[KeyScoreMember]) -> Result<()>;

    /// Apply a batch of deletes. A delete is a tombstone at the given score.
    async fn delete(&self, tuples: &[KeyScoreMember]) -> Result<()>;

    /// Return up to `limit` live tuples per requested key, starting at
    /// `offset`, in canonical order.
    async fn select(&self, keys: &[Bytes], offset: usize, limit: usize) -> Result<Selection>;

    /// Point lookup of the current state for one element, tombstones
    /// included.
    async fn score(&self, key: &Bytes, member: &Bytes) -> Result<Option<Presence>>;

    /// Enumerate every live key exactly once, in arbitrary order. The stream
    /// ends when the pass completes.
    fn keys(&self) -> BoxStream<'static, Result<Bytes>>;
}
