//! In-memory cluster with last-writer-wins sorted-set semantics.
//!
//! Backs tests and local setups the same way a remote cluster would: inserts
//! and deletes only apply when they carry a higher score than what is stored,
//! deletes win exact score ties, and tombstones shadow elements from reads
//! without being dropped.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;

use super::{Cluster, Presence, Selection};
use crate::tuple::KeyScoreMember;

#[derive(Debug, Clone, Copy)]
struct Row {
    score: f64,
    tombstone: bool,
}

/// An in-memory [`Cluster`].
///
/// Cheap to clone; clones share the same underlying map.
#[derive(Debug, Default, Clone)]
pub struct MemoryCluster {
    rows: Arc<RwLock<HashMap<Bytes, HashMap<Bytes, Row>>>>,
}

impl MemoryCluster {
    /// Create an empty cluster.
    pub fn new() -> Self {
        Self::default()
    }

    fn apply(&self, tuples: &[KeyScoreMember], tombstone: bool) {
        let mut rows = self.rows.write();
        for tuple in tuples {
            let members = rows.entry(tuple.key.clone()).or_default();
            let apply = match members.get(&tuple.member) {
                None => true,
                Some(current) => {
                    tuple.score > current.score
                        || (tuple.score == current.score && tombstone && !current.tombstone)
                }
            };
            if apply {
                members.insert(
                    tuple.member.clone(),
                    Row {
                        score: tuple.score,
                        tombstone,
                    },
                );
            }
        }
    }
}

#[async_trait]
impl Cluster for MemoryCluster {
    async fn insert(&self, tuples: &[KeyScoreMember]) -> Result<()> {
        self.apply(tuples, false);
        Ok(())
    }

    async fn delete(&self, tuples: &[KeyScoreMember]) -> Result<()> {
        self.apply(tuples, true);
        Ok(())
    }

    async fn select(&self, keys: &[Bytes], offset: usize, limit: usize) -> Result<Selection> {
        let rows = self.rows.read();
        let mut out = Selection::with_capacity(keys.len());
        for key in keys {
            let mut live: Vec<KeyScoreMember> = rows
                .get(key)
                .into_iter()
                .flatten()
                .filter(|(_, row)| !row.tombstone)
                .map(|(member, row)| KeyScoreMember {
                    key: key.clone(),
                    score: row.score,
                    member: member.clone(),
                })
                .collect();
            live.sort_unstable();
            out.insert(
                key.clone(),
                live.into_iter().skip(offset).take(limit).collect(),
            );
        }
        Ok(out)
    }

    async fn score(&self, key: &Bytes, member: &Bytes) -> Result<Option<Presence>> {
        let rows = self.rows.read();
        Ok(rows.get(key).and_then(|members| {
            members.get(member).map(|row| Presence {
                score: row.score,
                tombstone: row.tombstone,
            })
        }))
    }

    fn keys(&self) -> BoxStream<'static, Result<Bytes>> {
        // Keys inserted after this snapshot show up on the next pass.
        let live: Vec<Bytes> = self
            .rows
            .read()
            .iter()
            .filter(|(_, members)| members.values().any(|row| !row.tombstone))
            .map(|(key, _)| key.clone())
            .collect();
        stream::iter(live.into_iter().map(Ok)).boxed()
    }
}
