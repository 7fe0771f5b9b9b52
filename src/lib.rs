//! Replicated CRDT sorted sets over independent clusters.
//!
//! A [`Corral`] composes N backing clusters, each already a per-key,
//! per-member last-writer-wins sorted set with score-monotonic writes, into
//! one logical store that tolerates divergence and repairs it. Writes scatter
//! to every cluster and return at a configurable quorum. Reads go through a
//! pluggable [`ReadStrategy`]; the merging strategies resolve disagreement
//! with the highest score per element and hand the losers to a [`Repairer`].
//! A background walker streams every key through the same read path at a
//! policed rate, so data nobody reads converges too.
//!
//! The crate owns no persistence, no wire protocol, and no ordering promises
//! beyond the merge rule: whichever write carries the highest score for an
//! element wins, with deletes beating inserts on an exact score tie. That
//! tiebreak is a [`Cluster`] contract prerequisite, not something enforced
//! here.
//!
//! Clusters are external collaborators behind the [`Cluster`] trait;
//! [`cluster::memory::MemoryCluster`] is a complete in-process implementation
//! for tests and local setups.
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> anyhow::Result<()> {
//! use std::sync::Arc;
//!
//! use bytes::Bytes;
//! use corral::cluster::memory::MemoryCluster;
//! use corral::{Cluster, Corral, KeyScoreMember, ReadAllMerge};
//!
//! let clusters: Vec<Arc<dyn Cluster>> = (0..3)
//!     .map(|_| Arc::new(MemoryCluster::new()) as Arc<dyn Cluster>)
//!     .collect();
//! let corral = Corral::builder(clusters)
//!     .write_quorum(2)
//!     .read_strategy(ReadAllMerge)
//!     .build()?;
//!
//! corral.insert(&[KeyScoreMember::new("visits", 1.7, "amy")]).await?;
//! let rows = corral.select(&[Bytes::from("visits")], 0, 10).await?;
//! assert_eq!(rows[&Bytes::from("visits")].len(), 1);
//! # Ok(())
//! # }
//! ```
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod cluster;
mod corral;
pub mod metrics;
pub mod police;
pub mod repair;
pub mod strategy;
pub mod tuple;
mod walker;

pub use self::cluster::{Cluster, Presence, Selection};
pub use self::corral::{Builder, ConfigError, Core, Corral, WriteError};
pub use self::metrics::{Instrumentation, Metrics, NopInstrumentation};
pub use self::police::{NopPolice, RatePolice, WindowPolice};
pub use self::repair::{CoalescingRepairer, NopRepairer, Repairer};
pub use self::strategy::{ReadAllMerge, ReadFirst, ReadOne, ReadQuorumMerge, ReadStrategy};
pub use self::tuple::{union_difference, KeyMember, KeyMemberSet, KeyScoreMember, TupleSet};
