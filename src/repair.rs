//! Read repair: pull lagging clusters up to the merged maximum.
//!
//! Repair is a hint, not a guarantee. Submissions are fire-and-forget; a
//! correction that fails is simply left for the next walker sweep to find
//! again.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, trace};

use crate::cluster::{Cluster, Presence};
use crate::metrics::Instrumentation;
use crate::tuple::{KeyMember, KeyMemberSet, KeyScoreMember};

/// Receives suspected-divergent elements and reconciles them in the
/// background.
pub trait Repairer: Send + Sync + 'static {
    /// Submit suspects. Must not block; delivery is best-effort.
    fn request_repair(&self, kms: KeyMemberSet);
}

/// Repairer that drops every submission.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopRepairer;

impl Repairer for NopRepairer {
    fn request_repair(&self, _kms: KeyMemberSet) {}
}

/// Repairer backed by a single worker task.
///
/// Concurrent submissions are drained into one deduplicated batch before any
/// cluster is contacted, so a hot element suspected by many reads at once is
/// repaired once. For each element the worker reads the current state from
/// every cluster, takes the highest score as authoritative (a delete beats an
/// insert on an exact tie), and pushes the corresponding insert or delete to
/// every cluster that is strictly behind. Errors are logged and dropped.
#[derive(Debug)]
pub struct CoalescingRepairer {
    tx: mpsc::UnboundedSender<KeyMemberSet>,
    _worker: AbortOnDropHandle<()>,
}

impl CoalescingRepairer {
    /// Spawn the worker over the given clusters.
    pub fn new(
        clusters: Vec<Arc<dyn Cluster>>,
        instrumentation: Arc<dyn Instrumentation>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker: JoinHandle<()> = tokio::spawn(run(clusters, instrumentation, rx));
        Self {
            tx,
            _worker: AbortOnDropHandle::new(worker),
        }
    }
}

impl Repairer for CoalescingRepairer {
    fn request_repair(&self, kms: KeyMemberSet) {
        if kms.is_empty() {
            return;
        }
        // Fails only when the worker is gone, which means we are shutting
        // down anyway.
        let _ = self.tx.send(kms);
    }
}

async fn run(
    clusters: Vec<Arc<dyn Cluster>>,
    instrumentation: Arc<dyn Instrumentation>,
    mut rx: mpsc::UnboundedReceiver<KeyMemberSet>,
) {
    while let Some(first) = rx.recv().await {
        let mut batch = first;
        while let Ok(more) = rx.try_recv() {
            batch.extend(more);
        }
        instrumentation.repair_request(batch.len());
        for km in batch {
            repair_one(&clusters, instrumentation.as_ref(), &km).await;
        }
    }
}

fn behind(state: Option<Presence>, authority: Presence) -> bool {
    match state {
        None => true,
        Some(current) => {
            current.score < authority.score
                || (current.score == authority.score
                    && authority.tombstone
                    && !current.tombstone)
        }
    }
}

async fn repair_one(clusters: &[Arc<dyn Cluster>], instrumentation: &dyn Instrumentation, km: &KeyMember) {
    let lookups = join_all(
        clusters
            .iter()
            .map(|cluster| cluster.score(&km.key, &km.member)),
    )
    .await;

    // Authoritative state: highest score among the replicas we could read,
    // tombstone preferred on an exact tie.
    let mut authority: Option<Presence> = None;
    for state in lookups.iter() {
        let state = match state {
            Ok(state) => *state,
            Err(err) => {
                debug!(element = %km, "repair lookup failed: {err:#}");
                continue;
            }
        };
        if let Some(candidate) = state {
            if authority.is_none() || behind(authority, candidate) {
                authority = Some(candidate);
            }
        }
    }
    let Some(authority) = authority else {
        trace!(element = %km, "nothing to repair, element unknown everywhere");
        return;
    };

    let correction = [KeyScoreMember {
        key: km.key.clone(),
        score: authority.score,
        member: km.member.clone(),
    }];
    for (cluster, state) in clusters.iter().zip(lookups) {
        let Ok(state) = state else {
            // Unknown replica state; leave it for the next sweep.
            continue;
        };
        if !behind(state, authority) {
            continue;
        }
        let pushed = if authority.tombstone {
            cluster.delete(&correction).await
        } else {
            cluster.insert(&correction).await
        };
        match pushed {
            Ok(()) => instrumentation.repair_write(),
            Err(err) => debug!(element = %km, "repair write failed: {err:#}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::Result;
    use bytes::Bytes;

    use super::*;
    use crate::cluster::memory::MemoryCluster;
    use crate::metrics::NopInstrumentation;
    use crate::tuple::KeyScoreMember;

    fn t(key: &str, score: f64, member: &str) -> KeyScoreMember {
        KeyScoreMember::new(key.as_bytes().to_vec(), score, member.as_bytes().to_vec())
    }

    fn key(key: &str) -> Bytes {
        Bytes::copy_from_slice(key.as_bytes())
    }

    fn suspects(kms: &[(&str, &str)]) -> KeyMemberSet {
        kms.iter()
            .map(|(k, m)| KeyMember::new(k.as_bytes().to_vec(), m.as_bytes().to_vec()))
            .collect()
    }

    fn trio() -> (Vec<MemoryCluster>, Vec<Arc<dyn Cluster>>) {
        let concrete: Vec<MemoryCluster> = (0..3).map(|_| MemoryCluster::new()).collect();
        let dyns = concrete
            .iter()
            .map(|c| Arc::new(c.clone()) as Arc<dyn Cluster>)
            .collect();
        (concrete, dyns)
    }

    async fn wait_for_state(cluster: &MemoryCluster, k: &str, m: &str, want: Presence) {
        for _ in 0..200 {
            if let Ok(Some(state)) = cluster.score(&key(k), &key(m)).await {
                if state == want {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("replica never reached {want:?}");
    }

    #[tokio::test]
    async fn lagging_replica_catches_up() -> Result<()> {
        let (concrete, dyns) = trio();
        concrete[0].insert(&[t("k", 5.0, "m")]).await?;
        concrete[1].insert(&[t("k", 5.0, "m")]).await?;
        concrete[2].insert(&[t("k", 1.0, "m")]).await?;

        let repairer = CoalescingRepairer::new(dyns, Arc::new(NopInstrumentation));
        repairer.request_repair(suspects(&[("k", "m")]));

        wait_for_state(
            &concrete[2],
            "k",
            "m",
            Presence {
                score: 5.0,
                tombstone: false,
            },
        )
        .await;
        Ok(())
    }

    #[tokio::test]
    async fn tombstone_authority_propagates() -> Result<()> {
        let (concrete, dyns) = trio();
        for c in &concrete {
            c.insert(&[t("k", 1.0, "m")]).await?;
        }
        concrete[0].delete(&[t("k", 2.0, "m")]).await?;

        let repairer = CoalescingRepairer::new(dyns, Arc::new(NopInstrumentation));
        repairer.request_repair(suspects(&[("k", "m")]));

        for follower in &concrete[1..] {
            wait_for_state(
                follower,
                "k",
                "m",
                Presence {
                    score: 2.0,
                    tombstone: true,
                },
            )
            .await;
        }
        Ok(())
    }

    #[tokio::test]
    async fn missing_replica_receives_state() -> Result<()> {
        let (concrete, dyns) = trio();
        concrete[0].insert(&[t("k", 3.0, "m")]).await?;

        let repairer = CoalescingRepairer::new(dyns, Arc::new(NopInstrumentation));
        repairer.request_repair(suspects(&[("k", "m")]));

        for follower in &concrete[1..] {
            wait_for_state(
                follower,
                "k",
                "m",
                Presence {
                    score: 3.0,
                    tombstone: false,
                },
            )
            .await;
        }
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_submissions_coalesce() -> Result<()> {
        let (concrete, dyns) = trio();
        concrete[0].insert(&[t("k", 1.0, "a"), t("k", 2.0, "b")]).await?;

        let repairer = CoalescingRepairer::new(dyns, Arc::new(NopInstrumentation));
        repairer.request_repair(suspects(&[("k", "a")]));
        repairer.request_repair(suspects(&[("k", "a"), ("k", "b")]));

        for (member, score) in [("a", 1.0), ("b", 2.0)] {
            wait_for_state(
                &concrete[1],
                "k",
                member,
                Presence {
                    score,
                    tombstone: false,
                },
            )
            .await;
        }
        Ok(())
    }
}
