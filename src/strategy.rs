//! Pluggable read policies.
//!
//! Every strategy satisfies the same select contract and differs only in how
//! many clusters it asks, when it returns, and whether it feeds the repairer.
//! Merging strategies fetch `offset + limit` tuples per replica so the window
//! they return is the window of the union, not a union of pre-cut windows;
//! divergence outside that window is left for the walker to find.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use crate::cluster::{Cluster, Selection};
use crate::corral::{ConfigError, Core};
use crate::tuple::{union_difference, KeyMemberSet, TupleSet};

/// A read policy with closure over the coordinator's clusters and repairer.
#[async_trait]
pub trait ReadStrategy: Send + Sync + 'static {
    /// Check the strategy against the cluster count at build time.
    fn validate(&self, _clusters: usize) -> Result<(), ConfigError> {
        Ok(())
    }

    /// Serve one select call.
    async fn select(
        &self,
        core: &Core,
        keys: &[Bytes],
        offset: usize,
        limit: usize,
    ) -> Result<Selection>;
}

/// Ask a single cluster, round robin, and return its answer verbatim.
///
/// Lowest latency, no divergence detection, no repair.
#[derive(Debug)]
pub struct ReadOne {
    next: AtomicUsize,
}

impl ReadOne {
    /// Create the strategy with a random starting cluster.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for ReadOne {
    fn default() -> Self {
        Self {
            next: AtomicUsize::new(rand::thread_rng().gen()),
        }
    }
}

#[async_trait]
impl ReadStrategy for ReadOne {
    async fn select(
        &self,
        core: &Core,
        keys: &[Bytes],
        offset: usize,
        limit: usize,
    ) -> Result<Selection> {
        let clusters = core.clusters();
        let turn = self.next.fetch_add(1, Ordering::Relaxed) % clusters.len();
        clusters[turn].select(keys, offset, limit).await
    }
}

/// Ask every cluster, wait for all of them, and return the merged window.
///
/// Clusters that fail are skipped with a warning as long as at least one
/// answers. Divergence inside the returned window is submitted for repair.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReadAllMerge;

#[async_trait]
impl ReadStrategy for ReadAllMerge {
    async fn select(
        &self,
        core: &Core,
        keys: &[Bytes],
        offset: usize,
        limit: usize,
    ) -> Result<Selection> {
        let clusters = core.clusters();
        let mut rx = scatter_selects(clusters, keys, offset.saturating_add(limit));
        let mut responses = Vec::with_capacity(clusters.len());
        while let Some(res) = rx.recv().await {
            match res {
                Ok(selection) => responses.push(selection),
                Err(err) => warn!("cluster read failed: {err:#}"),
            }
        }
        if responses.is_empty() {
            return Err(anyhow!("all {} clusters failed to select", clusters.len()));
        }

        let merged = merge_responses(keys, &responses, offset, limit);
        if !merged.divergent.is_empty() {
            core.repairer().request_repair(merged.divergent);
        }
        Ok(merged.selection)
    }
}

/// Ask every cluster but return as soon as a read quorum has answered.
///
/// Errors if fewer clusters than the quorum answer at all. Responses landing
/// after the quorum but before `linger` expires still extend the repair set;
/// they never change the returned window.
#[derive(Debug, Clone, Copy)]
pub struct ReadQuorumMerge {
    read_quorum: usize,
    linger: Duration,
}

impl ReadQuorumMerge {
    /// Strategy returning after `read_quorum` responses, lingering 100ms for
    /// stragglers.
    pub fn new(read_quorum: usize) -> Self {
        Self {
            read_quorum,
            linger: Duration::from_millis(100),
        }
    }

    /// How long to keep collecting late responses for repair purposes.
    pub fn with_linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }
}

#[async_trait]
impl ReadStrategy for ReadQuorumMerge {
    fn validate(&self, clusters: usize) -> Result<(), ConfigError> {
        if self.read_quorum == 0 || self.read_quorum > clusters {
            return Err(ConfigError::ReadQuorum {
                quorum: self.read_quorum,
                clusters,
            });
        }
        Ok(())
    }

    async fn select(
        &self,
        core: &Core,
        keys: &[Bytes],
        offset: usize,
        limit: usize,
    ) -> Result<Selection> {
        let clusters = core.clusters();
        let mut rx = scatter_selects(clusters, keys, offset.saturating_add(limit));
        let mut responses = Vec::with_capacity(clusters.len());
        while responses.len() < self.read_quorum {
            match rx.recv().await {
                Some(Ok(selection)) => responses.push(selection),
                Some(Err(err)) => warn!("cluster read failed: {err:#}"),
                None => break,
            }
        }
        if responses.len() < self.read_quorum {
            return Err(anyhow!(
                "read quorum not reached ({} of {} clusters answered)",
                responses.len(),
                self.read_quorum
            ));
        }

        let merged = merge_responses(keys, &responses, offset, limit);
        if !merged.divergent.is_empty() {
            core.repairer().request_repair(merged.divergent);
        }

        // Stragglers extend the repair set until the linger deadline; the
        // answer below is already fixed.
        let repairer = core.repairer_handle();
        let keys = keys.to_vec();
        let linger = self.linger;
        tokio::spawn(async move {
            let deadline = Instant::now() + linger;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match timeout(remaining, rx.recv()).await {
                    Ok(Some(Ok(selection))) => {
                        responses.push(selection);
                        let merged = merge_responses(&keys, &responses, offset, limit);
                        if !merged.divergent.is_empty() {
                            repairer.request_repair(merged.divergent);
                        }
                    }
                    Ok(Some(Err(_))) => {}
                    Ok(None) | Err(_) => break,
                }
            }
        });

        Ok(merged.selection)
    }
}

/// Probe clusters one after another and return the first answer.
///
/// No merge, no repair. Errors only when every cluster fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReadFirst;

#[async_trait]
impl ReadStrategy for ReadFirst {
    async fn select(
        &self,
        core: &Core,
        keys: &[Bytes],
        offset: usize,
        limit: usize,
    ) -> Result<Selection> {
        let mut last = None;
        for cluster in core.clusters() {
            match cluster.select(keys, offset, limit).await {
                Ok(selection) => return Ok(selection),
                Err(err) => {
                    debug!("cluster read failed, probing next: {err:#}");
                    last = Some(err);
                }
            }
        }
        Err(match last {
            Some(err) => err.context("every cluster failed to select"),
            None => anyhow!("no clusters to select from"),
        })
    }
}

/// Issue the select to every cluster concurrently. The channel is buffered to
/// the cluster count so abandoned readers never block a responder.
fn scatter_selects(
    clusters: &[Arc<dyn Cluster>],
    keys: &[Bytes],
    fetch: usize,
) -> mpsc::Receiver<Result<Selection>> {
    let (tx, rx) = mpsc::channel(clusters.len());
    let keys: Arc<[Bytes]> = keys.into();
    for cluster in clusters {
        let cluster = cluster.clone();
        let keys = keys.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let res = cluster.select(&keys, 0, fetch).await;
            let _ = tx.try_send(res);
        });
    }
    rx
}

struct Merged {
    selection: Selection,
    divergent: KeyMemberSet,
}

/// Merge per-cluster responses into the union window per requested key, and
/// collect the divergent elements that fall inside those windows.
fn merge_responses(
    keys: &[Bytes],
    responses: &[Selection],
    offset: usize,
    limit: usize,
) -> Merged {
    let sets: Vec<TupleSet> = responses.iter().map(flatten).collect();
    let (union, mut divergent) = union_difference(&sets);

    let mut by_key: HashMap<Bytes, TupleSet> = HashMap::new();
    for tuple in union {
        by_key.entry(tuple.key.clone()).or_default().insert(tuple);
    }

    let mut selection = Selection::with_capacity(keys.len());
    let mut returned = KeyMemberSet::new();
    for key in keys {
        let window = by_key
            .get(key)
            .map(|set| set.windowed(offset, limit))
            .unwrap_or_default();
        for tuple in &window {
            returned.insert(tuple.key_member());
        }
        selection.insert(key.clone(), window);
    }

    divergent.retain(|km| returned.contains(km));
    Merged {
        selection,
        divergent,
    }
}

fn flatten(selection: &Selection) -> TupleSet {
    selection.values().flatten().cloned().collect()
}

#[cfg(test)]
mod tests {
    use anyhow::bail;
    use futures::stream::{self, BoxStream, StreamExt};
    use parking_lot::Mutex;

    use super::*;
    use crate::cluster::memory::MemoryCluster;
    use crate::cluster::Presence;
    use crate::metrics::NopInstrumentation;
    use crate::repair::Repairer;
    use crate::tuple::{KeyMember, KeyScoreMember};

    fn t(key: &str, score: f64, member: &str) -> KeyScoreMember {
        KeyScoreMember::new(key.as_bytes().to_vec(), score, member.as_bytes().to_vec())
    }

    fn key(key: &str) -> Bytes {
        Bytes::copy_from_slice(key.as_bytes())
    }

    #[derive(Debug, Default)]
    struct RecordingRepairer(Mutex<Vec<KeyMemberSet>>);

    impl RecordingRepairer {
        fn all(&self) -> KeyMemberSet {
            self.0.lock().iter().flat_map(|set| set.iter().cloned()).collect()
        }
    }

    impl Repairer for RecordingRepairer {
        fn request_repair(&self, kms: KeyMemberSet) {
            self.0.lock().push(kms);
        }
    }

    /// Cluster whose every operation fails.
    #[derive(Debug)]
    struct DeadCluster;

    #[async_trait]
    impl Cluster for DeadCluster {
        async fn insert(&self, _tuples: &[KeyScoreMember]) -> Result<()> {
            bail!("dead cluster")
        }

        async fn delete(&self, _tuples: &[KeyScoreMember]) -> Result<()> {
            bail!("dead cluster")
        }

        async fn select(
            &self,
            _keys: &[Bytes],
            _offset: usize,
            _limit: usize,
        ) -> Result<Selection> {
            bail!("dead cluster")
        }

        async fn score(&self, _key: &Bytes, _member: &Bytes) -> Result<Option<Presence>> {
            bail!("dead cluster")
        }

        fn keys(&self) -> BoxStream<'static, Result<Bytes>> {
            stream::empty().boxed()
        }
    }

    /// Cluster that answers after a pause.
    #[derive(Debug)]
    struct SlowCluster {
        inner: MemoryCluster,
        pause: Duration,
    }

    #[async_trait]
    impl Cluster for SlowCluster {
        async fn insert(&self, tuples: &[KeyScoreMember]) -> Result<()> {
            self.inner.insert(tuples).await
        }

        async fn delete(&self, tuples: &[KeyScoreMember]) -> Result<()> {
            self.inner.delete(tuples).await
        }

        async fn select(&self, keys: &[Bytes], offset: usize, limit: usize) -> Result<Selection> {
            tokio::time::sleep(self.pause).await;
            self.inner.select(keys, offset, limit).await
        }

        async fn score(&self, key: &Bytes, member: &Bytes) -> Result<Option<Presence>> {
            self.inner.score(key, member).await
        }

        fn keys(&self) -> BoxStream<'static, Result<Bytes>> {
            self.inner.keys()
        }
    }

    fn core_over(
        clusters: Vec<Arc<dyn Cluster>>,
        repairer: Arc<RecordingRepairer>,
    ) -> Core {
        Core::new(clusters, 1, repairer, Arc::new(NopInstrumentation))
    }

    async fn seeded(tuples: &[KeyScoreMember]) -> MemoryCluster {
        let cluster = MemoryCluster::new();
        cluster.insert(tuples).await.unwrap();
        cluster
    }

    #[tokio::test]
    async fn all_merge_matches_single_replica_when_consistent() -> Result<()> {
        let data = [t("k", 3.0, "a"), t("k", 1.0, "b"), t("q", 2.0, "c")];
        let one = seeded(&data).await;
        let clusters: Vec<Arc<dyn Cluster>> = vec![
            Arc::new(one.clone()),
            Arc::new(seeded(&data).await),
            Arc::new(seeded(&data).await),
        ];
        let repairer = Arc::new(RecordingRepairer::default());
        let core = core_over(clusters, repairer.clone());

        let keys = [key("k"), key("q")];
        let merged = ReadAllMerge.select(&core, &keys, 0, 10).await?;
        let single = one.select(&keys, 0, 10).await?;
        assert_eq!(merged, single);
        assert!(repairer.all().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn all_merge_detects_divergence_and_repairs() -> Result<()> {
        let ahead = seeded(&[t("k", 2.0, "m")]).await;
        let clusters: Vec<Arc<dyn Cluster>> = vec![
            Arc::new(ahead),
            Arc::new(MemoryCluster::new()),
            Arc::new(MemoryCluster::new()),
        ];
        let repairer = Arc::new(RecordingRepairer::default());
        let core = core_over(clusters, repairer.clone());

        let res = ReadAllMerge.select(&core, &[key("k")], 0, 10).await?;
        assert_eq!(res[&key("k")], vec![t("k", 2.0, "m")]);
        assert!(repairer.all().contains(&KeyMember::new(&b"k"[..], &b"m"[..])));
        Ok(())
    }

    #[tokio::test]
    async fn all_merge_ignores_divergence_outside_the_window() -> Result<()> {
        let common = [t("k", 9.0, "a"), t("k", 8.0, "b")];
        let ahead = seeded(&common).await;
        ahead.insert(&[t("k", 1.0, "z")]).await?;
        let clusters: Vec<Arc<dyn Cluster>> = vec![
            Arc::new(ahead),
            Arc::new(seeded(&common).await),
            Arc::new(seeded(&common).await),
        ];
        let repairer = Arc::new(RecordingRepairer::default());
        let core = core_over(clusters, repairer.clone());

        let res = ReadAllMerge.select(&core, &[key("k")], 0, 2).await?;
        assert_eq!(res[&key("k")], vec![t("k", 9.0, "a"), t("k", 8.0, "b")]);
        // The lone "z" ranks below the returned window, so it is the
        // walker's problem, not this read's.
        assert!(repairer.all().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn all_merge_window_is_union_window() -> Result<()> {
        // Each replica alone would fill the window with its own tuples; the
        // union window must interleave them.
        let left = seeded(&[t("k", 9.0, "a"), t("k", 5.0, "c")]).await;
        let right = seeded(&[t("k", 7.0, "b"), t("k", 3.0, "d")]).await;
        let clusters: Vec<Arc<dyn Cluster>> = vec![Arc::new(left), Arc::new(right)];
        let repairer = Arc::new(RecordingRepairer::default());
        let core = core_over(clusters, repairer.clone());

        let res = ReadAllMerge.select(&core, &[key("k")], 0, 2).await?;
        assert_eq!(res[&key("k")], vec![t("k", 9.0, "a"), t("k", 7.0, "b")]);
        Ok(())
    }

    #[tokio::test]
    async fn quorum_merge_returns_without_the_dead_cluster() -> Result<()> {
        let data = [t("k", 1.0, "m")];
        let clusters: Vec<Arc<dyn Cluster>> = vec![
            Arc::new(seeded(&data).await),
            Arc::new(seeded(&data).await),
            Arc::new(DeadCluster),
        ];
        let repairer = Arc::new(RecordingRepairer::default());
        let core = core_over(clusters, repairer.clone());

        let res = ReadQuorumMerge::new(2).select(&core, &[key("k")], 0, 10).await?;
        assert_eq!(res[&key("k")], vec![t("k", 1.0, "m")]);
        Ok(())
    }

    #[tokio::test]
    async fn quorum_merge_errors_below_quorum() {
        let clusters: Vec<Arc<dyn Cluster>> = vec![
            Arc::new(seeded(&[t("k", 1.0, "m")]).await),
            Arc::new(DeadCluster),
            Arc::new(DeadCluster),
        ];
        let repairer = Arc::new(RecordingRepairer::default());
        let core = core_over(clusters, repairer);

        let res = ReadQuorumMerge::new(2).select(&core, &[key("k")], 0, 10).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn quorum_merge_lingers_for_late_divergence() -> Result<()> {
        let data = [t("k", 1.0, "m")];
        let late = SlowCluster {
            inner: MemoryCluster::new(),
            pause: Duration::from_millis(50),
        };
        let clusters: Vec<Arc<dyn Cluster>> = vec![
            Arc::new(seeded(&data).await),
            Arc::new(seeded(&data).await),
            Arc::new(late),
        ];
        let repairer = Arc::new(RecordingRepairer::default());
        let core = core_over(clusters, repairer.clone());

        let strategy = ReadQuorumMerge::new(2).with_linger(Duration::from_secs(1));
        let res = strategy.select(&core, &[key("k")], 0, 10).await?;
        assert_eq!(res[&key("k")], vec![t("k", 1.0, "m")]);
        // The fast pair agreed, so nothing was divergent at return time.
        assert!(repairer.all().is_empty());

        // The empty late response turns "m" into a suspect.
        for _ in 0..100 {
            if repairer.all().contains(&KeyMember::new(&b"k"[..], &b"m"[..])) {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("late responder never extended the repair set");
    }

    #[tokio::test]
    async fn quorum_merge_validates_bounds() {
        assert!(ReadQuorumMerge::new(0).validate(3).is_err());
        assert!(ReadQuorumMerge::new(4).validate(3).is_err());
        assert!(ReadQuorumMerge::new(3).validate(3).is_ok());
    }

    #[tokio::test]
    async fn read_first_probes_past_failures() -> Result<()> {
        let clusters: Vec<Arc<dyn Cluster>> = vec![
            Arc::new(DeadCluster),
            Arc::new(seeded(&[t("k", 1.0, "m")]).await),
        ];
        let repairer = Arc::new(RecordingRepairer::default());
        let core = core_over(clusters, repairer);

        let res = ReadFirst.select(&core, &[key("k")], 0, 10).await?;
        assert_eq!(res[&key("k")], vec![t("k", 1.0, "m")]);
        Ok(())
    }

    #[tokio::test]
    async fn read_one_rotates_over_clusters() -> Result<()> {
        let clusters: Vec<Arc<dyn Cluster>> = vec![
            Arc::new(seeded(&[t("k", 1.0, "left")]).await),
            Arc::new(seeded(&[t("k", 1.0, "right")]).await),
        ];
        let repairer = Arc::new(RecordingRepairer::default());
        let core = core_over(clusters, repairer);

        let strategy = ReadOne::new();
        let mut members = std::collections::HashSet::new();
        for _ in 0..2 {
            let res = strategy.select(&core, &[key("k")], 0, 10).await?;
            members.insert(res[&key("k")][0].member.clone());
        }
        assert_eq!(members.len(), 2);
        Ok(())
    }
}
