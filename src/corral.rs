//! The coordinator handle: quorum writes, strategy-driven reads, walker
//! lifecycle.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::task::AbortOnDropHandle;
use tracing::warn;

use crate::cluster::{Cluster, Selection};
use crate::metrics::{Instrumentation, NopInstrumentation};
use crate::police::{NopPolice, RatePolice};
use crate::repair::{NopRepairer, Repairer};
use crate::strategy::{ReadOne, ReadStrategy};
use crate::tuple::KeyScoreMember;
use crate::walker;

/// Construction-time misconfiguration. Fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The cluster list was empty.
    #[error("at least one cluster is required")]
    NoClusters,
    /// The write quorum cannot be met by the given clusters.
    #[error("write quorum {quorum} outside 1..={clusters}")]
    WriteQuorum {
        /// Configured quorum.
        quorum: usize,
        /// Number of clusters.
        clusters: usize,
    },
    /// The read quorum cannot be met by the given clusters.
    #[error("read quorum {quorum} outside 1..={clusters}")]
    ReadQuorum {
        /// Configured quorum.
        quorum: usize,
        /// Number of clusters.
        clusters: usize,
    },
}

/// A write completed on fewer clusters than the write quorum.
#[derive(Debug, Error)]
pub enum WriteError {
    /// Too few clusters accepted the batch. Clusters that did accept keep
    /// the data; repair converges them with the rest eventually.
    #[error("no quorum ({})", .errors.join("; "))]
    NoQuorum {
        /// One message per failed cluster.
        errors: Vec<String>,
    },
}

/// What a read strategy or repairer may reach of the coordinator: the cluster
/// list, the write quorum, the repairer, and the instrumentation sink.
pub struct Core {
    clusters: Vec<Arc<dyn Cluster>>,
    write_quorum: usize,
    repairer: Arc<dyn Repairer>,
    instrumentation: Arc<dyn Instrumentation>,
}

impl Core {
    pub(crate) fn new(
        clusters: Vec<Arc<dyn Cluster>>,
        write_quorum: usize,
        repairer: Arc<dyn Repairer>,
        instrumentation: Arc<dyn Instrumentation>,
    ) -> Self {
        Self {
            clusters,
            write_quorum,
            repairer,
            instrumentation,
        }
    }

    /// The backing clusters, in configuration order.
    pub fn clusters(&self) -> &[Arc<dyn Cluster>] {
        &self.clusters
    }

    /// Successful cluster responses required before a write returns.
    pub fn write_quorum(&self) -> usize {
        self.write_quorum
    }

    /// The repair sink.
    pub fn repairer(&self) -> &dyn Repairer {
        self.repairer.as_ref()
    }

    /// An owned handle on the repair sink, for detached work.
    pub fn repairer_handle(&self) -> Arc<dyn Repairer> {
        self.repairer.clone()
    }

    /// The instrumentation sink.
    pub fn instrumentation(&self) -> &dyn Instrumentation {
        self.instrumentation.as_ref()
    }

    pub(crate) fn instrumentation_handle(&self) -> Arc<dyn Instrumentation> {
        self.instrumentation.clone()
    }
}

impl fmt::Debug for Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Core")
            .field("clusters", &self.clusters.len())
            .field("write_quorum", &self.write_quorum)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy)]
enum WriteAction {
    Insert,
    Delete,
}

/// Dispatches write observations to the insert or delete side of the sink.
struct WriteInstr<'a> {
    instrumentation: &'a dyn Instrumentation,
    action: WriteAction,
}

impl WriteInstr<'_> {
    fn call(&self) {
        match self.action {
            WriteAction::Insert => self.instrumentation.insert_call(),
            WriteAction::Delete => self.instrumentation.delete_call(),
        }
    }

    fn record_count(&self, n: usize) {
        match self.action {
            WriteAction::Insert => self.instrumentation.insert_record_count(n),
            WriteAction::Delete => self.instrumentation.delete_record_count(n),
        }
    }

    fn call_duration(&self, d: Duration) {
        match self.action {
            WriteAction::Insert => self.instrumentation.insert_call_duration(d),
            WriteAction::Delete => self.instrumentation.delete_call_duration(d),
        }
    }

    fn record_duration(&self, d: Duration) {
        match self.action {
            WriteAction::Insert => self.instrumentation.insert_record_duration(d),
            WriteAction::Delete => self.instrumentation.delete_record_duration(d),
        }
    }

    fn quorum_failure(&self) {
        match self.action {
            WriteAction::Insert => self.instrumentation.insert_quorum_failure(),
            WriteAction::Delete => self.instrumentation.delete_quorum_failure(),
        }
    }
}

pub(crate) struct Inner {
    pub(crate) core: Core,
    pub(crate) strategy: Arc<dyn ReadStrategy>,
    pub(crate) police: Arc<dyn RatePolice>,
}

impl Inner {
    pub(crate) async fn select(
        &self,
        keys: &[Bytes],
        offset: usize,
        limit: usize,
    ) -> Result<Selection> {
        if keys.is_empty() {
            return Ok(Selection::new());
        }
        self.police.report(keys.len());

        let instrumentation = self.core.instrumentation();
        instrumentation.select_call();
        let began = Instant::now();
        let result = self.strategy.select(&self.core, keys, offset, limit).await;
        let elapsed = began.elapsed();
        instrumentation.select_call_duration(elapsed);
        if let Ok(selection) = &result {
            let records: usize = selection.values().map(Vec::len).sum();
            instrumentation.select_record_count(records);
            if records > 0 {
                instrumentation
                    .select_record_duration(elapsed / records.min(u32::MAX as usize) as u32);
            }
        }
        result
    }

    async fn write(&self, tuples: &[KeyScoreMember], action: WriteAction) -> Result<(), WriteError> {
        if tuples.is_empty() {
            return Ok(());
        }
        let instr = WriteInstr {
            instrumentation: self.core.instrumentation(),
            action,
        };
        instr.call();
        instr.record_count(tuples.len());

        let began = Instant::now();
        let result = self.scatter_gather(tuples, action).await;
        let elapsed = began.elapsed();
        instr.call_duration(elapsed);
        instr.record_duration(elapsed / tuples.len().min(u32::MAX as usize) as u32);
        if result.is_err() {
            instr.quorum_failure();
        }
        result
    }

    async fn scatter_gather(
        &self,
        tuples: &[KeyScoreMember],
        action: WriteAction,
    ) -> Result<(), WriteError> {
        let clusters = self.core.clusters();
        // Buffered to the cluster count so responders arriving after the
        // quorum returned never block.
        let (tx, mut rx) = mpsc::channel(clusters.len());
        let batch: Arc<[KeyScoreMember]> = tuples.into();
        for cluster in clusters {
            let cluster = cluster.clone();
            let batch = batch.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let res = match action {
                    WriteAction::Insert => cluster.insert(&batch).await,
                    WriteAction::Delete => cluster.delete(&batch).await,
                };
                let _ = tx.try_send(res);
            });
        }
        drop(tx);

        let mut successes = 0;
        let mut errors = Vec::new();
        while let Some(res) = rx.recv().await {
            match res {
                Ok(()) => successes += 1,
                Err(err) => errors.push(err.to_string()),
            }
            if successes >= self.core.write_quorum() {
                return Ok(());
            }
        }
        Err(WriteError::NoQuorum { errors })
    }
}

/// Replicated CRDT sorted sets over independent clusters.
///
/// Writes scatter to every cluster and succeed once the write quorum has
/// acknowledged; reads follow the configured [`ReadStrategy`]. A success on
/// write does not mean every cluster took it; read repair and the walker are
/// what make the clusters agree eventually.
///
/// Cheap to clone. Background tasks stop when the last clone drops.
#[derive(Clone)]
pub struct Corral {
    inner: Arc<Inner>,
    _walker: Option<Arc<AbortOnDropHandle<()>>>,
}

impl Corral {
    /// Start configuring a coordinator over the given clusters.
    pub fn builder(clusters: Vec<Arc<dyn Cluster>>) -> Builder {
        Builder {
            clusters,
            write_quorum: 1,
            strategy: Arc::new(ReadOne::new()),
            repairer: Arc::new(NopRepairer),
            walker_rate: 0,
            walk_completed: None,
            police: None,
            instrumentation: Arc::new(NopInstrumentation),
        }
    }

    /// Add each tuple to every cluster, subject to score monotonicity.
    ///
    /// Returns once the write quorum has acknowledged; remaining clusters
    /// finish in the background and their errors are dropped.
    pub async fn insert(&self, tuples: &[KeyScoreMember]) -> Result<(), WriteError> {
        self.inner.write(tuples, WriteAction::Insert).await
    }

    /// Write a tombstone for each tuple to every cluster, subject to score
    /// monotonicity. Quorum semantics match [`Corral::insert`].
    pub async fn delete(&self, tuples: &[KeyScoreMember]) -> Result<(), WriteError> {
        self.inner.write(tuples, WriteAction::Delete).await
    }

    /// Read through the configured strategy.
    pub async fn select(
        &self,
        keys: &[Bytes],
        offset: usize,
        limit: usize,
    ) -> Result<Selection> {
        self.inner.select(keys, offset, limit).await
    }
}

impl fmt::Debug for Corral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Corral")
            .field("core", &self.inner.core)
            .field("walker", &self._walker.is_some())
            .finish()
    }
}

/// Configures and builds a [`Corral`].
pub struct Builder {
    clusters: Vec<Arc<dyn Cluster>>,
    write_quorum: usize,
    strategy: Arc<dyn ReadStrategy>,
    repairer: Arc<dyn Repairer>,
    walker_rate: usize,
    walk_completed: Option<mpsc::Sender<()>>,
    police: Option<Arc<dyn RatePolice>>,
    instrumentation: Arc<dyn Instrumentation>,
}

impl Builder {
    /// Successful cluster responses required before a write returns.
    /// Defaults to 1.
    pub fn write_quorum(mut self, quorum: usize) -> Self {
        self.write_quorum = quorum;
        self
    }

    /// Read policy. Defaults to [`ReadOne`].
    pub fn read_strategy(mut self, strategy: impl ReadStrategy) -> Self {
        self.strategy = Arc::new(strategy);
        self
    }

    /// Repair sink fed by merging strategies and, through them, the walker.
    /// Defaults to [`NopRepairer`].
    pub fn repairer(mut self, repairer: impl Repairer) -> Self {
        self.repairer = Arc::new(repairer);
        self
    }

    /// Keys per second the background walker may read. Zero, the default,
    /// disables the walker entirely.
    pub fn walker_rate(mut self, rate: usize) -> Self {
        self.walker_rate = rate;
        self
    }

    /// Receives a signal whenever the walker completes a sweep of all
    /// clusters. Delivery is best-effort: signals are dropped when the
    /// receiver is not keeping up, so treat them as a liveness hint rather
    /// than a count.
    pub fn walk_completed(mut self, tx: mpsc::Sender<()>) -> Self {
        self.walk_completed = Some(tx);
        self
    }

    /// Admission authority shared by queries and the walker. Defaults to
    /// [`crate::police::NopPolice`], which is only sensible while the walker
    /// is disabled.
    pub fn rate_police(mut self, police: impl RatePolice) -> Self {
        self.police = Some(Arc::new(police));
        self
    }

    /// Observation sink. Defaults to [`NopInstrumentation`].
    pub fn instrumentation(mut self, instrumentation: impl Instrumentation) -> Self {
        self.instrumentation = Arc::new(instrumentation);
        self
    }

    /// Validate the configuration and start the coordinator.
    pub fn build(self) -> Result<Corral, ConfigError> {
        let n = self.clusters.len();
        if n == 0 {
            return Err(ConfigError::NoClusters);
        }
        if self.write_quorum == 0 || self.write_quorum > n {
            return Err(ConfigError::WriteQuorum {
                quorum: self.write_quorum,
                clusters: n,
            });
        }
        self.strategy.validate(n)?;

        let police = self.police.unwrap_or_else(|| {
            if self.walker_rate > 0 {
                warn!("walker enabled without a rate police; sweeps will not yield to queries");
            }
            Arc::new(NopPolice)
        });
        let inner = Arc::new(Inner {
            core: Core::new(
                self.clusters,
                self.write_quorum,
                self.repairer,
                self.instrumentation,
            ),
            strategy: self.strategy,
            police,
        });
        let walker = (self.walker_rate > 0).then(|| {
            Arc::new(walker::spawn(
                &inner,
                self.walker_rate,
                self.walk_completed,
            ))
        });
        Ok(Corral {
            inner,
            _walker: walker,
        })
    }
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("clusters", &self.clusters.len())
            .field("write_quorum", &self.write_quorum)
            .field("walker_rate", &self.walker_rate)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::MemoryCluster;
    use crate::strategy::ReadQuorumMerge;

    fn clusters(n: usize) -> Vec<Arc<dyn Cluster>> {
        (0..n)
            .map(|_| Arc::new(MemoryCluster::new()) as Arc<dyn Cluster>)
            .collect()
    }

    #[tokio::test]
    async fn build_rejects_empty_cluster_list() {
        assert!(matches!(
            Corral::builder(Vec::new()).build(),
            Err(ConfigError::NoClusters)
        ));
    }

    #[tokio::test]
    async fn build_rejects_bad_write_quorum() {
        assert!(matches!(
            Corral::builder(clusters(3)).write_quorum(0).build(),
            Err(ConfigError::WriteQuorum { quorum: 0, clusters: 3 })
        ));
        assert!(matches!(
            Corral::builder(clusters(3)).write_quorum(4).build(),
            Err(ConfigError::WriteQuorum { quorum: 4, clusters: 3 })
        ));
        assert!(Corral::builder(clusters(3)).write_quorum(3).build().is_ok());
    }

    #[tokio::test]
    async fn build_rejects_bad_read_quorum() {
        assert!(matches!(
            Corral::builder(clusters(3))
                .read_strategy(ReadQuorumMerge::new(4))
                .build(),
            Err(ConfigError::ReadQuorum { quorum: 4, clusters: 3 })
        ));
    }

    #[tokio::test]
    async fn empty_batches_and_key_lists_short_circuit() {
        let corral = Corral::builder(clusters(3)).write_quorum(3).build().unwrap();
        corral.insert(&[]).await.unwrap();
        corral.delete(&[]).await.unwrap();
        let res = corral.select(&[], 0, 10).await.unwrap();
        assert!(res.is_empty());
    }
}
