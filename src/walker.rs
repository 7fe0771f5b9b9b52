//! Background anti-entropy sweep.
//!
//! A producer task endlessly streams every cluster's keys, one random
//! cluster permutation per sweep; a driver task pulls policed batches off the
//! producer and pushes them through the normal read path, purely so the read
//! strategy's repair kicks in. The key channel holds a single element, so the
//! producer parks whenever the driver is throttled and the rate police stays
//! the only throttling authority.

use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, trace};

use crate::cluster::Cluster;
use crate::corral::Inner;
use crate::metrics::Instrumentation;

/// Spawn the walker over the coordinator. The returned handle aborts both
/// tasks on drop.
pub(crate) fn spawn(
    inner: &Arc<Inner>,
    rate: usize,
    walk_completed: Option<mpsc::Sender<()>>,
) -> AbortOnDropHandle<()> {
    let (key_tx, key_rx) = mpsc::channel(1);
    let (sweep_tx, sweep_rx) = mpsc::channel(1);
    let producer = AbortOnDropHandle::new(tokio::spawn(produce(
        inner.core.clusters().to_vec(),
        key_tx,
        sweep_tx,
        inner.core.instrumentation_handle(),
    )));
    let driver = drive(
        Arc::downgrade(inner),
        rate,
        key_rx,
        sweep_rx,
        walk_completed,
        producer,
    );
    AbortOnDropHandle::new(tokio::spawn(driver))
}

/// Stream every cluster's keys forever, a fresh random cluster order per
/// sweep, and signal after each full sweep. Sleeps a second after a sweep
/// that found nothing.
async fn produce(
    clusters: Vec<Arc<dyn Cluster>>,
    keys: mpsc::Sender<Bytes>,
    sweeps: mpsc::Sender<()>,
    instrumentation: Arc<dyn Instrumentation>,
) {
    let mut order: Vec<usize> = (0..clusters.len()).collect();
    loop {
        order.shuffle(&mut rand::thread_rng());
        let mut sent_any = false;
        for &i in &order {
            let mut stream = clusters[i].keys();
            while let Some(next) = stream.next().await {
                match next {
                    Ok(key) => {
                        if keys.send(key).await.is_err() {
                            return;
                        }
                        sent_any = true;
                    }
                    Err(err) => debug!("key enumeration failed: {err:#}"),
                }
            }
        }
        instrumentation.walk_sweep_completed();
        // Dropped when the previous signal has not been consumed yet.
        let _ = sweeps.try_send(());
        if !sent_any {
            time::sleep(Duration::from_secs(1)).await;
        }
    }
}

/// Pull policed key batches and route them through the read path, forwarding
/// sweep signals to the caller along the way.
async fn drive(
    inner: Weak<Inner>,
    rate: usize,
    mut keys: mpsc::Receiver<Bytes>,
    mut sweeps: mpsc::Receiver<()>,
    walk_completed: Option<mpsc::Sender<()>>,
    _producer: AbortOnDropHandle<()>,
) {
    loop {
        let Some(target) = inner.upgrade() else {
            return;
        };

        let granted = target.police.request(rate);
        if granted == 0 {
            target.core.instrumentation().walk_keys_throttled();
            drop(target);
            time::sleep(Duration::from_secs(1)).await;
            continue;
        }
        // The police is not trusted with unbounded grants.
        let granted = granted.min(rate.saturating_mul(10));

        let mut batch = Vec::with_capacity(granted);
        while batch.len() < granted {
            match keys.recv().await {
                Some(key) => batch.push(key),
                None => return,
            }
        }

        // Only the repair side effect matters here.
        if let Err(err) = target.select(&batch, 0, usize::MAX).await {
            trace!("walker select failed: {err:#}");
        }

        if let Some(tx) = &walk_completed {
            if sweeps.try_recv().is_ok() {
                let _ = tx.try_send(());
            }
        }
    }
}
