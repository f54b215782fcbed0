use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::store::Store;

/// How often the sweeper wakes up.
pub(crate) const SWEEP_INTERVAL: Duration = Duration::from_millis(100);
/// Keys examined per cycle.
pub(crate) const SWEEP_SAMPLE: usize = 20;

/// Background task deleting expired keys that no read ever touches.
///
/// Each cycle samples up to [`SWEEP_SAMPLE`] keys carrying an expiry and
/// deletes the elapsed ones. When more than a quarter of the sample was
/// expired the cycle reruns immediately, which drains expiration storms
/// without letting a single cycle hold the lock for long.
pub(crate) struct Sweeper {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Sweeper {
    pub(crate) fn start(store: Store) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(sweep_loop(store, stop_rx));
        Self { stop_tx, handle }
    }

    /// Signal the task and wait for it to finish. It completes at most the
    /// cycle already in flight.
    pub(crate) async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.handle.await;
        info!("expiration sweeper stopped");
    }
}

async fn sweep_loop(store: Store, mut stop_rx: watch::Receiver<bool>) {
    info!(
        interval_ms = SWEEP_INTERVAL.as_millis() as u64,
        sample = SWEEP_SAMPLE,
        "expiration sweeper started"
    );
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.tick().await; // skip the immediate first tick
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop_rx.changed() => return,
        }
        loop {
            let (sampled, expired) = sweep_cycle(&store).await;
            if expired > 0 {
                metrics::counter!("respd_expired_keys_total").increment(expired as u64);
                debug!(sampled, expired, "swept expired keys");
            }
            // Rerun right away while more than 25% of the sample was dead.
            if sampled == 0 || expired * 4 <= sampled {
                break;
            }
            if *stop_rx.borrow() {
                return;
            }
        }
    }
}

/// One sampling pass. Returns (sample size, keys deleted).
async fn sweep_cycle(store: &Store) -> (usize, usize) {
    let mut db = store.write().await;
    let mut candidates: Vec<Vec<u8>> = db
        .entries
        .iter()
        .filter(|(_, entry)| entry.expiry.is_some())
        .map(|(key, _)| key.clone())
        .collect();
    if candidates.is_empty() {
        return (0, 0);
    }

    let sample_len = SWEEP_SAMPLE.min(candidates.len());
    let (sample, _) = candidates.partial_shuffle(&mut rand::thread_rng(), sample_len);

    let mut expired = 0;
    for key in sample.iter() {
        if db.entries.get(key).is_some_and(|e| e.is_expired()) {
            db.remove(key);
            expired += 1;
        }
    }
    (sample_len, expired)
}
