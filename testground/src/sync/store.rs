//! In-memory coordination store.
//!
//! Counters are `watch` channels, so a barrier costs O(1) per change
//! rather than per-waiter polling. Streams keep their full history and
//! publish their length through a `watch` channel; subscribers replay the
//! prefix they missed and then park on length changes. Cells idle past a
//! TTL are garbage-collected opportunistically.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{SyncApi, SyncError};

/// How long an untouched counter or stream survives before GC.
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(3600);

struct CounterCell {
    tx: watch::Sender<u64>,
    touched: Mutex<Instant>,
}

struct StreamCell {
    entries: RwLock<Vec<serde_json::Value>>,
    len_tx: watch::Sender<u64>,
    touched: Mutex<Instant>,
}

fn counter_key(run_id: &str, state: &str) -> String {
    format!("run:{}:states:{}", run_id, state)
}

fn stream_key(run_id: &str, topic: &str) -> String {
    format!("run:{}:topics:{}", run_id, topic)
}

fn event_key(run_id: &str, key: &str) -> String {
    format!("run:{}:events:{}", run_id, key)
}

/// Shared key/value/stream store backing the coordination primitives.
#[derive(Default)]
pub struct SyncStore {
    counters: Mutex<HashMap<String, Arc<CounterCell>>>,
    streams: Mutex<HashMap<String, Arc<StreamCell>>>,
}

impl SyncStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, key: &str) -> Arc<CounterCell> {
        let mut counters = self.counters.lock();
        Arc::clone(counters.entry(key.to_string()).or_insert_with(|| {
            let (tx, _) = watch::channel(0u64);
            Arc::new(CounterCell {
                tx,
                touched: Mutex::new(Instant::now()),
            })
        }))
    }

    fn stream(&self, key: &str) -> Arc<StreamCell> {
        let mut streams = self.streams.lock();
        Arc::clone(streams.entry(key.to_string()).or_insert_with(|| {
            let (len_tx, _) = watch::channel(0u64);
            Arc::new(StreamCell {
                entries: RwLock::new(Vec::new()),
                len_tx,
                touched: Mutex::new(Instant::now()),
            })
        }))
    }

    fn append(&self, key: &str, value: serde_json::Value) -> u64 {
        let cell = self.stream(key);
        *cell.touched.lock() = Instant::now();

        let mut entries = cell.entries.write();
        entries.push(value);
        let len = entries.len() as u64;
        drop(entries);

        let _ = cell.len_tx.send(len);
        len
    }

    async fn tail(
        &self,
        key: &str,
        token: CancellationToken,
    ) -> mpsc::Receiver<serde_json::Value> {
        let cell = self.stream(key);
        *cell.touched.lock() = Instant::now();

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut len_rx = cell.len_tx.subscribe();
            let mut next = 0usize;
            loop {
                let len = *len_rx.borrow_and_update() as usize;
                while next < len {
                    let item = { cell.entries.read()[next].clone() };
                    if tx.send(item).await.is_err() {
                        return;
                    }
                    next += 1;
                }

                tokio::select! {
                    _ = token.cancelled() => return,
                    changed = len_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        rx
    }

    /// Drops every counter and stream idle for longer than `ttl`.
    /// Returns the number of cells removed.
    pub fn gc(&self, ttl: Duration) -> usize {
        // checked_sub: the process may be younger than the TTL.
        let Some(cutoff) = Instant::now().checked_sub(ttl) else {
            return 0;
        };
        let mut removed = 0;

        let mut counters = self.counters.lock();
        counters.retain(|key, cell| {
            let keep = *cell.touched.lock() > cutoff;
            if !keep {
                debug!(%key, "collecting idle counter");
                removed += 1;
            }
            keep
        });
        drop(counters);

        let mut streams = self.streams.lock();
        streams.retain(|key, cell| {
            let keep = *cell.touched.lock() > cutoff || cell.len_tx.receiver_count() > 0;
            if !keep {
                debug!(%key, "collecting idle stream");
                removed += 1;
            }
            keep
        });

        removed
    }
}

#[async_trait]
impl SyncApi for SyncStore {
    async fn signal_entry(&self, run_id: &str, state: &str) -> Result<u64, SyncError> {
        let cell = self.counter(&counter_key(run_id, state));
        *cell.touched.lock() = Instant::now();

        let mut seq = 0;
        cell.tx.send_modify(|v| {
            *v += 1;
            seq = *v;
        });
        debug!(run_id, state, seq, "signalled entry to state");
        Ok(seq)
    }

    async fn barrier(
        &self,
        run_id: &str,
        state: &str,
        target: u64,
        token: &CancellationToken,
    ) -> Result<(), SyncError> {
        if target == 0 {
            warn!(run_id, state, "barrier with target zero; satisfying immediately");
            return Ok(());
        }

        let cell = self.counter(&counter_key(run_id, state));
        *cell.touched.lock() = Instant::now();
        let mut rx = cell.tx.subscribe();

        loop {
            if *rx.borrow_and_update() >= target {
                return Ok(());
            }
            tokio::select! {
                _ = token.cancelled() => return Err(SyncError::Cancelled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(SyncError::Closed);
                    }
                }
            }
        }
    }

    async fn publish(
        &self,
        run_id: &str,
        topic: &str,
        value: serde_json::Value,
    ) -> Result<u64, SyncError> {
        Ok(self.append(&stream_key(run_id, topic), value))
    }

    async fn subscribe(
        &self,
        run_id: &str,
        topic: &str,
        token: &CancellationToken,
    ) -> Result<mpsc::Receiver<serde_json::Value>, SyncError> {
        Ok(self.tail(&stream_key(run_id, topic), token.clone()).await)
    }

    async fn signal_event(
        &self,
        run_id: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<u64, SyncError> {
        Ok(self.append(&event_key(run_id, key), value))
    }

    async fn gc_expired(&self) -> Result<u64, SyncError> {
        Ok(self.gc(DEFAULT_IDLE_TTL) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_signal_entry_sequences_are_gap_free() {
        let store = Arc::new(SyncStore::new());

        // Ten concurrent signallers must receive exactly {1..10}.
        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.signal_entry("r1", "s").await.unwrap()
            }));
        }

        let mut seqs = Vec::new();
        for h in handles {
            seqs.push(h.await.unwrap());
        }
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=10).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_counters_are_scoped_per_run_and_state() {
        let store = SyncStore::new();
        assert_eq!(store.signal_entry("r1", "s").await.unwrap(), 1);
        assert_eq!(store.signal_entry("r2", "s").await.unwrap(), 1);
        assert_eq!(store.signal_entry("r1", "t").await.unwrap(), 1);
        assert_eq!(store.signal_entry("r1", "s").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_barrier_target_zero_returns_immediately() {
        let store = SyncStore::new();
        let token = CancellationToken::new();
        store.barrier("r1", "s", 0, &token).await.unwrap();
    }

    #[tokio::test]
    async fn test_barrier_releases_at_target() {
        let store = Arc::new(SyncStore::new());
        let token = CancellationToken::new();

        let waiter = {
            let store = Arc::clone(&store);
            let token = token.clone();
            tokio::spawn(async move { store.barrier("r1", "go", 10, &token).await })
        };

        for i in 1..=10u64 {
            assert_eq!(store.signal_entry("r1", "go").await.unwrap(), i);
        }

        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("barrier should release")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_barrier_cancel() {
        let store = Arc::new(SyncStore::new());
        let token = CancellationToken::new();

        let waiter = {
            let store = Arc::clone(&store);
            let token = token.clone();
            tokio::spawn(async move { store.barrier("r1", "never", 10, &token).await })
        };

        token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(3), waiter)
            .await
            .expect("barrier should observe cancellation")
            .unwrap();
        assert!(matches!(result, Err(SyncError::Cancelled)));
    }

    #[tokio::test]
    async fn test_barrier_already_satisfied() {
        let store = SyncStore::new();
        let token = CancellationToken::new();
        for _ in 0..3 {
            store.signal_entry("r1", "s").await.unwrap();
        }
        store.barrier("r1", "s", 3, &token).await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_replays_history_then_tails() {
        let store = Arc::new(SyncStore::new());
        let token = CancellationToken::new();

        for i in 0..5 {
            let seq = store
                .publish("r1", "peers", serde_json::json!({ "i": i }))
                .await
                .unwrap();
            assert_eq!(seq, i + 1);
        }

        let mut rx = store.subscribe("r1", "peers", &token).await.unwrap();
        for i in 0..5 {
            let v = rx.recv().await.unwrap();
            assert_eq!(v["i"], i);
        }

        store
            .publish("r1", "peers", serde_json::json!({ "i": 5 }))
            .await
            .unwrap();
        let v = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(v["i"], 5);

        token.cancel();
    }

    #[tokio::test]
    async fn test_subscribe_empty_then_publish_delivers_exactly_one() {
        let store = Arc::new(SyncStore::new());
        let token = CancellationToken::new();

        let mut rx = store.subscribe("r1", "t", &token).await.unwrap();
        store
            .publish("r1", "t", serde_json::json!("v"))
            .await
            .unwrap();

        let v = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(v, serde_json::json!("v"));

        // Nothing else arrives.
        let nothing =
            tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(nothing.is_err());
        token.cancel();
    }

    #[tokio::test]
    async fn test_subscribers_are_independent() {
        let store = Arc::new(SyncStore::new());
        let token = CancellationToken::new();

        store.publish("r1", "t", serde_json::json!(1)).await.unwrap();

        let mut rx1 = store.subscribe("r1", "t", &token).await.unwrap();
        let mut rx2 = store.subscribe("r1", "t", &token).await.unwrap();

        assert_eq!(rx1.recv().await.unwrap(), serde_json::json!(1));
        assert_eq!(rx2.recv().await.unwrap(), serde_json::json!(1));
        token.cancel();
    }

    #[tokio::test]
    async fn test_events_use_separate_namespace() {
        let store = SyncStore::new();
        let token = CancellationToken::new();

        store
            .signal_event("r1", "x", serde_json::json!("ev"))
            .await
            .unwrap();

        // The topic namespace with the same key stays empty.
        let mut rx = store.subscribe("r1", "x", &token).await.unwrap();
        let nothing = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(nothing.is_err());
        token.cancel();
    }

    #[tokio::test]
    async fn test_gc_drops_idle_cells() {
        let store = SyncStore::new();
        store.signal_entry("r1", "s").await.unwrap();
        store.publish("r1", "t", serde_json::json!(1)).await.unwrap();

        // Nothing is older than an hour yet.
        assert_eq!(store.gc(DEFAULT_IDLE_TTL), 0);
        // With a zero TTL everything idle goes.
        assert_eq!(store.gc(Duration::ZERO), 2);
    }
}
