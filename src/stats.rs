//! Process-wide connection ledger and telemetry aggregation
//!
//! A single [`Statistics`] instance observes every connection through the
//! trace observer hook: it keeps the live connection table, hour-bucketed
//! historical counters and session totals, and periodically snapshots the
//! whole ledger to disk. Counter updates on the relay hot path are plain
//! atomic additions; the table locks only guard lookup and insert.

use crate::connection::ConnectionContext;
use crate::env::Env;
use crate::state::{ConnectionState, Direction};
use crate::trace::{ConnectionId, TraceInfo, TraceObserver};
use crate::ProxyError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;

/// File name of the persisted ledger snapshot under the data root.
pub const STATS_FILE: &str = "statistics.json";

/// Counters for one one-hour time bucket. Created lazily on the first event
/// in that hour and kept forever as the historical log.
pub struct StatisticsItem {
    time: DateTime<Utc>,
    connection_count: AtomicU64,
    success_connection_count: AtomicU64,
    failed_connection_count: AtomicU64,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

impl StatisticsItem {
    fn new(time: DateTime<Utc>) -> Self {
        Self {
            time,
            connection_count: AtomicU64::new(0),
            success_connection_count: AtomicU64::new(0),
            failed_connection_count: AtomicU64::new(0),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
        }
    }

    fn from_snapshot(time: DateTime<Utc>, snapshot: &BucketSnapshot) -> Self {
        Self {
            time,
            connection_count: AtomicU64::new(snapshot.connections),
            success_connection_count: AtomicU64::new(snapshot.success),
            failed_connection_count: AtomicU64::new(snapshot.failed),
            bytes_up: AtomicU64::new(snapshot.bytes_up),
            bytes_down: AtomicU64::new(snapshot.bytes_down),
        }
    }

    fn snapshot(&self) -> BucketSnapshot {
        BucketSnapshot {
            connections: self.connection_count(),
            success: self.success_connection_count(),
            failed: self.failed_connection_count(),
            bytes_up: self.bytes_up(),
            bytes_down: self.bytes_down(),
        }
    }

    /// Start of the hour this bucket covers.
    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    pub fn connection_count(&self) -> u64 {
        self.connection_count.load(Ordering::Relaxed)
    }

    pub fn success_connection_count(&self) -> u64 {
        self.success_connection_count.load(Ordering::Relaxed)
    }

    pub fn failed_connection_count(&self) -> u64 {
        self.failed_connection_count.load(Ordering::Relaxed)
    }

    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct BucketSnapshot {
    connections: u64,
    success: u64,
    failed: u64,
    bytes_up: u64,
    bytes_down: u64,
}

/// Persisted form of the ledger: lifetime counters, accumulated run time
/// and the full historical bucket table, keyed by hour-start epoch seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    first_run_time: DateTime<Utc>,
    #[serde(with = "humantime_serde")]
    history_run_time: Duration,
    total_connection_count: u64,
    total_success_connection_count: u64,
    total_failed_connection_count: u64,
    total_up_bytes: u64,
    total_down_bytes: u64,
    buckets: HashMap<i64, BucketSnapshot>,
}

impl Default for StatsSnapshot {
    fn default() -> Self {
        Self {
            first_run_time: Utc::now(),
            history_run_time: Duration::ZERO,
            total_connection_count: 0,
            total_success_connection_count: 0,
            total_failed_connection_count: 0,
            total_up_bytes: 0,
            total_down_bytes: 0,
            buckets: HashMap::new(),
        }
    }
}

/// Process-wide statistics aggregator.
pub struct Statistics {
    connections: RwLock<HashMap<ConnectionId, Arc<ConnectionContext>>>,
    buckets: RwLock<HashMap<i64, Arc<StatisticsItem>>>,

    // session counters
    connection_count: AtomicU64,
    success_connection_count: AtomicU64,
    failed_connection_count: AtomicU64,
    current_up_bytes: AtomicU64,
    current_down_bytes: AtomicU64,

    // lifetime bases carried over from the persisted snapshot
    total_connection_base: u64,
    total_success_base: u64,
    total_failed_base: u64,
    total_up_base: u64,
    total_down_base: u64,

    startup_time: DateTime<Utc>,
    first_run_time: DateTime<Utc>,
    history_run_time: Mutex<Duration>,
    last_store_time: Mutex<DateTime<Utc>>,
}

impl Statistics {
    /// Construct the aggregator, loading any prior persisted snapshot.
    pub fn load(env: &Env) -> Result<Arc<Self>, ProxyError> {
        let snapshot: StatsSnapshot = env.load_data(STATS_FILE)?;
        Ok(Arc::new(Self::from_snapshot(snapshot)))
    }

    fn from_snapshot(snapshot: StatsSnapshot) -> Self {
        let now = Utc::now();
        let buckets = snapshot
            .buckets
            .iter()
            .map(|(key, bucket)| {
                (
                    *key,
                    Arc::new(StatisticsItem::from_snapshot(hour_start(*key), bucket)),
                )
            })
            .collect();
        Self {
            connections: RwLock::new(HashMap::new()),
            buckets: RwLock::new(buckets),
            connection_count: AtomicU64::new(0),
            success_connection_count: AtomicU64::new(0),
            failed_connection_count: AtomicU64::new(0),
            current_up_bytes: AtomicU64::new(0),
            current_down_bytes: AtomicU64::new(0),
            total_connection_base: snapshot.total_connection_count,
            total_success_base: snapshot.total_success_connection_count,
            total_failed_base: snapshot.total_failed_connection_count,
            total_up_base: snapshot.total_up_bytes,
            total_down_base: snapshot.total_down_bytes,
            startup_time: now,
            first_run_time: snapshot.first_run_time,
            history_run_time: Mutex::new(snapshot.history_run_time),
            last_store_time: Mutex::new(now),
        }
    }

    /// Subscribe to a connection's telemetry and add it to the live table.
    /// Returns false when the identifier is already registered (a caller
    /// error), leaving the existing entry untouched.
    pub fn register(self: &Arc<Self>, context: &Arc<ConnectionContext>) -> bool {
        let id = context.id();
        {
            let mut live = self.connections.write().unwrap();
            if live.contains_key(&id) {
                return false;
            }
            live.insert(id, Arc::clone(context));
        }
        if context
            .trace()
            .set_observer(Arc::clone(self) as Arc<dyn TraceObserver>)
            .is_err()
        {
            log::debug!("[{id}] trace observer already wired");
        }
        self.connection_count.fetch_add(1, Ordering::Relaxed);
        self.bucket_at(context.trace().start_time())
            .connection_count
            .fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Drop a connection from the live table; invoked as the final step of
    /// connection teardown. Historical counters are unaffected.
    pub fn unregister(&self, context: &Arc<ConnectionContext>) -> bool {
        self.connections
            .write()
            .unwrap()
            .remove(&context.id())
            .is_some()
    }

    /// Idempotent lookup-or-create of the bucket covering `time`.
    fn bucket_at(&self, time: DateTime<Utc>) -> Arc<StatisticsItem> {
        let key = trim_to_hour(time);
        if let Some(item) = self.buckets.read().unwrap().get(&key) {
            return Arc::clone(item);
        }
        let mut buckets = self.buckets.write().unwrap();
        Arc::clone(
            buckets
                .entry(key)
                .or_insert_with(|| Arc::new(StatisticsItem::new(hour_start(key)))),
        )
    }

    /// Fold elapsed run time into the historical total and persist the full
    /// ledger. Runs from the autosave timer and once more at shutdown.
    pub fn save(&self, env: &Env) -> Result<(), ProxyError> {
        let snapshot = self.snapshot();
        env.save_data(&snapshot, STATS_FILE)
    }

    fn snapshot(&self) -> StatsSnapshot {
        let now = Utc::now();
        {
            let mut history = self.history_run_time.lock().unwrap();
            let mut last = self.last_store_time.lock().unwrap();
            *history += (now - *last).to_std().unwrap_or_default();
            *last = now;
        }
        StatsSnapshot {
            first_run_time: self.first_run_time,
            history_run_time: *self.history_run_time.lock().unwrap(),
            total_connection_count: self.total_connection_count(),
            total_success_connection_count: self.total_success_connection_count(),
            total_failed_connection_count: self.total_failed_connection_count(),
            total_up_bytes: self.total_up_bytes(),
            total_down_bytes: self.total_down_bytes(),
            buckets: self
                .buckets
                .read()
                .unwrap()
                .iter()
                .map(|(key, bucket)| (*key, bucket.snapshot()))
                .collect(),
        }
    }

    /// Spawn the periodic snapshot task. Persistence faults are logged and
    /// retried on the next tick; they never reach the relay path.
    pub fn spawn_autosave(self: &Arc<Self>, env: Env, interval: Duration) -> JoinHandle<()> {
        let stats = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                if let Err(e) = stats.save(&env) {
                    log::error!("failed to persist statistics snapshot: {e}");
                }
            }
        })
    }

    // --- read accessors for reporting consumers ---

    pub fn active_connection_count(&self) -> usize {
        self.connections.read().unwrap().len()
    }

    /// Connections registered this session.
    pub fn connection_count(&self) -> u64 {
        self.connection_count.load(Ordering::Relaxed)
    }

    pub fn success_connection_count(&self) -> u64 {
        self.success_connection_count.load(Ordering::Relaxed)
    }

    pub fn failed_connection_count(&self) -> u64 {
        self.failed_connection_count.load(Ordering::Relaxed)
    }

    pub fn current_up_bytes(&self) -> u64 {
        self.current_up_bytes.load(Ordering::Relaxed)
    }

    pub fn current_down_bytes(&self) -> u64 {
        self.current_down_bytes.load(Ordering::Relaxed)
    }

    /// Lifetime totals: persisted base plus the running session.
    pub fn total_connection_count(&self) -> u64 {
        self.total_connection_base + self.connection_count()
    }

    pub fn total_success_connection_count(&self) -> u64 {
        self.total_success_base + self.success_connection_count()
    }

    pub fn total_failed_connection_count(&self) -> u64 {
        self.total_failed_base + self.failed_connection_count()
    }

    pub fn total_up_bytes(&self) -> u64 {
        self.total_up_base + self.current_up_bytes()
    }

    pub fn total_down_bytes(&self) -> u64 {
        self.total_down_base + self.current_down_bytes()
    }

    pub fn startup_time(&self) -> DateTime<Utc> {
        self.startup_time
    }

    pub fn first_run_time(&self) -> DateTime<Utc> {
        self.first_run_time
    }

    pub fn current_run_time(&self) -> Duration {
        (Utc::now() - self.startup_time).to_std().unwrap_or_default()
    }

    /// Accumulated run time across all runs, including the current one.
    pub fn total_run_time(&self) -> Duration {
        let since_store = (Utc::now() - *self.last_store_time.lock().unwrap())
            .to_std()
            .unwrap_or_default();
        *self.history_run_time.lock().unwrap() + since_store
    }

    /// Snapshot of the live connection table.
    pub fn connections(&self) -> Vec<Arc<ConnectionContext>> {
        self.connections.read().unwrap().values().cloned().collect()
    }

    /// Snapshot of the historical bucket table.
    pub fn bucket_log(&self) -> HashMap<i64, Arc<StatisticsItem>> {
        self.buckets.read().unwrap().clone()
    }
}

impl TraceObserver for Statistics {
    fn bytes_transferred(&self, _trace: &TraceInfo, direction: Direction, count: u64) {
        let bucket = self.bucket_at(Utc::now());
        match direction {
            Direction::Up => {
                bucket.bytes_up.fetch_add(count, Ordering::Relaxed);
                self.current_up_bytes.fetch_add(count, Ordering::Relaxed);
            }
            Direction::Down => {
                bucket.bytes_down.fetch_add(count, Ordering::Relaxed);
                self.current_down_bytes.fetch_add(count, Ordering::Relaxed);
            }
        }
    }

    fn state_changed(&self, trace: &TraceInfo, state: ConnectionState) {
        if state != ConnectionState::Closed {
            return;
        }
        // Outcome counters land in the bucket the connection started in.
        let bucket = self.bucket_at(trace.start_time());
        if trace.is_success() {
            self.success_connection_count.fetch_add(1, Ordering::Relaxed);
            bucket
                .success_connection_count
                .fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_connection_count.fetch_add(1, Ordering::Relaxed);
            bucket
                .failed_connection_count
                .fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Hour-truncated epoch seconds: the key of the bucket covering `time`.
fn trim_to_hour(time: DateTime<Utc>) -> i64 {
    let ts = time.timestamp();
    ts - ts.rem_euclid(3600)
}

fn hour_start(key: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(key, 0).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn temp_env() -> Env {
        Env::new(std::env::temp_dir().join(format!("portshade-stats-{:x}", rand::random::<u64>())))
    }

    fn new_context() -> Arc<ConnectionContext> {
        Arc::new(ConnectionContext::new("127.0.0.1:40000".parse().unwrap()))
    }

    #[test]
    fn test_trim_to_hour() {
        let time = Utc.with_ymd_and_hms(2026, 8, 27, 13, 45, 59).unwrap();
        let key = trim_to_hour(time);
        assert_eq!(
            hour_start(key),
            Utc.with_ymd_and_hms(2026, 8, 27, 13, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let stats = Statistics::load(&temp_env()).unwrap();
        let context = new_context();
        assert!(stats.register(&context));
        assert!(!stats.register(&context));
        assert_eq!(stats.connection_count(), 1);
        assert_eq!(stats.active_connection_count(), 1);

        assert!(stats.unregister(&context));
        assert!(!stats.unregister(&context));
        assert_eq!(stats.active_connection_count(), 0);
        // session counter is historical, not live
        assert_eq!(stats.connection_count(), 1);
    }

    #[test]
    fn test_closed_counts_success_and_failure() {
        let stats = Statistics::load(&temp_env()).unwrap();

        let winner = new_context();
        stats.register(&winner);
        winner.trace().set_state(ConnectionState::TunnelEstablished);
        winner.trace().set_state(ConnectionState::Closed);

        let loser = new_context();
        stats.register(&loser);
        loser.trace().set_state(ConnectionState::ValidationFailed);
        loser.trace().set_state(ConnectionState::Closed);

        assert_eq!(stats.success_connection_count(), 1);
        assert_eq!(stats.failed_connection_count(), 1);
        assert_eq!(stats.connection_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_lifecycle_totals() {
        const K: usize = 64;
        const UP: u64 = 1500;
        const DOWN: u64 = 700;

        let stats = Statistics::load(&temp_env()).unwrap();
        let mut handles = Vec::new();
        for _ in 0..K {
            let stats = Arc::clone(&stats);
            handles.push(tokio::spawn(async move {
                let context = new_context();
                assert!(stats.register(&context));
                for _ in 0..10 {
                    context.trace().add_bytes(Direction::Up, UP / 10);
                    context.trace().add_bytes(Direction::Down, DOWN / 10);
                    tokio::task::yield_now().await;
                }
                context.trace().set_state(ConnectionState::TunnelEstablished);
                context.trace().set_state(ConnectionState::Closed);
                stats.unregister(&context);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(stats.connection_count(), K as u64);
        assert_eq!(stats.success_connection_count(), K as u64);
        assert_eq!(stats.failed_connection_count(), 0);
        assert_eq!(stats.current_up_bytes(), K as u64 * UP);
        assert_eq!(stats.current_down_bytes(), K as u64 * DOWN);
        assert_eq!(stats.active_connection_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_first_access_creates_one_bucket() {
        let stats = Statistics::load(&temp_env()).unwrap();
        let time = Utc::now();

        let mut handles = Vec::new();
        for _ in 0..32 {
            let stats = Arc::clone(&stats);
            handles.push(tokio::spawn(async move {
                let bucket = stats.bucket_at(time);
                bucket.connection_count.fetch_add(1, Ordering::Relaxed);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let buckets = stats.bucket_log();
        assert_eq!(buckets.len(), 1);
        let bucket = buckets.values().next().unwrap();
        assert_eq!(bucket.connection_count(), 32);
    }

    #[test]
    fn test_snapshot_round_trip_folds_lifetime_counters() {
        let env = temp_env();
        let stats = Statistics::load(&env).unwrap();

        let context = new_context();
        stats.register(&context);
        context.trace().add_bytes(Direction::Up, 4096);
        context.trace().set_state(ConnectionState::TunnelEstablished);
        context.trace().set_state(ConnectionState::Closed);
        stats.unregister(&context);

        stats.save(&env).unwrap();

        // A fresh session carries the persisted totals as its base.
        let reloaded = Statistics::load(&env).unwrap();
        assert_eq!(reloaded.connection_count(), 0);
        assert_eq!(reloaded.total_connection_count(), 1);
        assert_eq!(reloaded.total_success_connection_count(), 1);
        assert_eq!(reloaded.total_up_bytes(), 4096);
        assert!(!reloaded.bucket_log().is_empty());

        std::fs::remove_dir_all(env.data_root()).ok();
    }
}
