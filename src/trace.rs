//! Per-connection telemetry records
//!
//! Every connection owns a [`TraceInfo`]: write-once identity, byte counters
//! shared by the two relay loops, and an append-only state transition log.
//! The statistics aggregator observes it through [`TraceObserver`], wired
//! exactly once at registration, so the hot copy path never touches a
//! global lock.

use crate::state::{ConnectionState, Direction};
use crate::ProxyError;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

/// Random 128-bit connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId(u128);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// One committed state transition.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StateItem {
    pub time: DateTime<Utc>,
    pub state: ConnectionState,
}

/// Observer for telemetry events fired by [`TraceInfo`].
///
/// Byte events fire on every recorded read; state events fire once per
/// committed transition, in commit order.
pub trait TraceObserver: Send + Sync {
    fn bytes_transferred(&self, trace: &TraceInfo, direction: Direction, count: u64);
    fn state_changed(&self, trace: &TraceInfo, state: ConnectionState);
}

struct StateSlot {
    current: ConnectionState,
    log: Vec<StateItem>,
}

/// Telemetry record for a single connection.
pub struct TraceInfo {
    id: ConnectionId,
    remote_addr: OnceLock<SocketAddr>,
    start_time: DateTime<Utc>,
    end_time: Mutex<Option<DateTime<Utc>>>,
    up_bytes: AtomicU64,
    down_bytes: AtomicU64,
    // epoch millis bracketing the first/last byte per direction; 0 = never
    up_begin_ms: AtomicI64,
    up_end_ms: AtomicI64,
    down_begin_ms: AtomicI64,
    down_end_ms: AtomicI64,
    success: AtomicBool,
    state: Mutex<StateSlot>,
    observer: OnceLock<Arc<dyn TraceObserver>>,
}

impl TraceInfo {
    pub fn new(id: ConnectionId) -> Self {
        Self::build(id, OnceLock::new())
    }

    /// Construct with the remote address already recorded, for callers that
    /// know it up front (the accept path always does).
    pub fn with_remote_addr(id: ConnectionId, addr: SocketAddr) -> Self {
        Self::build(id, OnceLock::from(addr))
    }

    fn build(id: ConnectionId, remote_addr: OnceLock<SocketAddr>) -> Self {
        let now = Utc::now();
        Self {
            id,
            remote_addr,
            start_time: now,
            end_time: Mutex::new(None),
            up_bytes: AtomicU64::new(0),
            down_bytes: AtomicU64::new(0),
            up_begin_ms: AtomicI64::new(0),
            up_end_ms: AtomicI64::new(0),
            down_begin_ms: AtomicI64::new(0),
            down_end_ms: AtomicI64::new(0),
            success: AtomicBool::new(false),
            state: Mutex::new(StateSlot {
                current: ConnectionState::Connected,
                log: vec![StateItem {
                    time: now,
                    state: ConnectionState::Connected,
                }],
            }),
            observer: OnceLock::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Record the remote address. Write-once: a second call is a caller bug
    /// and fails without touching the stored value.
    pub fn set_remote_addr(&self, addr: SocketAddr) -> Result<(), ProxyError> {
        self.remote_addr
            .set(addr)
            .map_err(|_| ProxyError::ImmutableTrace("remote_addr"))
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr.get().copied()
    }

    /// Wire the telemetry observer. Write-once, set at registration.
    pub fn set_observer(&self, observer: Arc<dyn TraceObserver>) -> Result<(), ProxyError> {
        self.observer
            .set(observer)
            .map_err(|_| ProxyError::ImmutableTrace("observer"))
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        *self.end_time.lock().unwrap()
    }

    pub fn up_bytes(&self) -> u64 {
        self.up_bytes.load(Ordering::Relaxed)
    }

    pub fn down_bytes(&self) -> u64 {
        self.down_bytes.load(Ordering::Relaxed)
    }

    /// Sticky success flag: set once the tunnel was established, never
    /// reverted afterwards.
    pub fn is_success(&self) -> bool {
        self.success.load(Ordering::Relaxed)
    }

    /// Record bytes moved in one direction and stamp the first/last byte
    /// times. Called from the relay hot path: atomics only.
    pub fn add_bytes(&self, direction: Direction, count: u64) {
        let now_ms = Utc::now().timestamp_millis();
        let (bytes, begin, end) = match direction {
            Direction::Up => (&self.up_bytes, &self.up_begin_ms, &self.up_end_ms),
            Direction::Down => (&self.down_bytes, &self.down_begin_ms, &self.down_end_ms),
        };
        bytes.fetch_add(count, Ordering::Relaxed);
        let _ = begin.compare_exchange(0, now_ms, Ordering::Relaxed, Ordering::Relaxed);
        end.store(now_ms, Ordering::Relaxed);

        if let Some(observer) = self.observer.get() {
            observer.bytes_transferred(self, direction, count);
        }
    }

    /// Commit a state transition. Setting the current state again is a
    /// no-op and fires nothing. The observer runs under the state lock so
    /// transitions are observed in commit order.
    pub fn set_state(&self, state: ConnectionState) {
        let mut slot = self.state.lock().unwrap();
        if slot.current == state {
            return;
        }
        if state == ConnectionState::TunnelEstablished {
            self.success.store(true, Ordering::Relaxed);
        }
        slot.current = state;
        slot.log.push(StateItem {
            time: Utc::now(),
            state,
        });
        if state.is_terminal() {
            *self.end_time.lock().unwrap() = Some(Utc::now());
        }
        if let Some(observer) = self.observer.get() {
            observer.state_changed(self, state);
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.lock().unwrap().current
    }

    /// Snapshot of the transition log.
    pub fn state_log(&self) -> Vec<StateItem> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn up_begin_time(&self) -> Option<DateTime<Utc>> {
        from_millis(self.up_begin_ms.load(Ordering::Relaxed))
    }

    pub fn up_end_time(&self) -> Option<DateTime<Utc>> {
        from_millis(self.up_end_ms.load(Ordering::Relaxed))
    }

    pub fn down_begin_time(&self) -> Option<DateTime<Utc>> {
        from_millis(self.down_begin_ms.load(Ordering::Relaxed))
    }

    pub fn down_end_time(&self) -> Option<DateTime<Utc>> {
        from_millis(self.down_end_ms.load(Ordering::Relaxed))
    }

    /// Average upstream throughput in bytes per second; zero when no data
    /// moved or everything landed in a single instant.
    pub fn up_avg_speed(&self) -> f64 {
        avg_speed(
            self.up_bytes(),
            self.up_begin_ms.load(Ordering::Relaxed),
            self.up_end_ms.load(Ordering::Relaxed),
        )
    }

    pub fn down_avg_speed(&self) -> f64 {
        avg_speed(
            self.down_bytes(),
            self.down_begin_ms.load(Ordering::Relaxed),
            self.down_end_ms.load(Ordering::Relaxed),
        )
    }
}

fn avg_speed(bytes: u64, begin_ms: i64, end_ms: i64) -> f64 {
    if begin_ms == 0 || begin_ms == end_ms {
        return 0.0;
    }
    bytes as f64 / ((end_ms - begin_ms) as f64 / 1000.0)
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    if ms == 0 {
        return None;
    }
    Utc.timestamp_millis_opt(ms).single()
}
