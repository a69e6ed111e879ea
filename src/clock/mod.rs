//! Hybrid logical clock.
//!
//! Every mutation in Meridian is stamped with a [`Timestamp`] drawn from a
//! [`HybridLogicalClock`]: a physical component (unix microseconds), a
//! logical counter that absorbs same-microsecond bursts, and the node id as
//! a final tie-breaker. The tuple orders lexicographically, which gives a
//! total order over events across the cluster that respects causality —
//! after `update(m)` for any received timestamp `m`, the next `now()`
//! strictly dominates `m`.
//!
//! [`ThreadLocalClock`] wraps the shared clock with a per-thread batch of
//! reserved logical values so hot write paths do not serialize on the
//! clock mutex for every timestamp.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Logical values reserved per thread-local refill.
const LOGICAL_BATCH: u32 = 50;

/// Physical-vs-wall lag above which a backwards-clock warning is emitted,
/// in microseconds.
const SKEW_WARN_THRESHOLD_US: i64 = 5_000_000;

/// Minimum interval between backwards-clock warnings.
const SKEW_WARN_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

/// A hybrid logical timestamp.
///
/// Ordering is lexicographic over `(wall, logical, node_id)`, so any two
/// timestamps from distinct nodes are strictly ordered.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp {
    /// Physical time in unix microseconds.
    pub wall: i64,
    /// Logical counter disambiguating events within one microsecond.
    pub logical: u32,
    /// Originating node id, the final tie-breaker.
    pub node_id: u32,
}

impl Timestamp {
    /// Create a timestamp from its components.
    pub const fn new(wall: i64, logical: u32, node_id: u32) -> Self {
        Self {
            wall,
            logical,
            node_id,
        }
    }

    /// The zero timestamp, ordered before every real event.
    pub const fn zero() -> Self {
        Self::new(0, 0, 0)
    }

    /// Whether this is the zero timestamp (no recorded writer).
    pub fn is_zero(&self) -> bool {
        *self == Self::zero()
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.wall, self.logical, self.node_id)
    }
}

/// Current physical time in unix microseconds.
fn physical_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as i64
}

struct ClockState {
    max_wall: i64,
    max_logical: u32,
    last_skew_warn: Option<Instant>,
}

/// Shared hybrid logical clock.
///
/// `now()` never returns a value less than or equal to any previously
/// returned timestamp on this process. `update()` folds a received
/// timestamp in so subsequent local events are ordered after it.
pub struct HybridLogicalClock {
    state: Mutex<ClockState>,
    node_id: u32,
}

impl HybridLogicalClock {
    /// Create a clock for the given node id.
    pub fn new(node_id: u32) -> Self {
        Self {
            state: Mutex::new(ClockState {
                max_wall: 0,
                max_logical: 0,
                last_skew_warn: None,
            }),
            node_id,
        }
    }

    /// The node id stamped into every timestamp.
    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    /// Produce the next timestamp (send event).
    pub fn now(&self) -> Timestamp {
        loop {
            let phys = physical_now();
            let mut s = self.state.lock();

            if phys > s.max_wall {
                s.max_wall = phys;
                s.max_logical = 0;
            } else {
                self.maybe_warn_skew(&mut s, phys);
                match s.max_logical.checked_add(1) {
                    Some(l) => s.max_logical = l,
                    None => {
                        // Logical space for this wall tick is exhausted.
                        // Wait out the remainder of the microsecond.
                        let stuck_wall = s.max_wall;
                        drop(s);
                        self.wait_for_tick(stuck_wall);
                        continue;
                    }
                }
            }

            return Timestamp::new(s.max_wall, s.max_logical, self.node_id);
        }
    }

    /// Fold a received timestamp into the clock (receive event).
    ///
    /// After this call the next `now()` strictly dominates `incoming`.
    pub fn update(&self, incoming: Timestamp) {
        loop {
            let phys = physical_now();
            let mut s = self.state.lock();

            let wall_old = s.max_wall;
            let logical_old = s.max_logical;
            let new_wall = wall_old.max(incoming.wall).max(phys);

            let new_logical = if new_wall == wall_old && new_wall == incoming.wall {
                logical_old.max(incoming.logical).checked_add(1)
            } else if new_wall == wall_old {
                logical_old.checked_add(1)
            } else if new_wall == incoming.wall {
                incoming.logical.checked_add(1)
            } else {
                Some(0)
            };

            match new_logical {
                Some(l) => {
                    s.max_wall = new_wall;
                    s.max_logical = l;
                    return;
                }
                None => {
                    drop(s);
                    self.wait_for_tick(new_wall);
                    continue;
                }
            }
        }
    }

    /// Reserve `count` consecutive logical values under `for_phys_time`.
    ///
    /// Returns the first reserved value, or `None` when the clock has
    /// already advanced past `for_phys_time` (the caller should refresh its
    /// physical time and retry) or when the reservation would exhaust the
    /// logical space for this tick.
    pub fn reserve_logical(&self, for_phys_time: i64, count: u32) -> Option<u32> {
        debug_assert!(count > 0);
        let mut s = self.state.lock();
        let floor = physical_now().max(s.max_wall);

        if for_phys_time < floor {
            return None;
        }

        if for_phys_time > s.max_wall {
            s.max_wall = for_phys_time;
            s.max_logical = 0;
        }

        let start = s.max_logical.checked_add(1)?;
        s.max_logical = s.max_logical.checked_add(count)?;
        Some(start)
    }

    /// Spin until the physical clock passes `wall`. Bounded by the
    /// remainder of one physical tick.
    fn wait_for_tick(&self, wall: i64) {
        while physical_now() <= wall {
            std::thread::yield_now();
        }
    }

    fn maybe_warn_skew(&self, s: &mut ClockState, phys: i64) {
        if s.max_wall - phys <= SKEW_WARN_THRESHOLD_US {
            return;
        }
        let due = s
            .last_skew_warn
            .map_or(true, |t| t.elapsed() >= SKEW_WARN_INTERVAL);
        if due {
            s.last_skew_warn = Some(Instant::now());
            tracing::warn!(
                lag_us = s.max_wall - phys,
                "physical clock is behind the hybrid clock wall; timestamps are running on the logical counter"
            );
        }
    }
}

/// Per-thread timestamp batcher over a shared [`HybridLogicalClock`].
///
/// Reserves logical values in batches of [`LOGICAL_BATCH`] and hands them
/// out without touching the clock mutex while the physical microsecond and
/// the batch last. Falls back to the shared `now()` when the shared clock
/// has run ahead (a receive event advanced it); the fallback invalidates
/// the cached batch so later cache hits cannot order below it.
///
/// Not `Sync`: each worker thread owns its own instance.
pub struct ThreadLocalClock {
    global: Arc<HybridLogicalClock>,
    cached_phys: Cell<i64>,
    next_logical: Cell<u32>,
    end_logical: Cell<u32>,
}

impl ThreadLocalClock {
    /// Wrap the shared clock.
    pub fn new(global: Arc<HybridLogicalClock>) -> Self {
        Self {
            global,
            cached_phys: Cell::new(0),
            next_logical: Cell::new(0),
            end_logical: Cell::new(0),
        }
    }

    /// Produce the next timestamp, preferring the cached batch.
    pub fn now(&self) -> Timestamp {
        let mut phys = physical_now();

        if phys == self.cached_phys.get() {
            let next = self.next_logical.get();
            if next < self.end_logical.get() {
                self.next_logical.set(next + 1);
                return Timestamp::new(phys, next, self.global.node_id());
            }
        } else if phys > self.cached_phys.get() {
            // Time moved forward; the old batch is dead.
            self.cached_phys.set(phys);
            self.next_logical.set(0);
            self.end_logical.set(0);
        }

        loop {
            if let Some(start) = self.global.reserve_logical(phys, LOGICAL_BATCH) {
                self.cached_phys.set(phys);
                self.next_logical.set(start + 1);
                self.end_logical.set(start.saturating_add(LOGICAL_BATCH));
                return Timestamp::new(phys, start, self.global.node_id());
            }

            let refreshed = physical_now();
            if refreshed == phys {
                // The shared clock is ahead of physical time (receive events
                // pushed it forward). Take a shared timestamp and drop the
                // batch so nothing cached can order below it.
                let ts = self.global.now();
                self.cached_phys.set(ts.wall);
                self.next_logical.set(0);
                self.end_logical.set(0);
                return ts;
            }
            phys = refreshed;
        }
    }

    /// Fold a received timestamp into the shared clock.
    pub fn update(&self, incoming: Timestamp) {
        self.global.update(incoming);
    }
}
