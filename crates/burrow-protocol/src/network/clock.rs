//! Server-clock synchronization for punch scheduling
//!
//! Every rendezvous heartbeat response carries the server's wall clock.
//! `dt` is the latest offset `server − local`; `ddtma` is an exponential
//! moving average of its first derivative, i.e. the relative clock drift
//! per heartbeat period. Sleeping until
//!
//! `punch_ts + dt + ddtma · (elapsed + PunchTsDelay) / NetworkHeartbeatTime`
//!
//! puts both peers within a millisecond of the shared instant even when
//! their clocks drift.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::timings::{NETWORK_HEARTBEAT_TIME, PUNCH_TS_DELAY};

/// EMA denominator for the drift estimate
const DRIFT_EMA_WEIGHT: i64 = 8;

/// Local wall clock in nanoseconds since the epoch.
pub fn local_now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Clock offset and drift state
#[derive(Debug, Clone)]
pub struct ClockSync {
    /// `server − local` at the last observation, nanoseconds
    dt: i64,
    /// EMA of the per-heartbeat change of `dt`, nanoseconds
    ddtma: i64,
    /// When the last observation arrived
    observed_at: Option<Instant>,
    samples: u64,
}

impl Default for ClockSync {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSync {
    /// Unsynchronized state: zero offset, zero drift.
    pub fn new() -> Self {
        Self {
            dt: 0,
            ddtma: 0,
            observed_at: None,
            samples: 0,
        }
    }

    /// Feed one server timestamp paired with the local receive time.
    pub fn observe(&mut self, server_ts_ns: i64, local_ns: i64) {
        let dt = server_ts_ns - local_ns;
        if self.samples > 0 {
            let ddt = dt - self.dt;
            if self.samples == 1 {
                self.ddtma = ddt;
            } else {
                self.ddtma += (ddt - self.ddtma) / DRIFT_EMA_WEIGHT;
            }
        }
        self.dt = dt;
        self.observed_at = Some(Instant::now());
        self.samples += 1;
    }

    /// Latest offset `server − local` in nanoseconds.
    pub fn dt(&self) -> i64 {
        self.dt
    }

    /// Drift EMA in nanoseconds per heartbeat period.
    pub fn ddtma(&self) -> i64 {
        self.ddtma
    }

    /// Whether any server timestamp was seen yet.
    pub fn synced(&self) -> bool {
        self.samples > 0
    }

    /// Time since the last observation (zero before the first).
    pub fn elapsed_since_observation(&self) -> Duration {
        self.observed_at.map(|t| t.elapsed()).unwrap_or_default()
    }

    /// How long to sleep from `now_ns` so waking lands on `punch_ts`
    /// (a server-clock instant), drift-corrected. Saturates at zero when
    /// the instant already passed.
    pub fn punch_delay(&self, punch_ts_ns: u64, now_ns: i64) -> Duration {
        self.punch_delay_at(punch_ts_ns, now_ns, self.elapsed_since_observation())
    }

    /// [`Self::punch_delay`] with the elapsed time injected (testable form).
    pub fn punch_delay_at(&self, punch_ts_ns: u64, now_ns: i64, elapsed: Duration) -> Duration {
        let horizon = (elapsed + PUNCH_TS_DELAY).as_nanos() as i64;
        let period = NETWORK_HEARTBEAT_TIME.as_nanos() as i64;
        let target = punch_ts_ns as i64 + self.dt + self.ddtma * horizon / period;
        let delay = target - now_ns;
        if delay <= 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(delay as u64)
        }
    }

    /// Build the punch instant a listening side advertises: local now plus
    /// the scheduling margin, expressed on the server clock.
    pub fn make_punch_ts(&self, now_ns: i64) -> u64 {
        (now_ns + PUNCH_TS_DELAY.as_nanos() as i64 - self.dt).max(0) as u64
    }
}
