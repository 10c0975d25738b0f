//! Protocol timing constants
//!
//! The heartbeat/idle pair is load-bearing: liveness is `2×` the heartbeat
//! period, the read deadline and relay-app idle cutoff are `3×`. Changing
//! one without the others breaks the liveness invariants.

use std::time::Duration;

/// Interval between tunnel heartbeats
pub const TUNNEL_HEARTBEAT_TIME: Duration = Duration::from_secs(30);

/// Read deadline per tunnel read and relay-app liveness cutoff
pub const TUNNEL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Budget for establishing one underlay connection
pub const UNDERLAY_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Budget for one rendezvous read
pub const READ_MSG_TIMEOUT: Duration = Duration::from_secs(5);

/// Margin the listening side adds when scheduling the shared punch instant
pub const PUNCH_TS_DELAY: Duration = Duration::from_millis(1500);

/// Interval between rendezvous heartbeats (also the clock-sync sampling
/// period the drift EMA is normalized to)
pub const NETWORK_HEARTBEAT_TIME: Duration = Duration::from_secs(50);

/// How long a synchronous liveness probe waits for a heartbeat ack
pub const CHECK_ACTIVE_TIMEOUT: Duration = Duration::from_secs(5);
