//! Protocol version and the dotted-version compare

use std::cmp::Ordering;

/// Version string advertised in signaling exchanges
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Peers below this version do not understand server-clock punch alignment
/// and punch on their local clock instead
pub const SYNC_SERVER_TIME_VERSION: &str = "0.1.0";

/// Compare two dotted version strings numerically, component by component.
/// Non-numeric components count as zero; a missing component loses.
pub fn compare_version(a: &str, b: &str) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }
    let b_parts: Vec<i64> = b.split('.').map(|p| p.parse().unwrap_or(0)).collect();
    for (i, part) in a.split('.').enumerate() {
        let Some(&b_part) = b_parts.get(i) else {
            return Ordering::Greater;
        };
        let a_part: i64 = part.parse().unwrap_or(0);
        match a_part.cmp(&b_part) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Less
}

/// Whether a peer at `version` understands server-clock punch alignment.
pub fn supports_server_time(version: &str) -> bool {
    compare_version(version, SYNC_SERVER_TIME_VERSION) != Ordering::Less
}
