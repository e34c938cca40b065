//! Identifier generation.
//!
//! Presence keys and connection IDs default to time-ordered unique strings:
//! a millisecond timestamp followed by an atomic counter, so IDs sort by
//! creation time and never collide within a process.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static KEY_COUNTER: AtomicU64 = AtomicU64::new(0);

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Generate a time-ordered presence key for a connection that did not
/// supply one.
#[must_use]
pub fn generate_presence_key() -> String {
    let counter = KEY_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:012x}-{:06x}", now_millis(), counter & 0xFF_FFFF)
}

/// Generate a connection identifier.
#[must_use]
pub fn generate_connection_id() -> String {
    let counter = KEY_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("conn_{:012x}{:06x}", now_millis(), counter & 0xFF_FFFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presence_keys_unique() {
        let a = generate_presence_key();
        let b = generate_presence_key();
        assert_ne!(a, b);
    }

    #[test]
    fn test_connection_id_prefix() {
        let id = generate_connection_id();
        assert!(id.starts_with("conn_"));
    }

    #[test]
    fn test_keys_time_ordered_within_same_millisecond() {
        // Counter suffix keeps keys strictly increasing even when minted
        // in the same millisecond.
        let keys: Vec<String> = (0..100).map(|_| generate_presence_key()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }
}
