//! Connection records for attached WebSocket clients

use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// A live WebSocket client attachment
///
/// Created by the gate on accept and destroyed on close or stale eviction.
/// The session id stays empty until the first packet carrying one arrives,
/// then never changes for the lifetime of the connection.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Server-generated unique id
    pub id: String,

    /// Bound session id, empty until the first session-bearing packet
    pub session_id: String,

    /// Instant of the most recent read from this connection
    pub last_seen: Instant,

    /// API key presented at admission
    pub api_key: String,
}

impl Connection {
    /// Create a fresh connection record
    ///
    /// The id combines wall-clock nanoseconds with a per-process sequence
    /// number so concurrent accepts never collide.
    pub fn new(api_key: impl Into<String>, sequence: u64) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);

        Self {
            id: format!("conn_{}_{}", nanos, sequence),
            session_id: String::new(),
            last_seen: Instant::now(),
            api_key: api_key.into(),
        }
    }

    /// Whether this connection has gone silent past the given threshold
    pub fn is_stale(&self, now: Instant, threshold: std::time::Duration) -> bool {
        now.duration_since(self.last_seen) > threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn fresh_connections_get_distinct_ids() {
        let a = Connection::new("key", 1);
        let b = Connection::new("key", 2);
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("conn_"));
    }

    #[test]
    fn new_connection_is_unbound_and_not_stale() {
        let conn = Connection::new("key", 0);
        assert!(conn.session_id.is_empty());
        assert!(!conn.is_stale(Instant::now(), Duration::from_secs(90)));
    }

    #[test]
    fn connection_goes_stale_past_threshold() {
        let conn = Connection::new("key", 0);
        let later = Instant::now() + Duration::from_secs(120);
        assert!(conn.is_stale(later, Duration::from_secs(90)));
    }
}
