//! Packet-to-event transformation with stable anchor identity
//!
//! The transformer builds one [`SpatialEvent`] per validated packet. Pose
//! packets are keyed to a server-allocated anchor id that stays stable for
//! the lifetime of the session; mesh packets carry the client-supplied
//! anchor id straight through. The two id spaces never cross-reference.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;
use uuid::Uuid;

use crate::error::{RelayError, Result};
use crate::types::{Anchor, MeshDiff, PacketType, SpatialEvent, StreamPacket};

/// Timestamps below this are treated as seconds rather than milliseconds
const MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

/// Accepted clock skew: one minute into the future
const MAX_FUTURE_SKEW_MS: i64 = 60_000;

/// Accepted clock lag: one hour into the past
const MAX_PAST_LAG_MS: i64 = 3_600_000;

/// Converts stream packets into spatial events
pub struct Transformer {
    /// session id -> allocated anchor id
    anchor_map: Mutex<HashMap<String, String>>,
}

impl Default for Transformer {
    fn default() -> Self {
        Self::new()
    }
}

impl Transformer {
    pub fn new() -> Self {
        Self { anchor_map: Mutex::new(HashMap::new()) }
    }

    /// Build a spatial event from a validated packet.
    ///
    /// Unknown packet types produce an empty event (no anchors, no meshes)
    /// which the updater treats as a no-op.
    pub fn transform(&self, packet: &StreamPacket) -> Result<SpatialEvent> {
        let mut event = SpatialEvent {
            session_id: packet.session_id.clone(),
            event_id: Uuid::new_v4().to_string(),
            timestamp: packet.timestamp,
            anchors: Vec::new(),
            meshes: Vec::new(),
        };

        match packet.packet_type {
            PacketType::Pose => {
                if let Some(pose) = &packet.data.pose {
                    let anchor_id = self.get_or_create_anchor_id(&packet.session_id);
                    event.anchors.push(Anchor {
                        id: anchor_id,
                        pose: pose.clone(),
                        timestamp: packet.timestamp,
                    });
                }
            }
            PacketType::Mesh => {
                if let Some(mesh) = &packet.data.mesh {
                    // Full mesh at this stage; the updater decides whether it
                    // becomes a delta.
                    event.meshes.push(MeshDiff {
                        anchor_id: mesh.anchor_id.clone(),
                        vertices_delta: mesh.vertices.clone(),
                        faces_delta: mesh.faces.clone(),
                        is_delta: false,
                    });
                }
            }
            PacketType::Unknown => {}
        }

        Ok(event)
    }

    /// Return the session's anchor id, allocating one on first use.
    ///
    /// The returned id is a pure function of the session id for the lifetime
    /// of this transformer: every packet of a session sees the same id until
    /// the session is explicitly cleared.
    pub fn get_or_create_anchor_id(&self, session_id: &str) -> String {
        let mut anchor_map = self.anchor_map.lock().expect("anchor map lock poisoned");
        anchor_map
            .entry(session_id.to_string())
            .or_insert_with(|| format!("anchor_{}", Uuid::new_v4()))
            .clone()
    }

    /// Look up the anchor id allocated for a session, if any.
    pub fn anchor_for_session(&self, session_id: &str) -> Option<String> {
        self.anchor_map.lock().expect("anchor map lock poisoned").get(session_id).cloned()
    }

    /// Coerce a client timestamp into Unix milliseconds.
    ///
    /// Second-scale timestamps are scaled up; anything more than a minute in
    /// the future or an hour in the past is replaced with the server clock.
    pub fn normalize_timestamp(&self, timestamp: i64) -> i64 {
        let now = unix_millis();

        let timestamp =
            if timestamp < MILLIS_THRESHOLD { timestamp.saturating_mul(1000) } else { timestamp };

        if timestamp > now + MAX_FUTURE_SKEW_MS || timestamp < now - MAX_PAST_LAG_MS {
            return now;
        }

        timestamp
    }

    /// Final validation of a transformed event.
    pub fn validate_event(&self, event: &SpatialEvent) -> Result<()> {
        if event.session_id.is_empty() {
            return Err(RelayError::invalid_packet("missing session ID"));
        }
        if event.event_id.is_empty() {
            return Err(RelayError::invalid_packet("missing event ID"));
        }
        if event.timestamp <= 0 {
            return Err(RelayError::invalid_packet("invalid timestamp"));
        }
        Ok(())
    }

    /// Number of sessions with an allocated anchor id.
    pub fn active_sessions(&self) -> usize {
        self.anchor_map.lock().expect("anchor map lock poisoned").len()
    }

    /// Drop the anchor mapping for a session that has gone away.
    pub fn clear_stale_session(&self, session_id: &str) {
        if self.anchor_map.lock().expect("anchor map lock poisoned").remove(session_id).is_some() {
            debug!("cleared anchor mapping for stale session {}", session_id);
        }
    }
}

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MeshData, PacketData, PoseData};

    use proptest::prelude::*;

    fn pose_packet(session_id: &str) -> StreamPacket {
        StreamPacket {
            session_id: session_id.to_string(),
            frame_number: 1,
            timestamp: 1_700_000_000_000,
            packet_type: PacketType::Pose,
            data: PacketData {
                pose: Some(PoseData { x: 1.0, y: 2.0, z: 3.0, rotation: [0.0, 0.0, 0.0, 1.0] }),
                mesh: None,
            },
        }
    }

    fn mesh_packet(session_id: &str, anchor_id: &str) -> StreamPacket {
        StreamPacket {
            session_id: session_id.to_string(),
            frame_number: 1,
            timestamp: 1_700_000_000_000,
            packet_type: PacketType::Mesh,
            data: PacketData {
                pose: None,
                mesh: Some(MeshData {
                    vertices: vec![1, 2, 3],
                    faces: vec![0, 1],
                    anchor_id: anchor_id.to_string(),
                }),
            },
        }
    }

    #[test]
    fn pose_event_carries_one_anchor() {
        let transformer = Transformer::new();
        let event = transformer.transform(&pose_packet("s1")).expect("transform");

        assert_eq!(event.session_id, "s1");
        assert!(!event.event_id.is_empty());
        assert_eq!(event.timestamp, 1_700_000_000_000);
        assert_eq!(event.anchors.len(), 1);
        assert!(event.meshes.is_empty());

        let anchor = &event.anchors[0];
        assert!(anchor.id.starts_with("anchor_"));
        assert_eq!(anchor.pose.x, 1.0);
        assert_eq!(anchor.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn anchor_id_is_stable_within_a_session() {
        let transformer = Transformer::new();
        let first = transformer.transform(&pose_packet("s1")).expect("transform");
        let second = transformer.transform(&pose_packet("s1")).expect("transform");

        assert_eq!(first.anchors[0].id, second.anchors[0].id);
        // Event ids are fresh every time.
        assert_ne!(first.event_id, second.event_id);
    }

    #[test]
    fn distinct_sessions_get_distinct_anchor_ids() {
        let transformer = Transformer::new();
        let a = transformer.transform(&pose_packet("s1")).expect("transform");
        let b = transformer.transform(&pose_packet("s2")).expect("transform");
        assert_ne!(a.anchors[0].id, b.anchors[0].id);
        assert_eq!(transformer.active_sessions(), 2);
    }

    #[test]
    fn mesh_event_passes_client_anchor_id_through() {
        let transformer = Transformer::new();
        let event = transformer.transform(&mesh_packet("s1", "client-anchor-7")).expect("transform");

        assert!(event.anchors.is_empty());
        assert_eq!(event.meshes.len(), 1);
        let diff = &event.meshes[0];
        assert_eq!(diff.anchor_id, "client-anchor-7");
        assert_eq!(diff.vertices_delta, vec![1, 2, 3]);
        assert_eq!(diff.faces_delta, vec![0, 1]);
        assert!(!diff.is_delta);

        // Mesh packets never allocate server-side anchor ids.
        assert_eq!(transformer.active_sessions(), 0);
    }

    #[test]
    fn unknown_type_yields_empty_event() {
        let transformer = Transformer::new();
        let mut packet = pose_packet("s1");
        packet.packet_type = PacketType::Unknown;

        let event = transformer.transform(&packet).expect("transform");
        assert!(event.anchors.is_empty());
        assert!(event.meshes.is_empty());
        assert_eq!(event.session_id, "s1");
    }

    #[test]
    fn clear_stale_session_forgets_the_mapping() {
        let transformer = Transformer::new();
        let before = transformer.transform(&pose_packet("s1")).expect("transform");

        transformer.clear_stale_session("s1");
        assert_eq!(transformer.active_sessions(), 0);
        assert!(transformer.anchor_for_session("s1").is_none());

        let after = transformer.transform(&pose_packet("s1")).expect("transform");
        assert_ne!(before.anchors[0].id, after.anchors[0].id);
    }

    #[test]
    fn normalize_converts_second_scale_timestamps() {
        let transformer = Transformer::new();
        let now_secs = unix_millis() / 1000;
        let normalized = transformer.normalize_timestamp(now_secs);
        // Scaled into milliseconds and within the accepted window.
        assert!((normalized - now_secs * 1000).abs() <= MAX_FUTURE_SKEW_MS);
    }

    #[test]
    fn normalize_replaces_out_of_window_timestamps() {
        let transformer = Transformer::new();
        let now = unix_millis();

        let far_future = now + 10 * 60_000;
        let clamped = transformer.normalize_timestamp(far_future);
        assert!((clamped - now).abs() < 5_000);

        let far_past = now - 2 * MAX_PAST_LAG_MS;
        let clamped = transformer.normalize_timestamp(far_past);
        assert!((clamped - now).abs() < 5_000);
    }

    #[test]
    fn normalize_passes_current_millis_through() {
        let transformer = Transformer::new();
        let now = unix_millis();
        assert_eq!(transformer.normalize_timestamp(now), now);
    }

    #[test]
    fn validate_event_rejects_incomplete_events() {
        let transformer = Transformer::new();
        let good = SpatialEvent {
            session_id: "s1".to_string(),
            event_id: "e1".to_string(),
            timestamp: 1,
            anchors: Vec::new(),
            meshes: Vec::new(),
        };
        assert!(transformer.validate_event(&good).is_ok());

        let mut bad = good.clone();
        bad.session_id.clear();
        assert!(transformer.validate_event(&bad).is_err());

        let mut bad = good.clone();
        bad.event_id.clear();
        assert!(transformer.validate_event(&bad).is_err());

        let mut bad = good;
        bad.timestamp = 0;
        assert!(transformer.validate_event(&bad).is_err());
    }

    proptest! {
        #[test]
        fn anchor_ids_partition_by_session(
            sessions in proptest::collection::vec("[a-z]{1,8}", 2..6),
        ) {
            let transformer = Transformer::new();
            let mut seen: std::collections::HashMap<String, String> = Default::default();

            // Interleave repeated packets across sessions.
            for _ in 0..3 {
                for session in &sessions {
                    let event = transformer.transform(&pose_packet(session)).expect("transform");
                    let anchor_id = event.anchors[0].id.clone();
                    match seen.get(session) {
                        Some(known) => prop_assert_eq!(known, &anchor_id),
                        None => {
                            // A new session must not reuse another session's id.
                            prop_assert!(seen.values().all(|other| other != &anchor_id));
                            seen.insert(session.clone(), anchor_id);
                        }
                    }
                }
            }
        }
    }
}
