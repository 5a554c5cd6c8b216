//! Outbound event types delivered to the STAG analytics sink

use serde::{Deserialize, Serialize};

use super::packet::{base64_bytes, PoseData};

/// Processed spatial event, the unit of delivery to the sink
///
/// At most one of `anchors` / `meshes` is non-empty per event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpatialEvent {
    pub session_id: String,

    /// Freshly generated unique id; the sink deduplicates on it
    pub event_id: String,

    /// Milliseconds since the Unix epoch
    pub timestamp: i64,

    pub anchors: Vec<Anchor>,
    pub meshes: Vec<MeshDiff>,
}

/// A spatial reference point with its latest pose
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anchor {
    pub id: String,
    pub pose: PoseData,
    pub timestamp: i64,
}

/// A (possibly delta-encoded) mesh change for one anchor
///
/// When `is_delta` is true the vertex payload is an XOR delta against the
/// last transmitted vertex buffer for this anchor id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshDiff {
    pub anchor_id: String,

    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub vertices_delta: Vec<u8>,

    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub faces_delta: Vec<u8>,

    pub is_delta: bool,
}

/// One HTTP POST worth of events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBatch {
    pub events: Vec<SpatialEvent>,

    /// Server-side dispatch timestamp in milliseconds
    pub timestamp: i64,

    pub count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_mesh_buffers_are_omitted_on_the_wire() {
        let diff = MeshDiff {
            anchor_id: "a1".to_string(),
            vertices_delta: vec![1, 2, 3],
            faces_delta: Vec::new(),
            is_delta: false,
        };

        let encoded = serde_json::to_string(&diff).expect("serialize");
        assert!(encoded.contains("vertices_delta"));
        assert!(!encoded.contains("faces_delta"));

        let decoded: MeshDiff = serde_json::from_str(&encoded).expect("deserialize");
        assert_eq!(decoded.vertices_delta, vec![1, 2, 3]);
        assert!(decoded.faces_delta.is_empty());
        assert!(!decoded.is_delta);
    }

    #[test]
    fn batch_serializes_with_count_and_timestamp() {
        let batch = EventBatch {
            events: vec![SpatialEvent {
                session_id: "s1".to_string(),
                event_id: "e1".to_string(),
                timestamp: 42,
                anchors: Vec::new(),
                meshes: Vec::new(),
            }],
            timestamp: 1_700_000_000_000,
            count: 1,
        };

        let value: serde_json::Value =
            serde_json::to_value(&batch).expect("batch should serialize");
        assert_eq!(value["count"], 1);
        assert_eq!(value["timestamp"], 1_700_000_000_000i64);
        assert_eq!(value["events"][0]["session_id"], "s1");
    }
}
