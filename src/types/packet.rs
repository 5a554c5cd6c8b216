//! Inbound packet types for the StreamKit wire protocol

use serde::{Deserialize, Serialize};

/// Raw telemetry packet received from a StreamKit client
///
/// This is the fundamental data unit that flows into the pipeline.
/// One packet carries either a pose sample or a mesh update, never both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamPacket {
    /// Client-chosen session identifier
    pub session_id: String,

    /// Monotonic frame counter from the client
    pub frame_number: u64,

    /// Capture timestamp in milliseconds since the Unix epoch
    pub timestamp: i64,

    /// Payload discriminator
    #[serde(rename = "type")]
    pub packet_type: PacketType,

    /// The payload itself
    #[serde(default)]
    pub data: PacketData,
}

/// Packet payload discriminator
///
/// Clients may send types this relay does not understand; those decode to
/// [`PacketType::Unknown`] and are rejected by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketType {
    Pose,
    Mesh,
    #[serde(other)]
    Unknown,
}

impl PacketType {
    /// Stable label for logging and metric dimensions
    pub fn as_str(self) -> &'static str {
        match self {
            PacketType::Pose => "pose",
            PacketType::Mesh => "mesh",
            PacketType::Unknown => "unknown",
        }
    }
}

/// Container for exactly one of the payload kinds
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PacketData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pose: Option<PoseData>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesh: Option<MeshData>,
}

/// Spatial position plus orientation quaternion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseData {
    pub x: f64,
    pub y: f64,
    pub z: f64,

    /// Quaternion components [x, y, z, w]
    pub rotation: [f64; 4],
}

/// 3D mesh geometry associated with a client-side anchor
///
/// Vertex and face buffers travel as base64 strings on the wire and may be
/// gzip-compressed; the parser decompresses them when the magic bytes match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshData {
    #[serde(default, with = "base64_bytes")]
    pub vertices: Vec<u8>,

    #[serde(default, with = "base64_bytes")]
    pub faces: Vec<u8>,

    pub anchor_id: String,
}

/// Serde adapter encoding byte buffers as base64 strings in JSON
pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
    }
}
