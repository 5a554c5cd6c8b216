//! Packet validation and payload decompression
//!
//! The parser is the first pipeline stage after the gate: it shape-validates
//! one packet and decompresses gzip mesh payloads. It is pure per call and
//! holds no state; a packet that fails validation is dropped by the caller.

use std::io::Read;

use flate2::read::GzDecoder;
use tracing::debug;

use crate::error::{RelayError, Result};
use crate::types::{MeshData, PacketType, PoseData, StreamPacket};

/// Position components must lie within this many meters of the origin
const POSITION_BOUND: f64 = 1000.0;

/// Accepted window for the squared quaternion magnitude; tolerates slightly
/// un-normalised rotations but rejects degenerate ones
const QUAT_MAGNITUDE_SQ_MIN: f64 = 0.9;
const QUAT_MAGNITUDE_SQ_MAX: f64 = 1.1;

/// Validates stream packets and decompresses mesh payloads
#[derive(Debug, Default)]
pub struct Parser;

impl Parser {
    pub fn new() -> Self {
        Self
    }

    /// Validate one packet and return it with mesh buffers decompressed.
    ///
    /// Fails with [`RelayError::InvalidPacket`] on any shape or bounds
    /// violation. Decompression failure is not an error: buffers that do not
    /// decode as gzip are kept as raw bytes.
    pub fn parse_packet(&self, packet: &StreamPacket) -> Result<StreamPacket> {
        self.validate_packet(packet)?;

        match packet.packet_type {
            PacketType::Pose => self.parse_pose_packet(packet),
            PacketType::Mesh => self.parse_mesh_packet(packet),
            PacketType::Unknown => Err(RelayError::invalid_packet("unknown packet type")),
        }
    }

    fn validate_packet(&self, packet: &StreamPacket) -> Result<()> {
        if packet.session_id.is_empty() {
            return Err(RelayError::invalid_packet("missing session_id"));
        }
        if packet.timestamp <= 0 {
            return Err(RelayError::invalid_packet("invalid timestamp"));
        }
        Ok(())
    }

    fn parse_pose_packet(&self, packet: &StreamPacket) -> Result<StreamPacket> {
        let pose = packet
            .data
            .pose
            .as_ref()
            .ok_or_else(|| RelayError::invalid_packet("missing pose data"))?;

        self.validate_pose(pose)?;

        // Pose packets carry no compressed payloads.
        Ok(packet.clone())
    }

    fn parse_mesh_packet(&self, packet: &StreamPacket) -> Result<StreamPacket> {
        let mesh = packet
            .data
            .mesh
            .as_ref()
            .ok_or_else(|| RelayError::invalid_packet("missing mesh data"))?;

        if mesh.vertices.is_empty() {
            return Err(RelayError::invalid_packet("empty vertices data"));
        }
        if mesh.anchor_id.is_empty() {
            return Err(RelayError::invalid_packet("missing anchor_id"));
        }

        let vertices = decompress(&mesh.vertices).unwrap_or_else(|| mesh.vertices.clone());
        let faces = if mesh.faces.is_empty() {
            Vec::new()
        } else {
            decompress(&mesh.faces).unwrap_or_else(|| mesh.faces.clone())
        };

        let mut parsed = packet.clone();
        parsed.data.mesh =
            Some(MeshData { vertices, faces, anchor_id: mesh.anchor_id.clone() });
        Ok(parsed)
    }

    fn validate_pose(&self, pose: &PoseData) -> Result<()> {
        if pose.x.abs() > POSITION_BOUND
            || pose.y.abs() > POSITION_BOUND
            || pose.z.abs() > POSITION_BOUND
        {
            return Err(RelayError::invalid_packet("pose position out of bounds"));
        }

        let [qx, qy, qz, qw] = pose.rotation;
        let magnitude_sq = qx * qx + qy * qy + qz * qz + qw * qw;
        if !(QUAT_MAGNITUDE_SQ_MIN..=QUAT_MAGNITUDE_SQ_MAX).contains(&magnitude_sq) {
            return Err(RelayError::invalid_packet(format!(
                "quaternion not normalized: magnitude_sq={:.4}",
                magnitude_sq
            )));
        }

        Ok(())
    }
}

/// Attempt gzip decompression, returning `None` when the bytes are not a
/// gzip stream so the caller keeps the raw buffer.
fn decompress(data: &[u8]) -> Option<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    match decoder.read_to_end(&mut decompressed) {
        Ok(_) => {
            debug!("decompressed gzip payload: {} -> {} bytes", data.len(), decompressed.len());
            Some(decompressed)
        }
        Err(err) => {
            debug!("payload not gzip-encoded, keeping raw bytes: {}", err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PacketData, PacketType};

    use std::io::Write;

    use flate2::write::GzEncoder;
    use flate2::Compression;
    use proptest::prelude::*;

    fn pose_packet(session_id: &str, timestamp: i64, pose: PoseData) -> StreamPacket {
        StreamPacket {
            session_id: session_id.to_string(),
            frame_number: 1,
            timestamp,
            packet_type: PacketType::Pose,
            data: PacketData { pose: Some(pose), mesh: None },
        }
    }

    fn mesh_packet(vertices: Vec<u8>, faces: Vec<u8>, anchor_id: &str) -> StreamPacket {
        StreamPacket {
            session_id: "test-session".to_string(),
            frame_number: 1,
            timestamp: 1_700_000_000_000,
            packet_type: PacketType::Mesh,
            data: PacketData {
                pose: None,
                mesh: Some(MeshData { vertices, faces, anchor_id: anchor_id.to_string() }),
            },
        }
    }

    fn identity_pose() -> PoseData {
        PoseData { x: 1.0, y: 2.0, z: 3.0, rotation: [0.0, 0.0, 0.0, 1.0] }
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).expect("gzip write");
        encoder.finish().expect("gzip finish")
    }

    #[test]
    fn valid_pose_packet_passes_through() {
        let parser = Parser::new();
        let packet = pose_packet("s1", 1_700_000_000_000, identity_pose());

        let parsed = parser.parse_packet(&packet).expect("valid pose should parse");
        assert_eq!(parsed.session_id, "s1");
        assert_eq!(parsed.frame_number, 1);
        assert_eq!(parsed.timestamp, 1_700_000_000_000);
        assert_eq!(parsed.packet_type, PacketType::Pose);
        assert_eq!(parsed.data.pose, Some(identity_pose()));
    }

    #[test]
    fn missing_session_id_is_rejected() {
        let parser = Parser::new();
        let packet = pose_packet("", 1_700_000_000_000, identity_pose());
        let err = parser.parse_packet(&packet).unwrap_err();
        assert!(err.to_string().contains("missing session_id"));
    }

    #[test]
    fn non_positive_timestamp_is_rejected() {
        let parser = Parser::new();
        for timestamp in [0, -1] {
            let packet = pose_packet("s1", timestamp, identity_pose());
            assert!(parser.parse_packet(&packet).is_err());
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        let parser = Parser::new();
        let mut packet = pose_packet("s1", 1_700_000_000_000, identity_pose());
        packet.packet_type = PacketType::Unknown;
        let err = parser.parse_packet(&packet).unwrap_err();
        assert!(err.to_string().contains("unknown packet type"));
    }

    #[test]
    fn position_bounds_are_inclusive() {
        let parser = Parser::new();

        let on_bound = PoseData { x: 1000.0, y: -1000.0, z: 1000.0, rotation: [0.0, 0.0, 0.0, 1.0] };
        assert!(parser.parse_packet(&pose_packet("s1", 1, on_bound)).is_ok());

        let outside = PoseData { x: 1000.1, y: 0.0, z: 0.0, rotation: [0.0, 0.0, 0.0, 1.0] };
        let err = parser.parse_packet(&pose_packet("s1", 1, outside)).unwrap_err();
        assert!(err.to_string().contains("out of bounds"));
    }

    #[test]
    fn quaternion_magnitude_window_is_inclusive() {
        let parser = Parser::new();

        // magnitude_sq exactly 0.9 and 1.1
        for magnitude_sq in [0.9f64, 1.1] {
            let w = magnitude_sq.sqrt();
            let pose = PoseData { x: 0.0, y: 0.0, z: 0.0, rotation: [0.0, 0.0, 0.0, w] };
            assert!(
                parser.parse_packet(&pose_packet("s1", 1, pose)).is_ok(),
                "magnitude_sq {} should be accepted",
                magnitude_sq
            );
        }

        let degenerate = PoseData { x: 0.0, y: 0.0, z: 0.0, rotation: [0.0, 0.0, 0.0, 0.5] };
        assert!(parser.parse_packet(&pose_packet("s1", 1, degenerate)).is_err());
    }

    #[test]
    fn mesh_without_vertices_is_rejected() {
        let parser = Parser::new();
        let packet = mesh_packet(Vec::new(), vec![0, 1, 2], "a1");
        let err = parser.parse_packet(&packet).unwrap_err();
        assert!(err.to_string().contains("empty vertices"));
    }

    #[test]
    fn mesh_without_anchor_id_is_rejected() {
        let parser = Parser::new();
        let packet = mesh_packet(vec![1, 2, 3], Vec::new(), "");
        assert!(parser.parse_packet(&packet).is_err());
    }

    #[test]
    fn gzip_vertices_are_decompressed() {
        let parser = Parser::new();
        let raw: Vec<u8> = (0u8..120).collect();
        let packet = mesh_packet(gzip(&raw), gzip(&[9, 9, 9]), "a1");

        let parsed = parser.parse_packet(&packet).expect("mesh should parse");
        let mesh = parsed.data.mesh.expect("mesh payload");
        assert_eq!(mesh.vertices, raw);
        assert_eq!(mesh.faces, vec![9, 9, 9]);
    }

    #[test]
    fn non_gzip_buffers_are_kept_raw() {
        let parser = Parser::new();
        let raw = vec![1, 2, 3, 4, 5];
        let packet = mesh_packet(raw.clone(), vec![7, 8], "a1");

        let parsed = parser.parse_packet(&packet).expect("mesh should parse");
        let mesh = parsed.data.mesh.expect("mesh payload");
        assert_eq!(mesh.vertices, raw);
        assert_eq!(mesh.faces, vec![7, 8]);
    }

    #[test]
    fn empty_faces_stay_empty() {
        let parser = Parser::new();
        let packet = mesh_packet(vec![1, 2, 3], Vec::new(), "a1");
        let parsed = parser.parse_packet(&packet).expect("mesh should parse");
        assert!(parsed.data.mesh.expect("mesh payload").faces.is_empty());
    }

    proptest! {
        #[test]
        fn parsing_preserves_identity_fields(
            session_id in "[a-z0-9]{1,16}",
            frame_number in any::<u64>(),
            timestamp in 1i64..4_000_000_000_000,
            x in -1000.0f64..1000.0,
            y in -1000.0f64..1000.0,
            z in -1000.0f64..1000.0,
        ) {
            let parser = Parser::new();
            let mut packet = pose_packet(
                &session_id,
                timestamp,
                PoseData { x, y, z, rotation: [0.0, 0.0, 0.0, 1.0] },
            );
            packet.frame_number = frame_number;

            let parsed = parser.parse_packet(&packet).expect("valid packet");
            prop_assert_eq!(parsed.session_id, session_id);
            prop_assert_eq!(parsed.frame_number, frame_number);
            prop_assert_eq!(parsed.timestamp, timestamp);
            prop_assert_eq!(parsed.packet_type, PacketType::Pose);
        }

        #[test]
        fn mesh_output_is_input_or_its_gzip_inverse(
            // Keep the first byte off the gzip magic so a raw buffer can
            // never be mistaken for a compressed stream.
            head in 0u8..0x1f,
            tail in proptest::collection::vec(any::<u8>(), 0..255),
            compressed in any::<bool>(),
        ) {
            let parser = Parser::new();
            let mut payload = vec![head];
            payload.extend(tail);
            let vertices = if compressed { gzip(&payload) } else { payload.clone() };
            let packet = mesh_packet(vertices, Vec::new(), "a1");

            let parsed = parser.parse_packet(&packet).expect("mesh should parse");
            let mesh = parsed.data.mesh.expect("mesh payload");
            // Output equals the original payload whether or not it was
            // gzip-wrapped on the way in.
            prop_assert_eq!(mesh.vertices, payload);
        }
    }
}
