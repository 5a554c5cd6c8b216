//! Core types for spatial telemetry representation.
//!
//! This module provides the data structures flowing through the relay:
//! - [`StreamPacket`] is the inbound envelope read off a WebSocket frame
//! - [`SpatialEvent`] is the outbound unit shipped to the analytics sink
//! - [`Connection`] tracks a live client attachment in the gate
//!
//! Packet and event types mirror the JSON wire formats exactly; byte buffers
//! travel as base64 strings as is conventional for binary-in-JSON.

mod connection;
mod event;
mod packet;

pub use connection::Connection;
pub use event::{Anchor, EventBatch, MeshDiff, SpatialEvent};
pub use packet::{MeshData, PacketData, PacketType, PoseData, StreamPacket};
