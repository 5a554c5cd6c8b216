//! Driver spawns and manages the pipeline dispatcher task

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::gate::MessageEvent;
use crate::metrics::RelayMetrics;
use crate::parser::Parser;
use crate::transformer::Transformer;
use crate::updater::Updater;

/// Processing slower than this per packet is worth a warning
const SLOW_PACKET_THRESHOLD: Duration = Duration::from_millis(10);

/// Driver spawns the message-dispatcher task
///
/// A single consumer drains the fan-in queue and runs
/// parse → transform → update inline per message. Errors are confined to the
/// packet that caused them; the dispatcher itself only stops on channel
/// close or cancellation.
pub struct Driver;

impl Driver {
    /// Spawn the dispatcher for the given pipeline stages.
    ///
    /// `evicted_sessions` carries session ids whose connections the gate
    /// swept away; their per-session pipeline state is released here.
    pub fn spawn(
        mut messages: mpsc::Receiver<MessageEvent>,
        mut evicted_sessions: mpsc::UnboundedReceiver<String>,
        parser: Parser,
        transformer: Arc<Transformer>,
        updater: Arc<Updater>,
        metrics: Arc<RelayMetrics>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("pipeline dispatcher started");
            let mut processed = 0u64;
            let mut sweeper_open = true;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("pipeline dispatcher cancelled");
                        break;
                    }
                    message = messages.recv() => match message {
                        Some(message) => {
                            Self::process_message(
                                &message,
                                &parser,
                                &transformer,
                                &updater,
                                &metrics,
                            );
                            processed += 1;
                        }
                        None => {
                            info!("fan-in queue closed, dispatcher stopping");
                            break;
                        }
                    },
                    session = evicted_sessions.recv(), if sweeper_open => match session {
                        Some(session_id) => {
                            Self::release_session(&session_id, &transformer, &updater);
                        }
                        None => sweeper_open = false,
                    },
                }
            }

            info!("pipeline dispatcher ended (processed {} packets)", processed);
        })
    }

    fn process_message(
        message: &MessageEvent,
        parser: &Parser,
        transformer: &Transformer,
        updater: &Updater,
        metrics: &RelayMetrics,
    ) {
        let start = Instant::now();
        let packet_type = message.packet.packet_type.as_str();

        let parsed = match parser.parse_packet(&message.packet) {
            Ok(parsed) => parsed,
            Err(err) => {
                debug!("dropping packet from {}: {}", message.connection_id, err);
                metrics.record_packet_error(packet_type, "parse_error");
                return;
            }
        };

        let event = match transformer.transform(&parsed) {
            Ok(event) => event,
            Err(err) => {
                debug!("failed to transform packet from {}: {}", message.connection_id, err);
                metrics.record_packet_error(packet_type, "transform_error");
                return;
            }
        };

        updater.process_event(event);
        metrics.record_packet(packet_type, "success");

        let elapsed = start.elapsed();
        if elapsed > SLOW_PACKET_THRESHOLD {
            warn!("slow packet processing: {:?} for type {}", elapsed, packet_type);
        }
    }

    /// Release per-session pipeline state after the gate evicted the
    /// session's last connection.
    fn release_session(session_id: &str, transformer: &Transformer, updater: &Updater) {
        if let Some(anchor_id) = transformer.anchor_for_session(session_id) {
            updater.clear_mesh_history(&anchor_id);
        }
        transformer.clear_stale_session(session_id);
        debug!("released pipeline state for stale session {}", session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::RelayMetrics;
    use crate::sink::SinkClient;
    use crate::types::{PacketData, PacketType, PoseData, StreamPacket};

    fn pipeline() -> (Arc<Transformer>, Arc<Updater>, Arc<RelayMetrics>) {
        let metrics = Arc::new(RelayMetrics::new().expect("metrics"));
        let sink = SinkClient::new("http://192.0.2.1:9", Duration::from_millis(100))
            .expect("client should build");
        let updater = Updater::new(sink, 100, Duration::from_secs(60), Arc::clone(&metrics));
        (Arc::new(Transformer::new()), updater, metrics)
    }

    fn pose_message(session_id: &str, x: f64) -> MessageEvent {
        MessageEvent {
            connection_id: "conn_1_0".to_string(),
            packet: StreamPacket {
                session_id: session_id.to_string(),
                frame_number: 1,
                timestamp: 1_700_000_000_000,
                packet_type: PacketType::Pose,
                data: PacketData {
                    pose: Some(PoseData { x, y: 0.0, z: 0.0, rotation: [0.0, 0.0, 0.0, 1.0] }),
                    mesh: None,
                },
            },
            received_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn dispatcher_processes_messages_and_stops_on_close() {
        let (transformer, updater, metrics) = pipeline();
        let (tx, rx) = mpsc::channel(16);
        let (_evicted_tx, evicted_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let handle = Driver::spawn(
            rx,
            evicted_rx,
            Parser::new(),
            Arc::clone(&transformer),
            Arc::clone(&updater),
            Arc::clone(&metrics),
            cancel,
        );

        tx.send(pose_message("s1", 1.0)).await.expect("send");
        tx.send(pose_message("s1", 2.0)).await.expect("send");
        // Out-of-bounds pose is dropped by the parser, not the dispatcher.
        tx.send(pose_message("s1", 5000.0)).await.expect("send");
        drop(tx);

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("dispatcher should stop when the queue closes")
            .expect("dispatcher should not panic");

        assert_eq!(updater.queue_len(), 2);
        let text = metrics.encode().expect("encode");
        assert!(text.contains(r#"relay_packets_processed_total{status="success",type="pose"} 2"#));
        assert!(text.contains(r#"relay_packet_errors_total{error="parse_error",type="pose"} 1"#));
    }

    #[tokio::test]
    async fn evicted_session_releases_anchor_and_mesh_state() {
        let (transformer, updater, metrics) = pipeline();
        let (tx, rx) = mpsc::channel(16);
        let (evicted_tx, evicted_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let handle = Driver::spawn(
            rx,
            evicted_rx,
            Parser::new(),
            Arc::clone(&transformer),
            Arc::clone(&updater),
            metrics,
            cancel.clone(),
        );

        tx.send(pose_message("s1", 1.0)).await.expect("send");

        // Wait for the anchor allocation to land, then evict the session.
        tokio::time::timeout(Duration::from_secs(1), async {
            while transformer.active_sessions() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("anchor should be allocated");

        evicted_tx.send("s1".to_string()).expect("evict");

        tokio::time::timeout(Duration::from_secs(1), async {
            while transformer.active_sessions() != 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("session state should be released");

        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
    }
}
