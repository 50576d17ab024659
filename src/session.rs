//! Sync session: the server side of one WebSocket connection within a room.
//!
//! Implements the Yjs wire-protocol handshake, update fan-out, awareness
//! merge, and the `SYNC_STATUS` heartbeat/ack extension. Transport-agnostic:
//! callers feed it raw binary frames and consume the `Vec<u8>` frames it
//! wants sent back, so it can sit behind axum's WebSocket today or another
//! transport later.
//!
//! Grounded on the teacher's `ws/connection.rs` (`WsConnection`, per-socket
//! identity) and `ws/room.rs` (dispatch shape), generalized to the full
//! message set (`QUERY_AWARENESS`, `SYNC_STATUS`) the distilled spec adds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::awareness::{AwarenessUpdate, ClientId};
use crate::protocol::{self, ProtocolError, WsMessage};
use crate::room::Room;

/// Per-connection identity and local-version bookkeeping.
///
/// `client_id` is derived the same way the teacher's `WsConnection` derives
/// one: the low 8 bytes of a server-generated UUID, used as the Yjs
/// client id and the awareness key for this socket.
pub struct SyncSession {
    pub connection_id: String,
    pub client_id: ClientId,
    room: Arc<Room>,
    handshake_done: std::sync::atomic::AtomicBool,
    /// Most recently observed local version from this client's `SYNC_STATUS`
    /// probes, echoed straight back on every subsequent probe.
    last_local_version: AtomicU64,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Room(#[from] crate::room::RoomError),
}

/// What the caller should do after feeding a frame to the session.
pub enum SessionAction {
    /// Send these frames back to the originating socket only.
    ReplyToSender(Vec<Vec<u8>>),
    /// Nothing to send directly; any fan-out already went through the room.
    None,
    /// The frame was malformed; close this connection. The room is
    /// untouched.
    CloseConnection,
}

impl SyncSession {
    pub fn new(room: Arc<Room>) -> Self {
        let uuid = uuid::Uuid::new_v4();
        let bytes = uuid.as_bytes();
        let client_id = u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]);

        Self {
            connection_id: uuid.to_string(),
            client_id,
            room,
            handshake_done: std::sync::atomic::AtomicBool::new(false),
            last_local_version: AtomicU64::new(0),
        }
    }

    pub fn is_handshaked(&self) -> bool {
        self.handshake_done.load(Ordering::Acquire)
    }

    /// Frames to send immediately on accept: a `SYNC_STEP1` soliciting the
    /// client's state vector, followed by a full awareness snapshot.
    pub async fn initial_frames(&self) -> Vec<Vec<u8>> {
        let step1 = protocol::encode_sync_step1(&self.room.state_vector());
        let snapshot = self.room.awareness_snapshot().await;
        let awareness_frame = protocol::encode_awareness(&snapshot.encode());
        vec![step1, awareness_frame]
    }

    /// Handle one inbound binary frame. Returns what the caller owes the
    /// originating socket (if anything); all room fan-out is performed
    /// internally.
    pub async fn handle_frame(&self, data: &[u8]) -> Result<SessionAction, SessionError> {
        let message = match protocol::decode_message(data) {
            Ok(m) => m,
            Err(e) => {
                warn!(conn = %self.connection_id, error = %e, "malformed frame, closing session");
                return Ok(SessionAction::CloseConnection);
            }
        };

        match message {
            WsMessage::SyncStep1 { state_vector } => {
                let diff = self.room.handle_sync_step1(&state_vector)?;
                Ok(SessionAction::ReplyToSender(vec![
                    protocol::encode_sync_step2(&diff),
                ]))
            }
            WsMessage::SyncStep2 { update } => {
                self.handshake_done.store(true, Ordering::Release);
                if !update.is_empty() {
                    self.apply_and_broadcast(&update).await?;
                }
                Ok(SessionAction::None)
            }
            WsMessage::Update { update } => {
                self.apply_and_broadcast(&update).await?;
                Ok(SessionAction::None)
            }
            WsMessage::Awareness { data } => {
                match AwarenessUpdate::decode(&data) {
                    Ok(update) => {
                        self.room.apply_awareness(&update).await;
                        self.room
                            .broadcast_except(
                                Some(&self.connection_id),
                                protocol::encode_awareness(&data),
                            )
                            .await;
                    }
                    Err(e) => {
                        debug!(conn = %self.connection_id, error = %e, "unparseable awareness payload, dropping");
                    }
                }
                Ok(SessionAction::None)
            }
            WsMessage::QueryAwareness => {
                let snapshot = self.room.awareness_snapshot().await;
                Ok(SessionAction::ReplyToSender(vec![protocol::encode_awareness(
                    &snapshot.encode(),
                )]))
            }
            WsMessage::SyncStatus { local_version } => {
                self.last_local_version.store(local_version, Ordering::Release);
                Ok(SessionAction::ReplyToSender(vec![
                    protocol::encode_sync_status(local_version),
                ]))
            }
        }
    }

    async fn apply_and_broadcast(&self, update: &[u8]) -> Result<(), SessionError> {
        self.room.apply_update(update)?;
        let frame = protocol::encode_update(update);
        self.room
            .broadcast_except(Some(&self.connection_id), frame)
            .await;
        Ok(())
    }
}
