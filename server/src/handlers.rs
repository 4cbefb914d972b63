//! # WebSocket Handlers
//!
//! Contains the real-time side of the relay:
//! - Upgrading HTTP connections and validating the room handshake
//! - Managing the lifecycle of each connection (outbound task, inbound loop, cleanup)
//! - Dispatching incoming frames: fan-out to the room, or screenshot persistence

use crate::error::RelayError;
use crate::protocol::{with_sender, Envelope, MessageKind, RelayMessage, ScreenshotPayload};
use crate::screenshots::Screenshot;
use crate::state::{AppState, Connection, ConnectionId, Role};
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

// ─── Handshake ──────────────────────────────────────────────────

/// Room-binding query parameters: `?interviewId=..&userId=..&role=..`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeParams {
    /// Room to join. Required.
    pub interview_id: Option<String>,

    /// Authenticated participant. Required.
    pub user_id: Option<String>,

    /// `interviewer`, `candidate` or `admin`. Optional.
    pub role: Option<String>,
}

/// Validated identity of a connecting participant.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    /// Trimmed, non-empty room id.
    pub interview_id: String,

    /// Trimmed, non-empty participant id.
    pub user_id: String,

    /// Declared role, defaulted when missing.
    pub role: Role,
}

impl HandshakeParams {
    pub fn validate(self) -> Result<Identity, RelayError> {
        let interview_id = present(self.interview_id)
            .ok_or(RelayError::HandshakeRejected("missing interviewId"))?;
        let user_id =
            present(self.user_id).ok_or(RelayError::HandshakeRejected("missing userId"))?;

        Ok(Identity {
            interview_id,
            user_id,
            role: Role::from_param(self.role.as_deref()),
        })
    }
}

fn present(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// ─── WebSocket Upgrade Endpoint ─────────────────────────────────

/// `GET /ws` — Upgrades the HTTP connection to a WebSocket connection.
///
/// Identity is validated after the upgrade. A client without `interviewId`
/// or `userId` receives close code 1008 (policy violation) and is never
/// registered.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HandshakeParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        match params.validate() {
            Ok(identity) => handle_connection(socket, state, identity).await,
            Err(e) => reject(socket, e).await,
        }
    })
}

/// Closes a socket that failed the handshake. Nothing was registered.
async fn reject(mut socket: WebSocket, err: RelayError) {
    warn!("{err}");
    let reason = match &err {
        RelayError::HandshakeRejected(reason) => *reason,
        _ => "handshake rejected",
    };
    let frame = CloseFrame {
        code: close_code::POLICY,
        reason: reason.into(),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        debug!("Close frame not delivered: {e}");
    }
}

// ─── Connection Lifecycle ───────────────────────────────────────

/// Manages the full lifecycle of an accepted connection.
///
/// ## Flow:
/// 1. Register the connection in the room registry
/// 2. Split the socket into a sink (outbound) and stream (inbound)
/// 3. Spawn an outbound task that serializes and sends queued messages
/// 4. Process incoming frames on the current task until close, error or idle timeout
/// 5. On disconnect: stop the outbound task and unregister
async fn handle_connection(socket: WebSocket, state: AppState, identity: Identity) {
    let (ws_sink, mut ws_stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<RelayMessage>();

    let conn = state
        .registry
        .register(identity.interview_id, identity.user_id, identity.role, tx);

    // ── Outbound Task ──
    let ws_sink = Arc::new(Mutex::new(ws_sink));
    let outbound_task = tokio::spawn(write_outbound(ws_sink.clone(), rx, conn.id));

    // ── Inbound Loop ──
    let mut idle = false;
    loop {
        let next = match state.idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, ws_stream.next()).await {
                Ok(next) => next,
                Err(_) => {
                    idle = true;
                    break;
                }
            },
            None => ws_stream.next().await,
        };

        let msg = match next {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                debug!(connection_id = %conn.id, "Transport error: {e}");
                break;
            }
            None => break,
        };

        match msg {
            Message::Text(text) => {
                handle_message(&state, &conn, text.as_str());
            }
            Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                Ok(text) => {
                    handle_message(&state, &conn, text);
                }
                Err(e) => warn!(
                    connection_id = %conn.id,
                    "{}",
                    RelayError::MalformedMessage(format!("binary frame is not UTF-8: {e}"))
                ),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    // ── Cleanup on Disconnect ──
    outbound_task.abort();
    if idle {
        info!(connection_id = %conn.id, "Closing idle connection");
        let frame = CloseFrame {
            code: close_code::NORMAL,
            reason: "idle timeout".into(),
        };
        let _ = ws_sink.lock().await.send(Message::Close(Some(frame))).await;
    }
    handle_close(&state, &conn.id);
}

/// Drains a connection's queue into its socket as JSON text frames.
///
/// Returns `Ok` once the queue is closed. The first failed socket write ends
/// the loop and is reported as a [`RelayError::DeliveryFailure`].
pub async fn write_outbound<S>(
    sink: Arc<Mutex<S>>,
    mut rx: mpsc::UnboundedReceiver<RelayMessage>,
    connection_id: ConnectionId,
) -> Result<(), RelayError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    while let Some(msg) = rx.recv().await {
        let text = match serde_json::to_string(&msg) {
            Ok(t) => t,
            Err(e) => {
                error!(%connection_id, "Serialize error: {e}");
                continue;
            }
        };
        let mut guard = sink.lock().await;
        if let Err(e) = guard.send(Message::Text(text.into())).await {
            let err = RelayError::DeliveryFailure { connection_id };
            warn!(%connection_id, kind = msg.kind.as_str(), "{err}: {e}");
            return Err(err);
        }
    }
    Ok(())
}

/// Removes a connection from the registry. Safe to call more than once.
pub fn handle_close(state: &AppState, connection_id: &ConnectionId) {
    state.registry.unregister(connection_id);
}

// ─── Message Dispatcher ─────────────────────────────────────────

/// What the dispatcher did with one inbound frame.
#[derive(Debug)]
pub enum Dispatched {
    /// Forwarded to this many other participants of the room.
    Broadcast(usize),
    /// Handed to a background write; the handle resolves once it finishes.
    Screenshot(JoinHandle<()>),
    /// Accepted with nothing to do (`join_interview`).
    Acknowledged,
    /// Malformed or unknown; logged and discarded.
    Dropped,
}

/// Handles a single inbound frame from `sender`.
///
/// Never fails: any problem is logged and the frame dropped, leaving the
/// connection open.
pub fn handle_message(state: &AppState, sender: &Connection, raw: &str) -> Dispatched {
    match dispatch(state, sender, raw) {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(
                connection_id = %sender.id,
                interview_id = %sender.interview_id,
                "{e}"
            );
            Dispatched::Dropped
        }
    }
}

fn dispatch(state: &AppState, sender: &Connection, raw: &str) -> Result<Dispatched, RelayError> {
    let envelope = Envelope::decode(raw)?;
    let kind = MessageKind::parse(&envelope.kind)
        .ok_or_else(|| RelayError::UnknownMessageType(envelope.kind.clone()))?;

    debug!(
        connection_id = %sender.id,
        interview_id = %sender.interview_id,
        kind = kind.as_str(),
        "Frame received"
    );

    match kind {
        MessageKind::CodeUpdate
        | MessageKind::NotesUpdate
        | MessageKind::TestResultsUpdate
        | MessageKind::AiInsightsUpdate => {
            let payload = if kind.is_enriched() {
                with_sender(envelope.payload, &sender.user_id)
            } else {
                envelope.payload
            };
            let msg = RelayMessage::new(kind, payload);
            let delivered = state
                .registry
                .broadcast(&sender.interview_id, &sender.id, &msg);
            Ok(Dispatched::Broadcast(delivered))
        }

        MessageKind::Screenshot => {
            let shot = resolve_screenshot(sender, ScreenshotPayload::decode(envelope.payload)?)?;
            Ok(Dispatched::Screenshot(spawn_screenshot_write(state, shot)))
        }

        MessageKind::JoinInterview => {
            debug!(
                connection_id = %sender.id,
                user_id = %sender.user_id,
                "Join acknowledged"
            );
            Ok(Dispatched::Acknowledged)
        }
    }
}

/// Fills in missing identity from the sender and keeps the capture inside
/// the sender's own room.
fn resolve_screenshot(
    sender: &Connection,
    payload: ScreenshotPayload,
) -> Result<Screenshot, RelayError> {
    let interview_id = payload
        .interview_id
        .unwrap_or_else(|| sender.interview_id.clone());
    if interview_id != sender.interview_id {
        return Err(crate::error::ScreenshotError::RoomMismatch {
            room: sender.interview_id.clone(),
            payload: interview_id,
        }
        .into());
    }

    Ok(Screenshot {
        interview_id,
        user_id: payload.user_id.unwrap_or_else(|| sender.user_id.clone()),
        timestamp: payload
            .timestamp
            .unwrap_or_else(|| chrono::Utc::now().to_rfc3339()),
        data: payload.data,
    })
}

/// Writes a capture on a background task. Failures stop at the task boundary.
fn spawn_screenshot_write(state: &AppState, shot: Screenshot) -> JoinHandle<()> {
    let store = state.screenshots.clone();
    tokio::spawn(async move {
        match store.save(&shot).await {
            Ok(path) => info!(
                interview_id = %shot.interview_id,
                user_id = %shot.user_id,
                path = %path.display(),
                bytes = shot.data.len(),
                "Screenshot saved"
            ),
            Err(e) => warn!(
                interview_id = %shot.interview_id,
                user_id = %shot.user_id,
                "{}",
                RelayError::Persistence(e)
            ),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::screenshots::ScreenshotStore;
    use crate::state::ConnectionRegistry;
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn test_state(dir: &std::path::Path) -> AppState {
        AppState::new(ScreenshotStore::new(dir))
    }

    fn join(
        registry: &ConnectionRegistry,
        interview: &str,
        user: &str,
    ) -> (Connection, UnboundedReceiver<RelayMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = registry.register(interview.into(), user.into(), Role::Interviewer, tx);
        (conn, rx)
    }

    #[test]
    fn handshake_requires_interview_and_user() {
        let ok = HandshakeParams {
            interview_id: Some("interview-1".into()),
            user_id: Some(" userA ".into()),
            role: None,
        }
        .validate()
        .unwrap();
        assert_eq!(ok.user_id, "userA");
        assert_eq!(ok.role, Role::Candidate);

        for (interview, user) in [
            (None, Some("u")),
            (Some("i"), None),
            (Some("  "), Some("u")),
            (Some("i"), Some("")),
        ] {
            let params = HandshakeParams {
                interview_id: interview.map(String::from),
                user_id: user.map(String::from),
                role: Some("candidate".into()),
            };
            assert!(matches!(
                params.validate(),
                Err(RelayError::HandshakeRejected(_))
            ));
        }
    }

    #[tokio::test]
    async fn code_update_reaches_room_peers_with_sender_id() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let (a, mut rx_a) = join(&state.registry, "interview-1", "userA");
        let (_b, mut rx_b) = join(&state.registry, "interview-1", "userB");
        let (_c, mut rx_c) = join(&state.registry, "interview-2", "userC");

        let outcome = handle_message(
            &state,
            &a,
            r#"{"type":"code_update","payload":{"code":"x=1"}}"#,
        );

        assert!(matches!(outcome, Dispatched::Broadcast(1)));
        assert_eq!(
            rx_b.try_recv().unwrap(),
            RelayMessage::new(
                MessageKind::CodeUpdate,
                json!({"code": "x=1", "userId": "userA"})
            )
        );
        assert!(rx_a.try_recv().is_err());
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn notes_update_from_flat_frame_is_enriched() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let (a, _rx_a) = join(&state.registry, "interview-1", "userA");
        let (_b, mut rx_b) = join(&state.registry, "interview-1", "userB");

        handle_message(&state, &a, r#"{"type":"notes_update","notes":"strong"}"#);

        let got = rx_b.try_recv().unwrap();
        assert_eq!(got.kind, MessageKind::NotesUpdate);
        assert_eq!(got.payload, json!({"notes": "strong", "userId": "userA"}));
    }

    #[tokio::test]
    async fn insights_and_results_are_forwarded_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let (a, _rx_a) = join(&state.registry, "interview-1", "userA");
        let (_b, mut rx_b) = join(&state.registry, "interview-1", "userB");

        handle_message(
            &state,
            &a,
            r#"{"type":"test_results_update","payload":{"results":[{"passed":true}]}}"#,
        );
        handle_message(
            &state,
            &a,
            r#"{"type":"ai_insights_update","payload":{"insights":"ok"}}"#,
        );

        assert_eq!(
            rx_b.try_recv().unwrap(),
            RelayMessage::new(
                MessageKind::TestResultsUpdate,
                json!({"results": [{"passed": true}]})
            )
        );
        assert_eq!(
            rx_b.try_recv().unwrap(),
            RelayMessage::new(MessageKind::AiInsightsUpdate, json!({"insights": "ok"}))
        );
    }

    #[tokio::test]
    async fn bad_frames_are_dropped_and_later_frames_still_flow() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let (a, _rx_a) = join(&state.registry, "interview-1", "userA");
        let (_b, mut rx_b) = join(&state.registry, "interview-1", "userB");

        assert!(matches!(handle_message(&state, &a, "not json"), Dispatched::Dropped));
        assert!(matches!(
            handle_message(&state, &a, r#"{"type":"bogus","payload":{}}"#),
            Dispatched::Dropped
        ));
        assert!(rx_b.try_recv().is_err());
        assert!(state.registry.contains(&a.id));

        handle_message(&state, &a, r#"{"type":"code_update","payload":{"code":"ok"}}"#);
        assert_eq!(rx_b.try_recv().unwrap().payload["code"], "ok");
    }

    #[tokio::test]
    async fn join_interview_is_acknowledged_without_fanout() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let (a, _rx_a) = join(&state.registry, "interview-1", "userA");
        let (_b, mut rx_b) = join(&state.registry, "interview-1", "userB");

        let outcome = handle_message(
            &state,
            &a,
            r#"{"type":"join_interview","interviewId":"interview-1","userId":"userA"}"#,
        );

        assert!(matches!(outcome, Dispatched::Acknowledged));
        assert!(rx_b.try_recv().is_err());
        assert_eq!(state.registry.len(), 2);
    }

    #[tokio::test]
    async fn screenshot_is_written_and_not_broadcast() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let (a, _rx_a) = join(&state.registry, "interview-1", "userA");
        let (_b, mut rx_b) = join(&state.registry, "interview-1", "userB");

        let frame = json!({
            "type": "screenshot",
            "payload": {
                "interviewId": "interview-1",
                "userId": "userA",
                "timestamp": "T1",
                "data": [137, 80, 78, 71]
            }
        })
        .to_string();

        let Dispatched::Screenshot(write) = handle_message(&state, &a, &frame) else {
            panic!("expected a screenshot write");
        };
        write.await.unwrap();

        let path = dir.path().join("interview-1/userA/screenshot-T1.png");
        assert_eq!(std::fs::read(path).unwrap(), vec![137, 80, 78, 71]);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn screenshot_for_another_room_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let (a, _rx_a) = join(&state.registry, "interview-1", "userA");

        let frame = json!({
            "type": "screenshot",
            "payload": { "interviewId": "interview-2", "timestamp": "T1", "data": [1] }
        })
        .to_string();

        assert!(matches!(handle_message(&state, &a, &frame), Dispatched::Dropped));
        assert!(!dir.path().join("interview-2").exists());
    }

    #[tokio::test]
    async fn screenshot_write_failure_stays_inside_the_task() {
        let dir = tempfile::tempdir().unwrap();
        // A file where the interview directory should go makes create_dir_all fail.
        std::fs::write(dir.path().join("interview-1"), b"occupied").unwrap();
        let state = test_state(dir.path());
        let (a, _rx_a) = join(&state.registry, "interview-1", "userA");

        let frame = json!({
            "type": "screenshot",
            "payload": { "timestamp": "T1", "data": [1, 2] }
        })
        .to_string();

        let Dispatched::Screenshot(write) = handle_message(&state, &a, &frame) else {
            panic!("expected a screenshot write");
        };
        assert!(write.await.is_ok());
        assert!(state.registry.contains(&a.id));
    }

    #[tokio::test]
    async fn screenshot_without_identity_uses_sender_and_current_time() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let (a, _rx_a) = join(&state.registry, "interview-1", "userA");

        let frame = json!({"type": "screenshot", "payload": {"data": [1, 2]}}).to_string();
        let Dispatched::Screenshot(write) = handle_message(&state, &a, &frame) else {
            panic!("expected a screenshot write");
        };
        write.await.unwrap();

        let user_dir = dir.path().join("interview-1").join("userA");
        let names: Vec<String> = std::fs::read_dir(&user_dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names.len(), 1);

        let name = &names[0];
        let stamp = name
            .strip_prefix("screenshot-")
            .and_then(|rest| rest.strip_suffix(".png"))
            .unwrap();
        assert!(!stamp.contains([':', '.']), "unsanitized timestamp in {name}");
        assert!(stamp.starts_with(&chrono::Utc::now().format("%Y-").to_string()));
        assert_eq!(std::fs::read(user_dir.join(name)).unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn writer_sends_queued_messages_as_json_text() {
        let (sink, mut socket) = futures::channel::mpsc::unbounded::<Message>();
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ConnectionId::new_v4();

        tx.send(RelayMessage::new(MessageKind::CodeUpdate, json!({"code": "x"})))
            .unwrap();
        drop(tx);

        let result = write_outbound(Arc::new(Mutex::new(sink)), rx, id).await;
        assert!(result.is_ok());

        let Some(Message::Text(text)) = socket.next().await else {
            panic!("expected a text frame");
        };
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(text.as_str()).unwrap(),
            json!({"type": "code_update", "payload": {"code": "x"}})
        );
    }

    #[tokio::test]
    async fn writer_reports_failed_socket_write() {
        let (sink, socket) = futures::channel::mpsc::unbounded::<Message>();
        drop(socket);
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ConnectionId::new_v4();

        tx.send(RelayMessage::new(MessageKind::NotesUpdate, json!({"notes": "n"})))
            .unwrap();
        tx.send(RelayMessage::new(MessageKind::NotesUpdate, json!({"notes": "m"})))
            .unwrap();

        let result = write_outbound(Arc::new(Mutex::new(sink)), rx, id).await;
        assert!(matches!(
            result,
            Err(RelayError::DeliveryFailure { connection_id }) if connection_id == id
        ));
    }

    #[tokio::test]
    async fn close_twice_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let (a, _rx_a) = join(&state.registry, "interview-1", "userA");
        let (_b, _rx_b) = join(&state.registry, "interview-1", "userB");

        handle_close(&state, &a.id);
        handle_close(&state, &a.id);

        assert_eq!(state.registry.len(), 1);
        assert!(!state.registry.contains(&a.id));
    }
}
