//! # Server State
//!
//! Holds the shared state of the relay:
//! - **Connection registry**: every open participant connection, keyed by a
//!   server-assigned [`ConnectionId`]
//! - **Screenshot store**: where proctoring captures are written
//!
//! Rooms are not stored anywhere. A room is the set of registry entries that
//! share an `interview_id`, recomputed on every broadcast.

use crate::error::RelayError;
use crate::protocol::RelayMessage;
use crate::screenshots::ScreenshotStore;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Server-assigned identifier, unique for the lifetime of the process.
pub type ConnectionId = Uuid;

/// Sender half of a connection's outbound queue. The connection's writer
/// task drains the other half into the WebSocket.
pub type ClientTx = mpsc::UnboundedSender<RelayMessage>;

/// Participant role as declared at handshake. Only used for labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Interviewer,
    Candidate,
    Admin,
}

impl Role {
    /// Parses a handshake role. Unknown or missing values fall back to
    /// [`Role::Candidate`]; `recruiter` is accepted as an interviewer.
    pub fn from_param(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("interviewer") | Some("recruiter") => Role::Interviewer,
            Some("admin") => Role::Admin,
            Some("candidate") => Role::Candidate,
            other => {
                debug!(role = ?other, "Unrecognized role, defaulting to candidate");
                Role::Candidate
            }
        }
    }
}

/// One open participant connection.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Assigned at registration, never reused.
    pub id: ConnectionId,

    /// Room this connection belongs to. Fixed for its lifetime.
    pub interview_id: String,

    /// Participant behind this connection.
    pub user_id: String,

    /// Role declared at handshake.
    pub role: Role,

    /// Queue feeding this connection's writer task.
    tx: ClientTx,
}

impl Connection {
    /// Queues a message for this connection's writer task.
    pub fn send(&self, msg: RelayMessage) -> Result<(), RelayError> {
        self.tx
            .send(msg)
            .map_err(|_| RelayError::DeliveryFailure {
                connection_id: self.id,
            })
    }

    pub fn participant(&self) -> Participant {
        Participant {
            connection_id: self.id,
            user_id: self.user_id.clone(),
            role: self.role,
        }
    }
}

/// Public view of a connection, as listed by `/api/rooms`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    /// Id of the underlying connection.
    pub connection_id: ConnectionId,

    /// Participant behind the connection.
    pub user_id: String,

    /// Role declared at handshake.
    pub role: Role,
}

/// Registry of open connections.
///
/// Cloning yields another handle to the same registry; separately
/// constructed registries are fully independent.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<ConnectionId, Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new connection under a fresh id and returns it. From this
    /// point on the connection receives broadcasts for its room.
    pub fn register(
        &self,
        interview_id: String,
        user_id: String,
        role: Role,
        tx: ClientTx,
    ) -> Connection {
        let conn = Connection {
            id: Uuid::new_v4(),
            interview_id,
            user_id,
            role,
            tx,
        };
        self.connections.insert(conn.id, conn.clone());
        info!(
            connection_id = %conn.id,
            interview_id = %conn.interview_id,
            user_id = %conn.user_id,
            role = ?conn.role,
            "Connection registered"
        );
        conn
    }

    /// Removes a connection. Removing an unknown id is a no-op.
    pub fn unregister(&self, id: &ConnectionId) -> Option<Connection> {
        let removed = self.connections.remove(id).map(|(_, conn)| conn);
        match &removed {
            Some(conn) => info!(
                connection_id = %id,
                interview_id = %conn.interview_id,
                user_id = %conn.user_id,
                "Connection unregistered"
            ),
            None => debug!(connection_id = %id, "Connection already unregistered"),
        }
        removed
    }

    /// Sends `msg` to every connection in `interview_id` except `exclude`.
    ///
    /// A failed send only affects that recipient; the remaining recipients
    /// are still served. Returns the number of messages queued.
    pub fn broadcast(&self, interview_id: &str, exclude: &ConnectionId, msg: &RelayMessage) -> usize {
        let mut queued = 0;
        for entry in self.connections.iter() {
            let conn = entry.value();
            if conn.interview_id != interview_id || conn.id == *exclude {
                continue;
            }
            match conn.send(msg.clone()) {
                Ok(()) => queued += 1,
                Err(e) => warn!(interview_id, kind = msg.kind.as_str(), "{e}"),
            }
        }
        queued
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    /// Participants currently in one room.
    pub fn room(&self, interview_id: &str) -> Vec<Participant> {
        self.connections
            .iter()
            .filter(|entry| entry.interview_id == interview_id)
            .map(|entry| entry.participant())
            .collect()
    }

    /// All non-empty rooms, keyed by interview id.
    pub fn rooms(&self) -> BTreeMap<String, Vec<Participant>> {
        let mut rooms: BTreeMap<String, Vec<Participant>> = BTreeMap::new();
        for entry in self.connections.iter() {
            rooms
                .entry(entry.interview_id.clone())
                .or_default()
                .push(entry.participant());
        }
        rooms
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

/// Shared application state, cloned into every handler.
#[derive(Clone)]
pub struct AppState {
    /// Every open connection, across all rooms.
    pub registry: ConnectionRegistry,

    /// Destination of proctoring captures.
    pub screenshots: ScreenshotStore,

    /// Close connections that stay silent this long. `None` disables reaping.
    pub idle_timeout: Option<Duration>,
}

impl AppState {
    pub fn new(screenshots: ScreenshotStore) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            screenshots,
            idle_timeout: None,
        }
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }
}
