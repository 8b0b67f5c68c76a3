use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{error::ServiceError, session::OutboundEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Generating,
}

struct SessionEntry {
    backend_id: String,
    outbound: mpsc::Sender<OutboundEvent>,
    state: SessionState,
    stop: Option<CancellationToken>,
    connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub backend_id: String,
    pub state: SessionState,
    pub connected_at: DateTime<Utc>,
}

/// Routing table of live chat sessions.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(
        &self,
        backend_id: impl Into<String>,
        outbound: mpsc::Sender<OutboundEvent>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.sessions.write().insert(
            id,
            SessionEntry {
                backend_id: backend_id.into(),
                outbound,
                state: SessionState::Idle,
                stop: None,
                connected_at: Utc::now(),
            },
        );
        id
    }

    /// Queues an event for the session's socket. False once the session is
    /// gone, its writer has shut down, or its queue is full. A full queue
    /// means the client stopped reading; its generation is stopped too.
    pub fn send(&self, id: Uuid, event: OutboundEvent) -> bool {
        let sessions = self.sessions.read();
        let Some(entry) = sessions.get(&id) else {
            return false;
        };
        match entry.outbound.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(session_id = %id, "outbound queue full, dropping slow client");
                if let Some(token) = &entry.stop {
                    token.cancel();
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Marks the session as generating and hands out the token that stops it.
    pub fn begin_generation(&self, id: Uuid) -> Result<CancellationToken, ServiceError> {
        let mut sessions = self.sessions.write();
        let entry = sessions
            .get_mut(&id)
            .ok_or_else(|| ServiceError::not_found(format!("Session {id} not found")))?;
        if entry.state == SessionState::Generating {
            return Err(ServiceError::validation(
                "a generation is already in progress",
            ));
        }
        let token = CancellationToken::new();
        entry.state = SessionState::Generating;
        entry.stop = Some(token.clone());
        Ok(token)
    }

    pub fn finish_generation(&self, id: Uuid) {
        if let Some(entry) = self.sessions.write().get_mut(&id) {
            entry.state = SessionState::Idle;
            entry.stop = None;
        }
    }

    /// Signals the session's in-flight generation to stop. Returns whether a
    /// generation was running.
    pub fn request_stop(&self, id: Uuid) -> Result<bool, ServiceError> {
        let sessions = self.sessions.read();
        let entry = sessions
            .get(&id)
            .ok_or_else(|| ServiceError::not_found(format!("Session {id} not found")))?;
        match &entry.stop {
            Some(token) => {
                token.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drops the session, cancelling anything it still had running. Safe to
    /// call more than once.
    pub fn remove(&self, id: Uuid) -> bool {
        match self.sessions.write().remove(&id) {
            Some(entry) => {
                if let Some(token) = entry.stop {
                    token.cancel();
                }
                debug!(session_id = %id, "session removed");
                true
            }
            None => false,
        }
    }

    pub fn state(&self, id: Uuid) -> Option<SessionState> {
        self.sessions.read().get(&id).map(|entry| entry.state)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<_> = self
            .sessions
            .read()
            .iter()
            .map(|(id, entry)| SessionSummary {
                id: *id,
                backend_id: entry.backend_id.clone(),
                state: entry.state,
                connected_at: entry.connected_at,
            })
            .collect();
        sessions.sort_by_key(|s| s.connected_at);
        sessions
    }
}
