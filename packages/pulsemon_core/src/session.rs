//! Recording session state machine.
//!
//! Tracks a single logical training session layered on top of the
//! connection manager's notion of "currently connected peripheral". At
//! most one session is in the `Recording` state system-wide; the active
//! record and the completed history live under separate storage keys.

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::storage::{KeyValueStore, StorageError};
use crate::types::PeripheralId;

pub const ACTIVE_SESSION_KEY: &str = "active_recording_session";
pub const SESSIONS_HISTORY_KEY: &str = "sessions_history";

/// Completed sessions kept; the oldest is evicted beyond this.
pub const MAX_SESSIONS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Recording,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingSession {
    pub id: Uuid,
    pub name: String,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub device_id: PeripheralId,
    pub device_name: String,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("A recording session is already active; stop it first")]
    AlreadyActive,

    #[error("No active recording session")]
    NoActiveSession,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub struct SessionManager {
    store: Arc<dyn KeyValueStore>,
    /// Serializes all session mutation. Two concurrent `start()` calls
    /// must not both pass the no-active-session check.
    write_lock: Mutex<()>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// Begin a new session in the `Recording` state.
    ///
    /// A blank or whitespace-only name is replaced with a generated
    /// `Session <date>` fallback.
    pub async fn start(
        &self,
        name: &str,
        device_id: &PeripheralId,
        device_name: &str,
    ) -> Result<RecordingSession, SessionError> {
        let _guard = self.write_lock.lock().await;

        if self.read_active()?.is_some() {
            return Err(SessionError::AlreadyActive);
        }

        let now = Utc::now();
        let trimmed = name.trim();
        let name = if trimmed.is_empty() {
            format!("Session {}", now.format("%Y-%m-%d"))
        } else {
            trimmed.to_string()
        };

        let session = RecordingSession {
            id: Uuid::new_v4(),
            name,
            start_time: now,
            end_time: None,
            device_id: device_id.clone(),
            device_name: device_name.to_string(),
            status: SessionStatus::Recording,
            duration_ms: None,
        };

        self.write_active(&session)?;
        info!("Recording session {} ({}) started", session.name, session.id);
        Ok(session)
    }

    /// Complete the active session: stamp the end time and duration, move
    /// the record from active to the head of history, return it.
    pub async fn stop(&self) -> Result<RecordingSession, SessionError> {
        let _guard = self.write_lock.lock().await;

        let mut session = self.read_active()?.ok_or(SessionError::NoActiveSession)?;
        let now = Utc::now();
        session.end_time = Some(now);
        session.status = SessionStatus::Completed;
        session.duration_ms = Some((now - session.start_time).num_milliseconds().max(0) as u64);

        // History first, active-record removal second: a failure part-way
        // leaves the session active and retryable rather than lost.
        let mut sessions = self.read_history()?;
        sessions.insert(0, session.clone());
        sessions.truncate(MAX_SESSIONS);
        self.store
            .set(SESSIONS_HISTORY_KEY, &serde_json::to_string(&sessions).map_err(StorageError::from)?)?;
        self.store.remove(ACTIVE_SESSION_KEY)?;

        info!(
            "Recording session {} stopped after {} ms",
            session.id,
            session.duration_ms.unwrap_or(0)
        );
        Ok(session)
    }

    /// The currently active session, if any.
    pub fn active_session(&self) -> Result<Option<RecordingSession>, SessionError> {
        Ok(self.read_active()?)
    }

    /// Completed sessions, most recent first.
    pub fn history(&self) -> Result<Vec<RecordingSession>, SessionError> {
        Ok(self.read_history()?)
    }

    /// Destructive escape hatch: discard the active session record without
    /// writing it to history. For recovering from stuck or corrupted
    /// active-session state, not a normal stop.
    pub async fn clear_active(&self) -> Result<(), SessionError> {
        let _guard = self.write_lock.lock().await;
        self.store.remove(ACTIVE_SESSION_KEY)?;
        warn!("Active session record discarded without entering history");
        Ok(())
    }

    fn read_active(&self) -> Result<Option<RecordingSession>, StorageError> {
        match self.store.get(ACTIVE_SESSION_KEY)? {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(session) => Ok(Some(session)),
                Err(e) => {
                    // Tolerate a corrupt record; clear_active() is the way out.
                    warn!("Active session record is unreadable: {}", e);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    fn read_history(&self) -> Result<Vec<RecordingSession>, StorageError> {
        match self.store.get(SESSIONS_HISTORY_KEY)? {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(sessions) => Ok(sessions),
                Err(e) => {
                    warn!("Session history is unreadable: {}", e);
                    Ok(Vec::new())
                }
            },
            None => Ok(Vec::new()),
        }
    }

    fn write_active(&self, session: &RecordingSession) -> Result<(), StorageError> {
        self.store
            .set(ACTIVE_SESSION_KEY, &serde_json::to_string(session)?)
    }
}

/// Render a duration for display: `0s`, `30s`, `1m 30s`, `1h 1m 1s`.
/// The seconds field is never omitted once minutes or hours are present.
pub fn format_duration(ms: u64) -> String {
    let seconds = ms / 1000;
    let minutes = seconds / 60;
    let hours = minutes / 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes % 60, seconds % 60)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds % 60)
    } else {
        format!("{seconds}s")
    }
}
