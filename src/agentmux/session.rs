//! Session lifecycle, participant tracking, and persisted metadata.
//!
//! A [`Session`] is opened at cohort entry, accumulates participants as the
//! scheduler and delegation controller touch agents, and is closed as
//! completed or failed. The [`SessionManager`] is the single writer of
//! session state; mutations mark the state dirty and a debounced background
//! save coalesces bursts of updates into one write of `sessions.json`.
//!
//! # Example
//!
//! ```rust,no_run
//! use agentmux::session::{SessionManager, SessionManagerConfig};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = SessionManager::new(SessionManagerConfig {
//!     dir: "sessions".into(),
//!     ..SessionManagerConfig::default()
//! })?;
//!
//! let id = manager.create("cto", "Ship the release")?;
//! manager.add_participant(id, "backend")?;
//! manager.complete(id)?;
//! manager.flush()?;
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Work is still in flight.
    Active,
    /// The cohort finished successfully.
    Completed,
    /// The cohort finished with failures.
    Failed,
}

/// One orchestration session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Session identifier.
    pub id: Uuid,
    /// Agent or user that opened the session.
    pub initiator: String,
    /// The task the session was opened for.
    pub task: String,
    /// Agents that took part, in first-touch order.
    pub participants: Vec<String>,
    /// Lifecycle state.
    pub status: SessionStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Size-capped free-form metadata.
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Errors surfaced by session operations.
#[derive(Debug)]
pub enum SessionError {
    /// Unknown session id.
    NotFound(Uuid),
    /// The active session cap was reached.
    TooManySessions(usize),
    /// The metadata merge would exceed the size cap.
    MetadataTooLarge {
        /// Serialized size after the merge.
        size: usize,
        /// Configured cap.
        max: usize,
    },
    /// Could not mint a fresh UUID within the attempt budget.
    IdExhaustion,
    /// Filesystem failure.
    Io(std::io::Error),
    /// Serialisation failure.
    Serde(serde_json::Error),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::NotFound(id) => write!(f, "Session not found: {}", id),
            SessionError::TooManySessions(max) => {
                write!(f, "Session limit reached ({} active)", max)
            }
            SessionError::MetadataTooLarge { size, max } => {
                write!(f, "Session metadata too large: {} bytes (max {})", size, max)
            }
            SessionError::IdExhaustion => write!(f, "Could not allocate a unique session id"),
            SessionError::Io(e) => write!(f, "Session I/O error: {}", e),
            SessionError::Serde(e) => write!(f, "Session serialisation error: {}", e),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        SessionError::Io(e)
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        SessionError::Serde(e)
    }
}

/// Manager construction options.
#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    /// Directory holding `sessions.json`.
    pub dir: PathBuf,
    /// Cap on concurrently active sessions.
    pub max_sessions: usize,
    /// Cap on serialized metadata per session, in bytes.
    pub max_metadata_size: usize,
    /// Debounce window for persistence writes.
    pub save_debounce: Duration,
    /// Sessions older than this are removed by [`SessionManager::cleanup`].
    pub cleanup_after_days: i64,
    /// How many UUIDs to try before giving up on a collision streak.
    pub max_uuid_attempts: usize,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("sessions"),
            max_sessions: 100,
            max_metadata_size: 64 * 1024,
            save_debounce: Duration::from_millis(500),
            cleanup_after_days: 30,
            max_uuid_attempts: 8,
        }
    }
}

/// Single-writer session registry with debounced persistence.
pub struct SessionManager {
    config: SessionManagerConfig,
    sessions: Arc<Mutex<HashMap<Uuid, Session>>>,
    save_pending: Arc<AtomicBool>,
}

impl SessionManager {
    /// Create a manager, loading previously persisted sessions if present.
    pub fn new(config: SessionManagerConfig) -> Result<Self, SessionError> {
        fs::create_dir_all(&config.dir)?;
        let file = config.dir.join("sessions.json");
        let sessions: HashMap<Uuid, Session> = if file.exists() {
            serde_json::from_str(&fs::read_to_string(&file)?)?
        } else {
            HashMap::new()
        };
        Ok(Self {
            config,
            sessions: Arc::new(Mutex::new(sessions)),
            save_pending: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Open a session. Enforces the active-session cap and retries UUID
    /// generation on the (vanishingly unlikely) collision.
    pub fn create(
        &self,
        initiator: impl Into<String>,
        task: impl Into<String>,
    ) -> Result<Uuid, SessionError> {
        let mut sessions = self.sessions.lock().unwrap();

        let active = sessions
            .values()
            .filter(|s| s.status == SessionStatus::Active)
            .count();
        if active >= self.config.max_sessions {
            return Err(SessionError::TooManySessions(self.config.max_sessions));
        }

        let mut id = None;
        for _ in 0..self.config.max_uuid_attempts.max(1) {
            let candidate = Uuid::new_v4();
            if !sessions.contains_key(&candidate) {
                id = Some(candidate);
                break;
            }
        }
        let id = id.ok_or(SessionError::IdExhaustion)?;

        let now = Utc::now();
        sessions.insert(
            id,
            Session {
                id,
                initiator: initiator.into(),
                task: task.into(),
                participants: Vec::new(),
                status: SessionStatus::Active,
                created_at: now,
                updated_at: now,
                metadata: serde_json::Map::new(),
            },
        );
        drop(sessions);
        self.schedule_save();
        Ok(id)
    }

    /// Fetch a session snapshot.
    pub fn get(&self, id: Uuid) -> Result<Session, SessionError> {
        self.sessions
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(SessionError::NotFound(id))
    }

    /// Record an agent as a participant (idempotent).
    pub fn add_participant(
        &self,
        id: Uuid,
        agent_name: impl Into<String>,
    ) -> Result<(), SessionError> {
        let agent_name = agent_name.into();
        self.mutate(id, |session| {
            if !session.participants.contains(&agent_name) {
                session.participants.push(agent_name.clone());
            }
            Ok(())
        })
    }

    /// Mark the session completed.
    pub fn complete(&self, id: Uuid) -> Result<(), SessionError> {
        self.mutate(id, |session| {
            session.status = SessionStatus::Completed;
            Ok(())
        })
    }

    /// Mark the session failed.
    pub fn fail(&self, id: Uuid) -> Result<(), SessionError> {
        self.mutate(id, |session| {
            session.status = SessionStatus::Failed;
            Ok(())
        })
    }

    /// Merge metadata into the session, enforcing the size cap on the
    /// merged result.
    pub fn merge_metadata(
        &self,
        id: Uuid,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), SessionError> {
        let max = self.config.max_metadata_size;
        self.mutate(id, move |session| {
            let mut merged = session.metadata.clone();
            for (key, value) in metadata.clone() {
                merged.insert(key, value);
            }
            let size = serde_json::to_string(&merged).map(|s| s.len()).unwrap_or(0);
            if size > max {
                return Err(SessionError::MetadataTooLarge { size, max });
            }
            session.metadata = merged;
            Ok(())
        })
    }

    /// Sessions currently in the `Active` state.
    pub fn list_active(&self) -> Vec<Session> {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.status == SessionStatus::Active)
            .cloned()
            .collect()
    }

    /// Ids of all known sessions.
    pub fn list_ids(&self) -> Vec<Uuid> {
        self.sessions.lock().unwrap().keys().copied().collect()
    }

    /// Remove closed sessions older than the configured age. Returns the
    /// number removed.
    pub fn cleanup(&self) -> Result<usize, SessionError> {
        let cutoff = Utc::now() - ChronoDuration::days(self.config.cleanup_after_days);
        let removed = {
            let mut sessions = self.sessions.lock().unwrap();
            let doomed: Vec<Uuid> = sessions
                .values()
                .filter(|s| s.status != SessionStatus::Active && s.updated_at < cutoff)
                .map(|s| s.id)
                .collect();
            for id in &doomed {
                sessions.remove(id);
            }
            doomed.len()
        };
        if removed > 0 {
            self.schedule_save();
        }
        Ok(removed)
    }

    /// Write the current state to disk immediately, bypassing the debounce.
    pub fn flush(&self) -> Result<(), SessionError> {
        self.save_pending.store(false, Ordering::SeqCst);
        let snapshot = self.sessions.lock().unwrap().clone();
        let file = self.config.dir.join("sessions.json");
        fs::write(&file, serde_json::to_string_pretty(&snapshot)?)?;
        Ok(())
    }

    fn mutate<F>(&self, id: Uuid, f: F) -> Result<(), SessionError>
    where
        F: FnOnce(&mut Session) -> Result<(), SessionError>,
    {
        {
            let mut sessions = self.sessions.lock().unwrap();
            let session = sessions.get_mut(&id).ok_or(SessionError::NotFound(id))?;
            f(session)?;
            session.updated_at = Utc::now();
        }
        self.schedule_save();
        Ok(())
    }

    /// Coalesce bursts of mutations into one delayed write. Outside a tokio
    /// runtime the write happens synchronously instead.
    fn schedule_save(&self) {
        if self
            .save_pending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let sessions = self.sessions.clone();
                let pending = self.save_pending.clone();
                let file = self.config.dir.join("sessions.json");
                let debounce = self.config.save_debounce;
                handle.spawn(async move {
                    tokio::time::sleep(debounce).await;
                    pending.store(false, Ordering::SeqCst);
                    let snapshot = sessions.lock().unwrap().clone();
                    match serde_json::to_string_pretty(&snapshot) {
                        Ok(json) => {
                            if let Err(e) = fs::write(&file, json) {
                                log::warn!("session save failed: {}", e);
                            }
                        }
                        Err(e) => log::warn!("session serialisation failed: {}", e),
                    }
                });
            }
            Err(_) => {
                if let Err(e) = self.flush() {
                    log::warn!("session save failed: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> SessionManager {
        SessionManager::new(SessionManagerConfig {
            dir: dir.path().to_path_buf(),
            max_sessions: 2,
            ..SessionManagerConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn create_and_track_participants() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        let id = manager.create("cto", "ship it").unwrap();
        manager.add_participant(id, "backend").unwrap();
        manager.add_participant(id, "backend").unwrap();

        let session = manager.get(id).unwrap();
        assert_eq!(session.participants, vec!["backend"]);
        assert_eq!(session.status, SessionStatus::Active);
    }

    #[test]
    fn active_session_cap_is_enforced() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        manager.create("a", "t1").unwrap();
        manager.create("b", "t2").unwrap();
        let err = manager.create("c", "t3").unwrap_err();
        assert!(matches!(err, SessionError::TooManySessions(2)));
    }

    #[test]
    fn metadata_size_cap_is_enforced() {
        let dir = TempDir::new().unwrap();
        let manager = SessionManager::new(SessionManagerConfig {
            dir: dir.path().to_path_buf(),
            max_metadata_size: 64,
            ..SessionManagerConfig::default()
        })
        .unwrap();

        let id = manager.create("a", "t").unwrap();
        let mut metadata = serde_json::Map::new();
        metadata.insert(
            "blob".to_string(),
            serde_json::Value::String("x".repeat(200)),
        );
        let err = manager.merge_metadata(id, metadata).unwrap_err();
        assert!(matches!(err, SessionError::MetadataTooLarge { .. }));
    }

    #[test]
    fn persistence_round_trips() {
        let dir = TempDir::new().unwrap();
        let id = {
            let manager = manager(&dir);
            let id = manager.create("cto", "persist me").unwrap();
            manager.complete(id).unwrap();
            manager.flush().unwrap();
            id
        };

        let reloaded = manager(&dir);
        let session = reloaded.get(id).unwrap();
        assert_eq!(session.task, "persist me");
        assert_eq!(session.status, SessionStatus::Completed);
    }
}
