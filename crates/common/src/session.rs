//! Durable per-user-type session storage
//!
//! Each user type owns two files under the session directory:
//! - `<user>-storage-state.json`: the browser storage state (cookies and origins)
//! - `<user>-session.json`: the validity record ([`SessionRecord`])
//!
//! Every read path fails closed. A missing, unreadable or malformed file means
//! "no valid session", never an error, so external tooling can delete these
//! files at any time to force a fresh login.
//!
//! Writers are assumed to be sequential (one worker). Concurrent writers get
//! last-write-wins semantics with no merge.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::types::{SessionRecord, StorageState, UserType};

/// Source of "now" for validity calculations
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Outcome of inspecting a stored session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionStatus {
    Valid { age: Duration },
    Missing,
    MissingRecord,
    Unreadable(String),
    Malformed(String),
    Empty,
    Expired { age: Duration },
}

impl SessionStatus {
    pub fn is_valid(&self) -> bool {
        matches!(self, SessionStatus::Valid { .. })
    }
}

/// File-backed session cache keyed by user type
#[derive(Clone)]
pub struct SessionStore {
    dir: PathBuf,
    validity: Duration,
    refresh_after: Duration,
    clock: Clock,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("dir", &self.dir)
            .field("validity", &self.validity)
            .field("refresh_after", &self.refresh_after)
            .finish()
    }
}

impl SessionStore {
    /// Create a store with the default 30 minute validity and 20 minute refresh windows
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_config(&SessionConfig {
            dir: dir.into(),
            ..SessionConfig::default()
        })
    }

    pub fn with_config(config: &SessionConfig) -> Self {
        Self {
            dir: config.dir.clone(),
            validity: config.validity(),
            refresh_after: config.refresh_after(),
            clock: Arc::new(Utc::now),
        }
    }

    /// Replace the clock (tests pin "now" with this)
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn storage_state_path(&self, user_type: UserType) -> PathBuf {
        self.dir.join(format!("{}-storage-state.json", user_type))
    }

    pub fn record_path(&self, user_type: UserType) -> PathBuf {
        self.dir.join(format!("{}-session.json", user_type))
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Inspect the stored session without side effects
    pub fn status(&self, user_type: UserType) -> SessionStatus {
        let state_path = self.storage_state_path(user_type);
        let raw = match std::fs::read_to_string(&state_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return SessionStatus::Missing,
            Err(e) => return SessionStatus::Unreadable(e.to_string()),
        };

        let state: StorageState = match serde_json::from_str(&raw) {
            Ok(state) => state,
            Err(e) => return SessionStatus::Malformed(e.to_string()),
        };
        if !state.is_structurally_valid() {
            return SessionStatus::Empty;
        }

        let record = match self.read_record(user_type) {
            Ok(Some(record)) => record,
            Ok(None) => return SessionStatus::MissingRecord,
            Err(e) => return SessionStatus::Malformed(e.to_string()),
        };

        let age = self.age_of(&record);
        if age < self.validity {
            SessionStatus::Valid { age }
        } else {
            SessionStatus::Expired { age }
        }
    }

    /// True only when a well-formed, unexpired session exists. Never fails.
    ///
    /// Structurally broken artifacts are deleted so the next login starts clean.
    pub fn has_valid_session(&self, user_type: UserType) -> bool {
        match self.status(user_type) {
            SessionStatus::Valid { age } => {
                debug!("Session for {} is valid (age {}s)", user_type, age.as_secs());
                true
            }
            SessionStatus::Missing => {
                debug!("No stored session for {}", user_type);
                false
            }
            SessionStatus::MissingRecord => {
                info!("Session artifact for {} has no validity record", user_type);
                false
            }
            SessionStatus::Expired { age } => {
                info!("Session for {} expired ({}s old)", user_type, age.as_secs());
                false
            }
            SessionStatus::Unreadable(reason) => {
                warn!("Session artifact for {} is unreadable: {}", user_type, reason);
                false
            }
            status @ (SessionStatus::Malformed(_) | SessionStatus::Empty) => {
                warn!("Discarding invalid session for {}: {:?}", user_type, status);
                if let Err(e) = self.clear(user_type) {
                    warn!("Failed to remove invalid session for {}: {}", user_type, e);
                }
                false
            }
        }
    }

    /// Record "now" as the session's creation and validity anchor. Overwrites any prior record.
    pub fn mark_valid(&self, user_type: UserType) -> Result<()> {
        let record = SessionRecord::new(user_type, self.now());
        self.write_json(&self.record_path(user_type), &record)?;
        info!("Marked session for {} valid", user_type);
        Ok(())
    }

    /// Refresh `lastExtended` without touching `created`. No-op when no record exists.
    pub fn extend(&self, user_type: UserType) -> Result<()> {
        let mut record = match self.read_record(user_type) {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!("Not extending unreadable session record for {}: {}", user_type, e);
                return Ok(());
            }
        };

        record.last_extended = Some(self.now());
        self.write_json(&self.record_path(user_type), &record)?;
        debug!("Extended session for {}", user_type);
        Ok(())
    }

    /// Delete both files for a user type. Absent files are not an error.
    pub fn clear(&self, user_type: UserType) -> Result<()> {
        for path in [self.storage_state_path(user_type), self.record_path(user_type)] {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub fn clear_all(&self) -> Result<()> {
        for user_type in UserType::all() {
            self.clear(user_type)?;
        }
        Ok(())
    }

    /// True once the session is older than the refresh threshold, or when there is no record at all
    pub fn needs_refresh(&self, user_type: UserType) -> bool {
        match self.read_record(user_type) {
            Ok(Some(record)) => self.age_of(&record) >= self.refresh_after,
            _ => true,
        }
    }

    /// Age measured from the last extension (or creation)
    pub fn session_age(&self, user_type: UserType) -> Option<Duration> {
        self.read_record(user_type)
            .ok()
            .flatten()
            .map(|record| self.age_of(&record))
    }

    /// Persist the browser storage state. Written atomically.
    pub fn save_storage_state(&self, user_type: UserType, state: &StorageState) -> Result<()> {
        if !state.is_structurally_valid() {
            return Err(Error::SessionCorrupt {
                user_type: user_type.to_string(),
                reason: "storage state has no cookies".to_string(),
            });
        }
        self.write_json(&self.storage_state_path(user_type), state)
    }

    /// Load a structurally valid storage state, or None
    pub fn load_storage_state(&self, user_type: UserType) -> Option<StorageState> {
        let raw = std::fs::read_to_string(self.storage_state_path(user_type)).ok()?;
        let state: StorageState = serde_json::from_str(&raw).ok()?;
        state.is_structurally_valid().then_some(state)
    }

    fn read_record(&self, user_type: UserType) -> Result<Option<SessionRecord>> {
        match std::fs::read_to_string(self.record_path(user_type)) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn age_of(&self, record: &SessionRecord) -> Duration {
        (self.now() - record.anchor()).to_std().unwrap_or(Duration::ZERO)
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_vec_pretty(value)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&json)?;
        tmp.persist(path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }
}
