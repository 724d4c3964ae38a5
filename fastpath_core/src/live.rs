//! Live status mirror for an auxiliary display surface.
//!
//! The runtime pushes the current fast (elapsed, remaining, goal reached) to
//! a [`LiveStatusPublisher`]. Publishing is best effort: failures are logged
//! and never affect the fasting state.

use crate::Result;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use uuid::Uuid;

/// Fixed attributes of one publication
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LiveSession {
    pub session_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub goal_duration_secs: u64,
    pub goal_name: Option<String>,
}

/// Values that change while a publication is running
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LiveStatus {
    pub elapsed_secs: u64,
    pub remaining_secs: u64,
    pub goal_reached: bool,
}

impl LiveStatus {
    /// Status of a fresh publication: nothing elapsed, whole goal remaining
    pub fn initial(session: &LiveSession) -> Self {
        Self {
            elapsed_secs: 0,
            remaining_secs: session.goal_duration_secs,
            goal_reached: session.goal_duration_secs == 0,
        }
    }
}

/// Surface that mirrors the active fast outside the main interface
///
/// At most one publication is active at a time; starting a new one must end
/// the previous one first.
pub trait LiveStatusPublisher: Send {
    /// Begin publishing. Returns false when the surface is unavailable.
    fn start(&mut self, session: &LiveSession) -> bool;

    fn update(&mut self, status: &LiveStatus);

    fn stop(&mut self);

    fn is_active(&self) -> bool;
}

/// Publisher for environments without a live surface; never starts
#[derive(Debug, Default)]
pub struct NoopPublisher;

impl LiveStatusPublisher for NoopPublisher {
    fn start(&mut self, _session: &LiveSession) -> bool {
        tracing::debug!("Live surface unsupported, not publishing");
        false
    }

    fn update(&mut self, _status: &LiveStatus) {}

    fn stop(&mut self) {}

    fn is_active(&self) -> bool {
        false
    }
}

/// Everything written to the live status file
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LiveSnapshot {
    #[serde(flatten)]
    pub session: LiveSession,
    #[serde(flatten)]
    pub status: LiveStatus,
    pub updated_at: DateTime<Utc>,
}

/// Publishes the live status as a small JSON file that widgets can poll.
///
/// The file exists only while a publication is active.
pub struct StatusFilePublisher {
    path: PathBuf,
    current: Option<LiveSnapshot>,
}

impl StatusFilePublisher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            current: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, snapshot: &LiveSnapshot) -> Result<()> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent)?;

        let temp = NamedTempFile::new_in(parent)?;
        temp.as_file().lock_exclusive()?;
        {
            let mut writer = std::io::BufWriter::new(temp.as_file());
            let contents = serde_json::to_string(snapshot)?;
            writer.write_all(contents.as_bytes())?;
            writer.flush()?;
        }
        temp.as_file().unlock()?;
        temp.persist(&self.path)
            .map_err(|e| crate::Error::Io(e.error))?;
        Ok(())
    }

    fn remove(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove live status {:?}: {}", self.path, e),
        }
    }
}

impl LiveStatusPublisher for StatusFilePublisher {
    fn start(&mut self, session: &LiveSession) -> bool {
        if self.current.is_some() {
            self.stop();
        }

        let snapshot = LiveSnapshot {
            session: session.clone(),
            status: LiveStatus::initial(session),
            updated_at: Utc::now(),
        };

        match self.write(&snapshot) {
            Ok(()) => {
                tracing::info!(
                    "Started live status for fast {} at {:?}",
                    session.session_id,
                    self.path
                );
                self.current = Some(snapshot);
                true
            }
            Err(e) => {
                tracing::warn!("Unable to start live status at {:?}: {}", self.path, e);
                false
            }
        }
    }

    fn update(&mut self, status: &LiveStatus) {
        let Some(current) = self.current.as_mut() else {
            return;
        };
        current.status = *status;
        current.updated_at = Utc::now();

        let snapshot = current.clone();
        if let Err(e) = self.write(&snapshot) {
            tracing::warn!("Failed to update live status: {}", e);
        }
    }

    fn stop(&mut self) {
        if let Some(current) = self.current.take() {
            tracing::info!("Stopped live status for fast {}", current.session.session_id);
            self.remove();
        }
    }

    fn is_active(&self) -> bool {
        self.current.is_some()
    }
}

/// Read the live status file, if a publication is running.
///
/// A missing or unreadable file means no publication.
pub fn read_live_status(path: &Path) -> Result<Option<LiveSnapshot>> {
    if !path.exists() {
        return Ok(None);
    }

    let mut contents = String::new();
    match File::open(path) {
        Ok(mut file) => {
            file.read_to_string(&mut contents)?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    match serde_json::from_str::<LiveSnapshot>(&contents) {
        Ok(snapshot) => Ok(Some(snapshot)),
        Err(e) => {
            tracing::warn!("Failed to parse live status {:?}: {}", path, e);
            Ok(None)
        }
    }
}
