//! Core domain types for FastPath.
//!
//! This module defines the fundamental types used throughout the system:
//! - Fasting records (one per session)
//! - Fasting goals (named target durations)

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Longest custom goal accepted, in hours (one week)
pub const MAX_CUSTOM_GOAL_HOURS: u64 = 168;

// ============================================================================
// Fasting Records
// ============================================================================

/// A single fasting session with start and optional end time
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FastingRecord {
    pub id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl FastingRecord {
    /// Begin a new session at `start_time`
    pub fn new(start_time: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            start_time,
            end_time: None,
        }
    }

    /// A session is active until it has an end time
    pub fn is_active(&self) -> bool {
        self.end_time.is_none()
    }

    /// Total length of a stopped session; `None` while active
    pub fn duration(&self) -> Option<Duration> {
        self.end_time.map(|end| end - self.start_time)
    }

    /// Whole seconds elapsed between the start and `now`, never negative
    pub fn elapsed_at(&self, now: DateTime<Utc>) -> u64 {
        (now - self.start_time).num_seconds().max(0) as u64
    }

    /// Return a copy of this record stopped at `at`.
    ///
    /// A stop time earlier than the start is clamped to the start so the
    /// duration can never be negative.
    pub fn stopped_at(&self, at: DateTime<Utc>) -> Self {
        Self {
            id: self.id,
            start_time: self.start_time,
            end_time: Some(at.max(self.start_time)),
        }
    }
}

// ============================================================================
// Fasting Goals
// ============================================================================

/// A named target duration for a fast
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FastingGoal {
    pub name: String,
    pub target_duration_secs: u64,
    #[serde(default)]
    pub description: Option<String>,
}

impl FastingGoal {
    pub fn new(name: impl Into<String>, target_duration_secs: u64) -> Self {
        Self {
            name: name.into(),
            target_duration_secs,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Build a user-defined goal of `hours` hours.
    ///
    /// Without a name the goal is called "Custom N-Hour Fast". Names of the
    /// predefined goals are reserved.
    pub fn custom(hours: u64, name: Option<&str>) -> Result<Self> {
        if hours == 0 || hours > MAX_CUSTOM_GOAL_HOURS {
            return Err(Error::InvalidGoal(format!(
                "custom goal must be between 1 and {} hours, got {}",
                MAX_CUSTOM_GOAL_HOURS, hours
            )));
        }

        let name = match name.map(str::trim) {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => format!("Custom {}-Hour Fast", hours),
        };
        if crate::get_predefined_goals()
            .iter()
            .any(|g| g.name.eq_ignore_ascii_case(&name))
        {
            return Err(Error::InvalidGoal(format!(
                "'{}' is a predefined goal and cannot be redefined",
                name
            )));
        }

        let goal = Self::new(name, hours * 3600);
        goal.validate()?;
        Ok(goal)
    }

    /// Check the goal can be persisted
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidGoal("goal name must not be empty".into()));
        }
        if self.target_duration_secs == 0 {
            return Err(Error::InvalidGoal(format!(
                "goal '{}' must have a positive duration",
                self.name
            )));
        }
        Ok(())
    }

    /// Seconds left before the goal is reached, floored at zero
    pub fn remaining_after(&self, elapsed_secs: u64) -> u64 {
        self.target_duration_secs.saturating_sub(elapsed_secs)
    }
}

/// Format seconds as `HH:MM:SS`; hours are not wrapped at 24
pub fn format_hms(secs: u64) -> String {
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}
