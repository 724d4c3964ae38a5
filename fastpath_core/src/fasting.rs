//! The fasting state machine.
//!
//! [`reduce`] applies one [`Action`] to the [`FastingState`] and returns the
//! [`Effect`]s the runtime must perform. It never touches the store, the
//! clock or the live surface itself: results of those effects come back as
//! further actions (`FastSaved`, `Tick`, `LiveStartResult`, ...) through the
//! same single-threaded pipeline.
//!
//! Transitions are optimistic. A failed write rolls the transition back,
//! records `last_error` and reloads from the store to reconcile.

use crate::live::{LiveSession, LiveStatus};
use crate::{FastingGoal, FastingRecord};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Top-level session state
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FastingStatus {
    Idle,
    Fasting,
}

/// In-memory view state owned by the runtime
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct FastingState {
    pub active_record: Option<FastingRecord>,
    /// Newest start time first
    pub history: Vec<FastingRecord>,
    pub current_elapsed_secs: u64,
    pub selected_goal: Option<FastingGoal>,
    pub available_goals: Vec<FastingGoal>,
    pub goal_picker_open: bool,
    pub live_enabled: bool,
    pub live_active: bool,
    pub is_loading: bool,
    /// Store operations issued but not yet answered
    pub pending_ops: u32,
    /// Session whose tick stream is running
    pub ticking_for: Option<Uuid>,
    pub last_error: Option<String>,
    /// Record writes (start, stop, delete) not yet answered by the store
    #[serde(skip)]
    record_writes: u32,
    /// Goal writes not yet answered by the store
    #[serde(skip)]
    goal_writes: u32,
    /// A load came back while writes were in flight; reload once they land
    #[serde(skip)]
    reload_after_writes: bool,
}

impl FastingState {
    pub fn new(live_enabled: bool) -> Self {
        Self {
            live_enabled,
            ..Self::default()
        }
    }

    pub fn is_fasting(&self) -> bool {
        self.active_record.is_some()
    }

    pub fn status(&self) -> FastingStatus {
        if self.is_fasting() {
            FastingStatus::Fasting
        } else {
            FastingStatus::Idle
        }
    }

    /// Seconds left until the selected goal; only while fasting with a goal
    pub fn remaining_secs(&self) -> Option<u64> {
        if !self.is_fasting() {
            return None;
        }
        self.selected_goal
            .as_ref()
            .map(|goal| goal.remaining_after(self.current_elapsed_secs))
    }

    pub fn goal_reached(&self) -> bool {
        self.remaining_secs() == Some(0)
    }

    /// True once loading finished and every store operation was answered
    pub fn is_settled(&self) -> bool {
        !self.is_loading && self.pending_ops == 0
    }

    fn live_status(&self) -> Option<LiveStatus> {
        let remaining_secs = self.remaining_secs()?;
        Some(LiveStatus {
            elapsed_secs: self.current_elapsed_secs,
            remaining_secs,
            goal_reached: remaining_secs == 0,
        })
    }

    fn live_session(&self) -> Option<LiveSession> {
        let record = self.active_record.as_ref()?;
        let goal = self.selected_goal.as_ref()?;
        Some(LiveSession {
            session_id: record.id,
            start_time: record.start_time,
            goal_duration_secs: goal.target_duration_secs,
            goal_name: Some(goal.name.clone()),
        })
    }

    fn upsert_available_goal(&mut self, goal: &FastingGoal) {
        match self.available_goals.iter_mut().find(|g| g.name == goal.name) {
            Some(existing) => *existing = goal.clone(),
            None => self.available_goals.push(goal.clone()),
        }
    }

    fn op_started(&mut self) {
        self.pending_ops += 1;
    }

    fn op_finished(&mut self) {
        self.pending_ops = self.pending_ops.saturating_sub(1);
    }

    fn record_write_started(&mut self) {
        self.op_started();
        self.record_writes += 1;
    }

    fn record_write_finished(&mut self) {
        self.op_finished();
        self.record_writes = self.record_writes.saturating_sub(1);
    }

    fn goal_write_started(&mut self) {
        self.op_started();
        self.goal_writes += 1;
    }

    fn goal_write_finished(&mut self) {
        self.op_finished();
        self.goal_writes = self.goal_writes.saturating_sub(1);
    }
}

/// Everything read from the store on load
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LoadedState {
    pub active: Option<FastingRecord>,
    pub history: Vec<FastingRecord>,
    pub goals: Vec<FastingGoal>,
    pub selected_goal: Option<FastingGoal>,
}

/// Inputs to the state machine: user intent and effect results
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    LoadInitialState,
    InitialStateLoaded(LoadedState),
    LoadFailed(String),

    StartFast,
    FastSaved(FastingRecord),
    FastSaveFailed { record: FastingRecord, error: String },

    StopFast,
    FastStopped(FastingRecord),
    FastStopFailed { record: FastingRecord, error: String },

    Tick { session: Uuid },

    DeleteRecord(Uuid),
    RecordDeleted { id: Uuid, removed: bool },
    DeleteFailed { id: Uuid, error: String },

    SelectGoal(FastingGoal),
    SetCustomGoal { hours: u64, name: Option<String> },
    ClearGoal,
    GoalPersisted,
    GoalPersistFailed {
        goal: Option<FastingGoal>,
        previous: Option<FastingGoal>,
        error: String,
    },
    SetGoalPicker(bool),

    SetLiveEnabled(bool),
    LiveStartResult { session: Uuid, started: bool },

    ShowHistory,
    DismissError,
}

/// Commands for the runtime
#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    LoadAll,
    SaveRecord(FastingRecord),
    UpdateRecord(FastingRecord),
    DeleteRecord(Uuid),
    /// Save the goal definition (if any) and point the selection at it
    PersistGoal {
        goal: Option<FastingGoal>,
        previous: Option<FastingGoal>,
    },
    StartTicker(Uuid),
    CancelTicker(Uuid),
    StartLive(LiveSession),
    UpdateLive(LiveStatus),
    StopLive,
    ShowHistory,
}

/// Apply `action` at wall-clock time `now`
pub fn reduce(state: &mut FastingState, action: Action, now: DateTime<Utc>) -> Vec<Effect> {
    let mut effects = Vec::new();
    apply(state, action, now, &mut effects);

    // The store answers in order, so a load issued now sees every earlier write
    if state.reload_after_writes && state.record_writes == 0 && state.goal_writes == 0 {
        state.reload_after_writes = false;
        if !effects.contains(&Effect::LoadAll) {
            request_load(state, &mut effects);
        }
    }
    effects
}

fn apply(state: &mut FastingState, action: Action, now: DateTime<Utc>, effects: &mut Vec<Effect>) {
    match action {
        Action::LoadInitialState => {
            request_load(state, effects);
        }

        Action::InitialStateLoaded(loaded) => {
            state.op_finished();
            state.is_loading = false;

            // Writes still in flight were issued after this load was read:
            // keep their optimistic values and read again once they land
            if state.record_writes > 0 || state.goal_writes > 0 {
                tracing::debug!(
                    "Load predates {} record and {} goal writes, keeping local values",
                    state.record_writes,
                    state.goal_writes
                );
                state.reload_after_writes = true;
            }
            if state.record_writes == 0 {
                state.active_record = loaded.active;
                state.history = loaded.history;
                state.current_elapsed_secs = state
                    .active_record
                    .as_ref()
                    .map(|r| r.elapsed_at(now))
                    .unwrap_or(0);
                if state.is_fasting() {
                    begin_ticker(state, effects);
                } else {
                    end_ticker(state, effects);
                }
            }
            if state.goal_writes == 0 {
                state.available_goals = loaded.goals;
                state.selected_goal = loaded.selected_goal;
            }
            sync_live(state, effects);
        }

        Action::LoadFailed(error) => {
            state.op_finished();
            state.is_loading = false;
            tracing::warn!("Loading fasting state failed: {}", error);
            state.last_error = Some(format!("Could not load fasting data: {}", error));
        }

        Action::StartFast => {
            if let Some(active) = &state.active_record {
                tracing::debug!("Start ignored, fast {} already running", active.id);
                return;
            }

            let record = FastingRecord::new(now);
            tracing::info!("Starting fast {}", record.id);
            state.active_record = Some(record.clone());
            state.current_elapsed_secs = 0;
            state.record_write_started();
            effects.push(Effect::SaveRecord(record));
            sync_live(state, effects);
        }

        Action::FastSaved(record) => {
            state.record_write_finished();
            if state.active_record.as_ref().map(|r| r.id) == Some(record.id) {
                begin_ticker(state, effects);
            } else {
                // The local state moved on without this record; ask the store
                tracing::debug!("Fast {} saved but no longer held, reloading", record.id);
                request_load(state, effects);
            }
        }

        Action::FastSaveFailed { record, error } => {
            state.record_write_finished();
            tracing::warn!("Saving fast {} failed: {}", record.id, error);
            if state.active_record.as_ref().map(|r| r.id) == Some(record.id) {
                state.active_record = None;
                state.current_elapsed_secs = 0;
                end_ticker(state, effects);
                sync_live(state, effects);
            }
            state.last_error = Some(format!("Could not start fast: {}", error));
            request_load(state, effects);
        }

        Action::StopFast => {
            let Some(active) = state.active_record.take() else {
                tracing::debug!("Stop ignored, no active fast");
                return;
            };

            let stopped = active.stopped_at(now);
            tracing::info!("Stopping fast {}", stopped.id);
            state.current_elapsed_secs = 0;
            end_ticker(state, effects);
            sync_live(state, effects);
            state.record_write_started();
            effects.push(Effect::UpdateRecord(stopped));
        }

        Action::FastStopped(record) => {
            state.record_write_finished();
            match state.history.iter_mut().find(|r| r.id == record.id) {
                Some(existing) => *existing = record,
                None => state.history.insert(0, record),
            }
        }

        Action::FastStopFailed { record, error } => {
            state.record_write_finished();
            tracing::warn!("Stopping fast {} failed: {}", record.id, error);
            if state.active_record.is_none() {
                state.active_record = Some(FastingRecord {
                    end_time: None,
                    ..record
                });
                if let Some(active) = &state.active_record {
                    state.current_elapsed_secs = active.elapsed_at(now);
                }
                begin_ticker(state, effects);
                sync_live(state, effects);
            }
            state.last_error = Some(format!("Could not stop fast: {}", error));
            request_load(state, effects);
        }

        Action::Tick { session } => {
            let Some(active) = &state.active_record else {
                effects.push(Effect::CancelTicker(session));
                return;
            };
            if active.id != session {
                effects.push(Effect::CancelTicker(session));
                return;
            }

            // Recomputed from the wall clock so skipped ticks cause no drift
            let elapsed = active.elapsed_at(now);
            state.current_elapsed_secs = state.current_elapsed_secs.max(elapsed);

            if state.live_active {
                if let Some(status) = state.live_status() {
                    effects.push(Effect::UpdateLive(status));
                }
            }
        }

        Action::DeleteRecord(id) => {
            if state.active_record.as_ref().map(|r| r.id) == Some(id) {
                state.last_error =
                    Some("Stop the current fast before deleting it".to_string());
                return;
            }
            state.record_write_started();
            effects.push(Effect::DeleteRecord(id));
        }

        Action::RecordDeleted { id, removed } => {
            state.record_write_finished();
            if !removed {
                tracing::debug!("Record {} was already gone from the store", id);
            }
            state.history.retain(|r| r.id != id);
        }

        Action::DeleteFailed { id, error } => {
            state.record_write_finished();
            tracing::warn!("Deleting record {} failed: {}", id, error);
            state.last_error = Some(format!("Could not delete record: {}", error));
        }

        Action::SelectGoal(goal) => {
            apply_goal(state, Some(goal), effects);
        }

        Action::SetCustomGoal { hours, name } => {
            match FastingGoal::custom(hours, name.as_deref()) {
                Ok(goal) => apply_goal(state, Some(goal), effects),
                Err(e) => state.last_error = Some(e.to_string()),
            }
        }

        Action::ClearGoal => {
            apply_goal(state, None, effects);
        }

        Action::GoalPersisted => {
            state.goal_write_finished();
        }

        Action::GoalPersistFailed {
            goal,
            previous,
            error,
        } => {
            state.goal_write_finished();
            tracing::warn!("Persisting goal selection failed: {}", error);
            state.last_error = Some(format!("Could not save goal: {}", error));
            if state.selected_goal == goal {
                state.selected_goal = previous;
                restart_live(state, effects);
            }
        }

        Action::SetGoalPicker(open) => {
            state.goal_picker_open = open;
        }

        Action::SetLiveEnabled(enabled) => {
            state.live_enabled = enabled;
            sync_live(state, effects);
        }

        Action::LiveStartResult { session, started } => {
            let current = state.active_record.as_ref().map(|r| r.id);
            if !started && current == Some(session) {
                tracing::info!("Live surface unavailable for fast {}", session);
                state.live_active = false;
            }
        }

        Action::ShowHistory => {
            effects.push(Effect::ShowHistory);
        }

        Action::DismissError => {
            state.last_error = None;
        }
    }
}

fn request_load(state: &mut FastingState, effects: &mut Vec<Effect>) {
    state.is_loading = true;
    state.op_started();
    effects.push(Effect::LoadAll);
}

/// Start the tick stream for the active record unless it already runs
fn begin_ticker(state: &mut FastingState, effects: &mut Vec<Effect>) {
    let Some(active_id) = state.active_record.as_ref().map(|r| r.id) else {
        return;
    };
    if state.ticking_for == Some(active_id) {
        return;
    }
    if let Some(stale) = state.ticking_for.take() {
        effects.push(Effect::CancelTicker(stale));
    }
    state.ticking_for = Some(active_id);
    effects.push(Effect::StartTicker(active_id));
}

fn end_ticker(state: &mut FastingState, effects: &mut Vec<Effect>) {
    if let Some(id) = state.ticking_for.take() {
        effects.push(Effect::CancelTicker(id));
    }
}

/// Bring the live mirror in line with the state: it runs exactly when the
/// surface is enabled and a fast with a goal is in progress.
fn sync_live(state: &mut FastingState, effects: &mut Vec<Effect>) {
    let wanted = state.live_enabled && state.is_fasting() && state.selected_goal.is_some();

    if wanted && !state.live_active {
        start_live(state, effects);
    } else if !wanted && state.live_active {
        state.live_active = false;
        effects.push(Effect::StopLive);
    }
}

/// Like [`sync_live`], but a running mirror is restarted so it picks up a
/// changed goal.
fn restart_live(state: &mut FastingState, effects: &mut Vec<Effect>) {
    if state.live_active && state.selected_goal.is_some() {
        start_live(state, effects);
    } else {
        sync_live(state, effects);
    }
}

fn start_live(state: &mut FastingState, effects: &mut Vec<Effect>) {
    let (Some(session), Some(status)) = (state.live_session(), state.live_status()) else {
        return;
    };
    state.live_active = true;
    effects.push(Effect::StartLive(session));
    effects.push(Effect::UpdateLive(status));
}

fn apply_goal(state: &mut FastingState, goal: Option<FastingGoal>, effects: &mut Vec<Effect>) {
    if let Some(goal) = &goal {
        state.upsert_available_goal(goal);
    }
    let previous = std::mem::replace(&mut state.selected_goal, goal.clone());
    state.goal_picker_open = false;
    state.goal_write_started();
    effects.push(Effect::PersistGoal {
        goal,
        previous: previous.clone(),
    });

    if state.selected_goal != previous {
        restart_live(state, effects);
    }
}
