//! Per-run execution state
//!
//! The [`StateTracker`] is owned by the orchestrator for the duration of a run.
//! It validates every phase transition, logs one structured line per
//! transition, and renders the final summary and exit code.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::info;

use crate::Error;

/// Status of one phase in one run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PhaseStatus {
    /// Not yet reached
    Pending,
    /// Action or verification in progress
    Running,
    /// Not applicable, or already satisfied
    Skipped,
    /// Verified (possibly with a warning)
    Completed,
    /// Aborted the run
    Failed,
}

impl PhaseStatus {
    /// Terminal statuses are never left within a run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PhaseStatus::Skipped | PhaseStatus::Completed | PhaseStatus::Failed
        )
    }

    fn can_transition_to(&self, next: PhaseStatus) -> bool {
        use PhaseStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Skipped)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
        )
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseStatus::Pending => write!(f, "pending"),
            PhaseStatus::Running => write!(f, "running"),
            PhaseStatus::Skipped => write!(f, "skipped"),
            PhaseStatus::Completed => write!(f, "completed"),
            PhaseStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Overall state of a run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    /// Nothing executed yet
    NotStarted,
    /// Phases are executing
    InProgress,
    /// Every phase reached skipped or completed
    Completed,
    /// A fatal failure stopped the run
    Aborted,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::NotStarted => write!(f, "not started"),
            RunState::InProgress => write!(f, "in progress"),
            RunState::Completed => write!(f, "completed"),
            RunState::Aborted => write!(f, "aborted"),
        }
    }
}

/// Execution record of one phase
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionState {
    /// Current status
    pub status: PhaseStatus,
    /// Wall-clock time the phase started running
    pub started_at: Option<DateTime<Utc>>,
    /// Wall-clock time the phase reached a terminal status
    pub finished_at: Option<DateTime<Utc>>,
    /// Time spent running, across every action attempt and the verification
    pub duration: Option<Duration>,
    /// Error that failed the phase
    pub last_error: Option<String>,
    /// Soft failure or conservative skip
    pub warning: Option<String>,
    /// Informational note (skip reason, "already initialized", ...)
    pub note: Option<String>,
    /// Action attempts made
    pub attempts: u32,
}

impl ExecutionState {
    /// A fresh pending state
    pub fn pending() -> Self {
        Self {
            status: PhaseStatus::Pending,
            started_at: None,
            finished_at: None,
            duration: None,
            last_error: None,
            warning: None,
            note: None,
            attempts: 0,
        }
    }
}

/// One row of the final summary
#[derive(Clone, Debug, PartialEq)]
pub struct SummaryRow {
    /// Phase name
    pub phase: String,
    /// Terminal (or pending) status
    pub status: PhaseStatus,
    /// Time spent running
    pub duration: Option<Duration>,
    /// Warning text, if any
    pub warning: Option<String>,
    /// Error or note text, if any
    pub detail: Option<String>,
}

/// Tracks phase states for one run
#[derive(Debug)]
pub struct StateTracker {
    order: Vec<String>,
    states: HashMap<String, ExecutionState>,
    clocks: HashMap<String, Instant>,
    run_state: RunState,
}

impl StateTracker {
    /// Create a tracker with every phase pending
    pub fn new<I, S>(phases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let order: Vec<String> = phases.into_iter().map(Into::into).collect();
        let states = order
            .iter()
            .map(|name| (name.clone(), ExecutionState::pending()))
            .collect();
        Self {
            order,
            states,
            clocks: HashMap::new(),
            run_state: RunState::NotStarted,
        }
    }

    /// Record a new state for `phase`.
    ///
    /// Rejects unknown phases, rewrites of terminal states, and transitions
    /// outside `pending -> (skipped | running) -> (completed | failed)`.
    pub fn record(&mut self, phase: &str, state: ExecutionState) -> Result<(), Error> {
        let current = self
            .states
            .get_mut(phase)
            .ok_or_else(|| Error::state(phase, "unknown phase"))?;

        let from = current.status;
        if !from.can_transition_to(state.status) {
            return Err(Error::state(
                phase,
                format!("invalid transition {} -> {}", from, state.status),
            ));
        }

        info!(
            phase = %phase,
            from = %from,
            to = %state.status,
            duration_ms = state.duration.map(|d| d.as_millis() as u64),
            error = state.last_error.as_deref(),
            warning = state.warning.as_deref(),
            "Phase transition"
        );

        *current = state;
        Ok(())
    }

    /// pending -> running
    pub fn mark_running(&mut self, phase: &str) -> Result<(), Error> {
        let mut state = self.current(phase)?;
        state.status = PhaseStatus::Running;
        state.started_at = Some(Utc::now());
        self.record(phase, state)?;
        self.clocks.insert(phase.to_string(), Instant::now());
        Ok(())
    }

    /// pending -> skipped
    pub fn mark_skipped(
        &mut self,
        phase: &str,
        reason: impl Into<String>,
        warning: Option<String>,
    ) -> Result<(), Error> {
        let mut state = self.current(phase)?;
        state.status = PhaseStatus::Skipped;
        state.finished_at = Some(Utc::now());
        state.note = Some(reason.into());
        state.warning = warning;
        self.record(phase, state)
    }

    /// running -> completed
    pub fn mark_completed(
        &mut self,
        phase: &str,
        warning: Option<String>,
        note: Option<String>,
    ) -> Result<(), Error> {
        let mut state = self.current(phase)?;
        state.status = PhaseStatus::Completed;
        state.finished_at = Some(Utc::now());
        state.duration = self.elapsed(phase);
        state.warning = warning;
        if note.is_some() {
            state.note = note;
        }
        self.record(phase, state)
    }

    /// pending | running -> failed
    pub fn mark_failed(&mut self, phase: &str, error: impl Into<String>) -> Result<(), Error> {
        let mut state = self.current(phase)?;
        state.status = PhaseStatus::Failed;
        state.finished_at = Some(Utc::now());
        state.duration = self.elapsed(phase);
        state.last_error = Some(error.into());
        self.record(phase, state)
    }

    /// Store the number of action attempts without changing status
    pub fn set_attempts(&mut self, phase: &str, attempts: u32) -> Result<(), Error> {
        let state = self
            .states
            .get_mut(phase)
            .ok_or_else(|| Error::state(phase, "unknown phase"))?;
        state.attempts = attempts;
        Ok(())
    }

    /// NotStarted -> InProgress
    pub fn start_run(&mut self) {
        if self.run_state == RunState::NotStarted {
            self.run_state = RunState::InProgress;
        }
    }

    /// InProgress -> Completed
    pub fn complete_run(&mut self) {
        if self.run_state == RunState::InProgress {
            self.run_state = RunState::Completed;
        }
    }

    /// Any non-terminal run state -> Aborted
    pub fn abort_run(&mut self) {
        if self.run_state != RunState::Completed {
            self.run_state = RunState::Aborted;
        }
    }

    /// Current run state
    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    /// State of one phase
    pub fn get(&self, phase: &str) -> Option<&ExecutionState> {
        self.states.get(phase)
    }

    /// Status of one phase
    pub fn status(&self, phase: &str) -> Option<PhaseStatus> {
        self.states.get(phase).map(|s| s.status)
    }

    /// Phase names in execution order
    pub fn phases(&self) -> &[String] {
        &self.order
    }

    /// Ordered summary of every phase
    pub fn summary(&self) -> Vec<SummaryRow> {
        self.order
            .iter()
            .filter_map(|name| {
                self.states.get(name).map(|state| SummaryRow {
                    phase: name.clone(),
                    status: state.status,
                    duration: state.duration,
                    warning: state.warning.clone(),
                    detail: state.last_error.clone().or_else(|| state.note.clone()),
                })
            })
            .collect()
    }

    /// (phase, warning) for every phase that carries a warning
    pub fn warnings(&self) -> Vec<(&str, &str)> {
        self.order
            .iter()
            .filter_map(|name| {
                self.states
                    .get(name)
                    .and_then(|s| s.warning.as_deref())
                    .map(|w| (name.as_str(), w))
            })
            .collect()
    }

    /// The failed phase and its error, if the run aborted on one
    pub fn failure(&self) -> Option<(&str, &str)> {
        self.order.iter().find_map(|name| {
            let state = self.states.get(name)?;
            if state.status != PhaseStatus::Failed {
                return None;
            }
            Some((name.as_str(), state.last_error.as_deref().unwrap_or("unknown error")))
        })
    }

    /// Process exit code: 0 when the run completed with no failed phase.
    /// Warnings do not affect it.
    pub fn exit_code(&self) -> i32 {
        if self.run_state == RunState::Completed && self.failure().is_none() {
            0
        } else {
            1
        }
    }

    /// Fixed-width summary table
    pub fn render(&self) -> String {
        let rows = self.summary();
        let width = rows
            .iter()
            .map(|r| r.phase.len())
            .max()
            .unwrap_or(0)
            .max("PHASE".len());

        let mut out = format!(
            "{:<width$}  {:<9}  {:>9}  {}\n",
            "PHASE",
            "STATUS",
            "DURATION",
            "NOTE",
            width = width
        );
        for row in rows {
            let duration = row
                .duration
                .map(format_duration)
                .unwrap_or_else(|| "-".to_string());
            let note = match (&row.warning, &row.detail) {
                (Some(w), _) => format!("WARNING: {}", w),
                (None, Some(d)) => d.clone(),
                (None, None) => String::new(),
            };
            let line = format!(
                "{:<width$}  {:<9}  {:>9}  {}",
                row.phase,
                row.status.to_string(),
                duration,
                note,
                width = width
            );
            out.push_str(line.trim_end());
            out.push('\n');
        }
        out.push_str(&format!("run: {}\n", self.run_state));
        out
    }

    fn current(&self, phase: &str) -> Result<ExecutionState, Error> {
        self.states
            .get(phase)
            .cloned()
            .ok_or_else(|| Error::state(phase, "unknown phase"))
    }

    fn elapsed(&self, phase: &str) -> Option<Duration> {
        self.clocks.get(phase).map(|start| start.elapsed())
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs_f64();
    if secs < 60.0 {
        format!("{:.1}s", secs)
    } else {
        format!("{}m{:02}s", d.as_secs() / 60, d.as_secs() % 60)
    }
}
