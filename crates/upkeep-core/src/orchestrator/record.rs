//! Cycle data model shared by the state machine and the journal.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::vcs::VersionMarker;

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// What started a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Timer,
    Manual,
    Signal,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Timer => "timer",
            Self::Manual => "manual",
            Self::Signal => "signal",
        })
    }
}

// ---------------------------------------------------------------------------
// CyclePhase
// ---------------------------------------------------------------------------

/// Orchestrator state.
///
/// `Idle → Checking → ApplyingCode → ApplyingAssets → Restarting → Idle`,
/// with `Failed` as the terminal state of a cycle that went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Idle,
    Checking,
    ApplyingCode,
    ApplyingAssets,
    Restarting,
    Failed,
}

impl CyclePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Checking => "checking",
            Self::ApplyingCode => "applying_code",
            Self::ApplyingAssets => "applying_assets",
            Self::Restarting => "restarting",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// CycleStatus
// ---------------------------------------------------------------------------

/// Journal status of a cycle.
///
/// Transitions: `Running → Completed | Failed`. A cycle still `Running` when
/// the orchestrator starts up was cut short and becomes `Interrupted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CycleStatus {
    Running,
    Completed { outcome: String },
    Failed { reason: String },
    Interrupted,
}

impl CycleStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Interrupted => "interrupted",
        }
    }
}

// ---------------------------------------------------------------------------
// CycleRecord
// ---------------------------------------------------------------------------

/// Journaled view of one update attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleRecord {
    pub id: Uuid,
    pub trigger: Trigger,
    pub phase: CyclePhase,
    pub status: CycleStatus,
    /// Set before the stop request goes out.
    pub service_stopped: bool,
    /// Set once a start request succeeded.
    pub service_started: bool,
    pub from: Option<VersionMarker>,
    pub to: Option<VersionMarker>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CycleRecord {
    pub fn new(id: Uuid, trigger: Trigger) -> Self {
        let now = Utc::now();
        Self {
            id,
            trigger,
            phase: CyclePhase::Checking,
            status: CycleStatus::Running,
            service_stopped: false,
            service_started: false,
            from: None,
            to: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(self.status, CycleStatus::Running)
    }

    /// A cycle that stopped the service and never got it started again.
    pub fn left_service_down(&self) -> bool {
        self.service_stopped && !self.service_started
    }
}
