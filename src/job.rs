use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Aborted
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Running => write!(f, "running"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
            JobState::Aborted => write!(f, "aborted"),
        }
    }
}

/// Scheduler jobs feed the abort-suppression policy; system jobs do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    Scheduler,
    System,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::Scheduler => write!(f, "scheduler"),
            JobKind::System => write!(f, "system"),
        }
    }
}

/// Terminal-state notification consumed by the slot manager's feedback
/// handlers.
#[derive(Debug, Clone)]
pub struct FinishedJob {
    pub id: Uuid,
    pub kind: JobKind,
    pub state: JobState,
    pub gpu_requested: bool,
}

/// What a caller submits to the job controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: Uuid,
    pub command: String,
    pub kind: JobKind,
    pub gpu_requested: bool,
    pub cpu: f64,
    pub allow_cpu_idle_policy: bool,
    pub disk_space: i64,
    pub medium_index: Option<i32>,
    pub created_at: DateTime<Utc>,
}

impl JobSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            command: command.into(),
            kind: JobKind::Scheduler,
            gpu_requested: false,
            cpu: 1.0,
            allow_cpu_idle_policy: false,
            disk_space: 0,
            medium_index: None,
            created_at: Utc::now(),
        }
    }
}

/// Controller-side bookkeeping for one job.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub spec: JobSpec,
    pub state: JobState,
    pub slot_index: Option<usize>,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(spec: JobSpec) -> Self {
        Self {
            spec,
            state: JobState::Pending,
            slot_index: None,
            exit_code: None,
            output: None,
            error: None,
            completed_at: None,
        }
    }
}
