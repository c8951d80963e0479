//! Bulk initializer for the event queue
//!
//! Walks every historical (object, user) pair of the host and writes a member
//! record plus a learning progress record for each. Runs are resumable: the
//! task state under `lerq_bgtask_init` carries a keyset cursor that is
//! persisted after every page.
//!
//! ## State machine
//!
//! ```text
//! not started → running → finished | stopped | failed
//!                  ↺ (one checkpoint per page, or a yielded slice)
//! ```

pub mod state;
pub mod collector;
pub mod job;

use serde::{Deserialize, Serialize};

pub use collector::InitialCollector;
pub use job::BackfillJob;
pub use state::{TaskInfo, TaskState, TaskStore, TASK_INFO_KEY};

// ============================================================================
// Configuration
// ============================================================================

/// Which host rows drive the walk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    /// Every local role assignment, with its progress mark when one exists
    RoleAssignment,
    /// Every learning progress mark, with the matching role when one exists
    LearningProgress,
}

/// What to do with a run that still holds the lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumePolicy {
    Refuse,
    /// Take over when the heartbeat is older than `stale_after_secs`
    ResumeStale,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillConfig {
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    #[serde(default = "default_selection")]
    pub selection: SelectionMode,

    /// Learning progress status codes to include, empty for all
    #[serde(default)]
    pub status_filter: Vec<i64>,

    #[serde(default = "default_resume_policy")]
    pub resume_policy: ResumePolicy,

    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,

    /// Pages per invocation before yielding, 0 runs to completion
    #[serde(default)]
    pub max_pages_per_run: u32,

    /// Delay between invocations in watch mode
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
}

fn default_page_size() -> u32 {
    2000
}

fn default_selection() -> SelectionMode {
    SelectionMode::RoleAssignment
}

fn default_resume_policy() -> ResumePolicy {
    ResumePolicy::Refuse
}

fn default_stale_after_secs() -> u64 {
    900
}

fn default_tick_interval_secs() -> u64 {
    30
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            selection: default_selection(),
            status_filter: Vec::new(),
            resume_policy: default_resume_policy(),
            stale_after_secs: default_stale_after_secs(),
            max_pages_per_run: 0,
            tick_interval_secs: default_tick_interval_secs(),
        }
    }
}

// ============================================================================
// Outcome
// ============================================================================

/// Result code of one job invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobOutcome {
    /// Slice done, invoke again
    Pending,
    Success,
    AlreadyRunning,
    Locked,
    Stopped,
    Failed,
}

impl JobOutcome {
    pub fn code(&self) -> u16 {
        match self {
            JobOutcome::Pending => 100,
            JobOutcome::Success => 200,
            JobOutcome::AlreadyRunning => 201,
            JobOutcome::Locked => 202,
            JobOutcome::Stopped => 203,
            JobOutcome::Failed => 400,
        }
    }

    /// Whether another invocation can make progress
    pub fn is_pending(&self) -> bool {
        matches!(self, JobOutcome::Pending)
    }
}

impl std::fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}
