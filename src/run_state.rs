use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt;

/// Overall outcome of a run. Ordered by severity; a run only ever degrades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum RunStatus {
    Success,
    /// Some folders could not be placed on any tape
    Error,
    /// At least one slot failed to write
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Success => write!(f, "SUCCESS"),
            RunStatus::Error => write!(f, "ERROR"),
            RunStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Size of one archived folder, as shown in the report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FolderSize {
    pub name: String,
    pub size_mb: u64,
}

/// Outcome of writing one tape
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotResult {
    pub slot_id: u32,
    pub label: String,
    pub start_time: DateTime<Local>,
    pub stop_time: DateTime<Local>,
    pub exit_code: i32,
    pub folders: Vec<FolderSize>,
}

impl SlotResult {
    pub fn size_mb(&self) -> u64 {
        self.folders.iter().map(|f| f.size_mb).sum()
    }

    /// Whole seconds between start and stop, never negative
    pub fn duration_secs(&self) -> u64 {
        (self.stop_time - self.start_time).num_seconds().max(0) as u64
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run-wide status, error messages and unplaced folders. Owned by the
/// orchestrator; the report and the notification read it at the end.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunState {
    status: RunStatus,
    errors: Vec<String>,
    unallocated: Vec<String>,
    results: Vec<SlotResult>,
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

impl RunState {
    pub fn new() -> Self {
        Self {
            status: RunStatus::Success,
            errors: Vec::new(),
            unallocated: Vec::new(),
            results: Vec::new(),
        }
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn unallocated(&self) -> &[String] {
        &self.unallocated
    }

    pub fn results(&self) -> &[SlotResult] {
        &self.results
    }

    /// Move to `status` if it is worse than the current one
    pub fn degrade(&mut self, status: RunStatus) {
        self.status = self.status.max(status);
    }

    pub fn record_error<T: Into<String>>(&mut self, message: T) {
        self.errors.push(message.into());
    }

    pub fn absorb_errors<I: IntoIterator<Item = String>>(&mut self, messages: I) {
        self.errors.extend(messages);
    }

    /// Folders that fit nowhere degrade the run to `Error`
    pub fn set_unallocated(&mut self, unallocated: Vec<String>) {
        if !unallocated.is_empty() {
            self.degrade(RunStatus::Error);
        }
        self.unallocated = unallocated;
    }

    /// A non-zero exit code degrades the run to `Failed`
    pub fn record_slot(&mut self, result: SlotResult) {
        if !result.succeeded() {
            self.degrade(RunStatus::Failed);
        }
        self.results.push(result);
    }
}
