//! Tape autoloader backup
//!
//! Measures the top-level folders of a source volume, packs them onto the
//! cartridges of a tape library, and writes each cartridge from an LVM
//! snapshot. The allocation plan is complete before any cartridge moves.

pub mod allocation;
pub mod archive;
pub mod catalog;
pub mod changer;
pub mod cli;
pub mod config;
pub mod error;
pub mod logger;
pub mod notify;
pub mod orchestrator;
pub mod report;
pub mod run_state;
pub mod shell;
pub mod snapshot;
pub mod utils;

// Re-export key types for easier use
pub use allocation::{AllocationEngine, AllocationPlan, SlotAssignment, UnallocatedSet};
pub use catalog::{Catalog, Folder, FolderFilter};
pub use changer::{ChangerDevice, MediaChanger, SlotStatus, TransferStatus};
pub use config::BackupConfig;
pub use error::{Result, TapeBackupError};
pub use orchestrator::{BackupOrchestrator, Collaborators, RunOutcome, RunPhase};
pub use run_state::{RunState, RunStatus, SlotResult};
