//! Tape autoloader control
//!
//! The orchestrator only sees [`MediaChanger`] and the parsed types below.
//! How a status is obtained (here: `mtx`/`mt` text output) stays inside the
//! implementation.

pub mod mtx;

use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

pub use mtx::MtxChanger;

/// Handle to the changer control node chosen for this run. Created once by
/// [`MediaChanger::discover_device`] and passed to every later call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangerDevice {
    path: PathBuf,
}

impl ChangerDevice {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for ChangerDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// State of one storage slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotStatus {
    pub id: u32,
    pub occupied: bool,
    /// Barcode label; empty when missing or unreadable
    pub label: String,
}

/// State of the drive (data transfer element)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransferStatus {
    pub empty: bool,
    pub label: String,
}

#[async_trait]
pub trait MediaChanger: Send + Sync {
    /// Probe the control nodes and return the first one answering with a
    /// valid status. No answer is a configuration error.
    async fn discover_device(&self) -> Result<ChangerDevice>;

    /// Status of the requested slots, in the requested order. Slots the
    /// changer does not report are returned as empty.
    async fn scan_slots(
        &self,
        device: &ChangerDevice,
        candidate_ids: &[u32],
    ) -> Result<Vec<SlotStatus>>;

    async fn transfer_status(&self, device: &ChangerDevice) -> Result<TransferStatus>;

    /// Rewind and return the loaded cartridge to its slot. No-op when the
    /// drive is already empty.
    async fn unload_transfer(&self, device: &ChangerDevice) -> Result<()>;

    /// Load, rewind and set the block size. The drive must be empty.
    async fn load_tape(&self, device: &ChangerDevice, slot_id: u32) -> Result<()>;
}
