//! Folder to tape slot allocation
//!
//! First-fit, slot-major and greedy: slots are filled one after another, each
//! taking candidates in catalog order while the running total stays strictly
//! below the tape capacity. A folder skipped by one slot stays available for
//! the next; a placed folder is never reconsidered. This keeps the tape
//! contents predictable from run to run and is not meant to be an optimal
//! bin packing.
//!
//! When prefix groups are configured, a slot whose pass starts while any
//! `<prefix>_*` folder is still unplaced is locked to that single prefix, so
//! prefixed folders get tapes of their own before unprefixed packing resumes.

use crate::catalog::{Catalog, FolderFilter};
use crate::config::BackupConfig;
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, error, info};

/// Folders assigned to one slot, in write order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotAssignment {
    pub slot_id: u32,
    /// Prefix group this slot was locked to, if any
    pub prefix: Option<String>,
    pub folders: Vec<String>,
    pub total_mb: u64,
}

impl SlotAssignment {
    pub fn is_empty(&self) -> bool {
        self.folders.is_empty()
    }
}

/// One entry per input slot, in input order. Slots that received nothing
/// have an empty folder list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AllocationPlan {
    pub slots: Vec<SlotAssignment>,
}

impl AllocationPlan {
    pub fn get(&self, slot_id: u32) -> Option<&SlotAssignment> {
        self.slots.iter().find(|s| s.slot_id == slot_id)
    }

    /// Slots that will actually be written
    pub fn non_empty(&self) -> impl Iterator<Item = &SlotAssignment> {
        self.slots.iter().filter(|s| !s.is_empty())
    }

    pub fn placed_folders(&self) -> impl Iterator<Item = &str> {
        self.slots
            .iter()
            .flat_map(|s| s.folders.iter().map(String::as_str))
    }
}

/// Candidates that fit on none of the available slots, in catalog order
pub type UnallocatedSet = Vec<String>;

#[derive(Debug, Clone)]
pub struct AllocationEngine {
    capacity_mb: u64,
    filter: FolderFilter,
    prefixes: Vec<String>,
}

impl AllocationEngine {
    pub fn new(capacity_mb: u64, filter: FolderFilter, prefixes: Vec<String>) -> Self {
        Self {
            capacity_mb,
            filter,
            prefixes,
        }
    }

    pub fn from_config(config: &BackupConfig) -> Self {
        Self::new(
            config.capacity_mb(),
            FolderFilter::from_config(&config.source),
            config.source.special_tape_prefixes.clone(),
        )
    }

    /// Prefix group a folder name belongs to; the first configured match wins
    pub fn prefix_of(&self, name: &str) -> Option<&str> {
        self.prefixes
            .iter()
            .find(|prefix| in_group(name, prefix))
            .map(String::as_str)
    }

    /// Assign catalog folders to `slots`. Pure and deterministic.
    pub fn allocate(&self, catalog: &Catalog, slots: &[u32]) -> (AllocationPlan, UnallocatedSet) {
        let candidates: Vec<_> = catalog
            .folders()
            .iter()
            .filter(|f| self.filter.is_candidate(&f.name))
            .collect();

        let mut placed: HashSet<&str> = HashSet::new();
        let mut plan = AllocationPlan::default();

        for &slot_id in slots {
            let lock = candidates
                .iter()
                .filter(|f| !placed.contains(f.name.as_str()))
                .find_map(|f| self.prefix_of(&f.name));

            if let Some(prefix) = lock {
                debug!("SLOT {} | FILTERING FOR PREFIX {}", slot_id, prefix);
            }

            let mut assignment = SlotAssignment {
                slot_id,
                prefix: lock.map(str::to_string),
                folders: Vec::new(),
                total_mb: 0,
            };
            let mut skipped = Vec::new();

            for folder in &candidates {
                if placed.contains(folder.name.as_str()) {
                    continue;
                }
                // a locked slot takes every `<prefix>_*` name, also those
                // whose first configured match is another prefix
                if let Some(prefix) = lock {
                    if !in_group(&folder.name, prefix) {
                        continue;
                    }
                }

                let total = assignment.total_mb.saturating_add(folder.size_mb);
                if total < self.capacity_mb {
                    assignment.folders.push(folder.name.clone());
                    assignment.total_mb = total;
                    placed.insert(folder.name.as_str());
                } else {
                    debug!(
                        "SLOT {} | DIRECTORY {} | TOO BIG ({} + {} >= {})",
                        slot_id, folder.name, assignment.total_mb, folder.size_mb, self.capacity_mb
                    );
                    skipped.push(folder.name.as_str());
                }
            }

            debug!(
                "SLOT {} | PREFIX {:?} | THIS {:?} | SKIP {:?}",
                slot_id, assignment.prefix, assignment.folders, skipped
            );
            plan.slots.push(assignment);
        }

        let unallocated: UnallocatedSet = candidates
            .iter()
            .filter(|f| !placed.contains(f.name.as_str()))
            .map(|f| f.name.clone())
            .collect();

        if !unallocated.is_empty() {
            error!(
                "Not all folders fit on the available tape slots! Unprocessed folders: {:?}",
                unallocated
            );
        }
        info!(
            "Tape to folder mapping: {}",
            serde_json::to_string(&plan.slots).unwrap_or_else(|_| format!("{:?}", plan.slots))
        );

        (plan, unallocated)
    }
}

/// `name` is `<prefix>_<anything>`
fn in_group(name: &str, prefix: &str) -> bool {
    name.strip_prefix(prefix)
        .is_some_and(|rest| rest.starts_with('_'))
}
