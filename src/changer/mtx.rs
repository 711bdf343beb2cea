//! `mtx` / `mt` backed changer
//!
//! Status text looks like:
//!
//! ```text
//!   Storage Changer /dev/sg3:1 Drives, 8 Slots ( 0 Import/Export )
//! Data Transfer Element 0:Full (Storage Element 2 Loaded):VolumeTag = 000002L8
//!       Storage Element 1:Full :VolumeTag=000001L8
//!       Storage Element 2:Empty
//! ```

use super::{ChangerDevice, MediaChanger, SlotStatus, TransferStatus};
use crate::config::ChangerConfig;
use crate::error::{Result, TapeBackupError};
use crate::shell::CommandRunner;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info};

const STORAGE_ELEMENT: &str = "Storage Element ";
const TRANSFER_ELEMENT: &str = "Data Transfer Element ";
const VOLUME_TAG: &str = "VolumeTag";

/// Parsed `mtx status` output
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangerStatus {
    /// First drive of the library; `None` if the output had no drive line
    pub transfer: Option<TransferStatus>,
    pub slots: BTreeMap<u32, SlotStatus>,
}

/// Parse cleaned `mtx status` lines
pub fn parse_status(lines: &[String]) -> ChangerStatus {
    let mut status = ChangerStatus::default();

    for line in lines {
        let line = line.trim();

        if let Some(rest) = line.strip_prefix(TRANSFER_ELEMENT) {
            if status.transfer.is_some() {
                continue;
            }
            if let Some((_, tail)) = rest.split_once(':') {
                status.transfer = Some(TransferStatus {
                    empty: element_state(tail) != "Full",
                    label: volume_tag(tail),
                });
            }
        } else if let Some(rest) = line.strip_prefix(STORAGE_ELEMENT) {
            let Some((head, tail)) = rest.split_once(':') else {
                continue;
            };
            let Some(id) = head
                .split_whitespace()
                .next()
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            status.slots.insert(
                id,
                SlotStatus {
                    id,
                    occupied: element_state(tail) == "Full",
                    label: volume_tag(tail),
                },
            );
        }
    }

    status
}

/// First word of the element description: `Full`, `Empty`
fn element_state(tail: &str) -> &str {
    tail.split(|c: char| c.is_whitespace() || c == ':')
        .find(|s| !s.is_empty())
        .unwrap_or("")
}

/// `VolumeTag = ABC123L8` or `VolumeTag=ABC123L8`; anything unreadable is empty
fn volume_tag(tail: &str) -> String {
    let Some(pos) = tail.find(VOLUME_TAG) else {
        return String::new();
    };
    let value = tail[pos + VOLUME_TAG.len()..]
        .trim_start()
        .trim_start_matches('=')
        .split_whitespace()
        .next()
        .unwrap_or("");

    if value.chars().all(|c| c.is_ascii_graphic()) {
        value.to_string()
    } else {
        String::new()
    }
}

/// `sg<N>` control node names
fn is_sg_node(name: &str) -> bool {
    name.strip_prefix("sg")
        .map(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false)
}

pub struct MtxChanger {
    runner: CommandRunner,
    config: ChangerConfig,
}

impl MtxChanger {
    pub fn new(runner: CommandRunner, config: ChangerConfig) -> Self {
        Self { runner, config }
    }

    fn tape_device(&self) -> String {
        self.config
            .device_dir
            .join(&self.config.tape_device)
            .to_string_lossy()
            .to_string()
    }

    async fn mtx(&self, device: &ChangerDevice, args: &[&str]) -> Result<Vec<String>> {
        let dev = device.path().to_string_lossy().to_string();
        let mut full = vec!["-f", dev.as_str()];
        full.extend_from_slice(args);
        Ok(self.runner.run_checked(&self.config.mtx, &full).await?.lines)
    }

    async fn mt(&self, args: &[&str]) -> Result<()> {
        let dev = self.tape_device();
        let mut full = vec!["-f", dev.as_str()];
        full.extend_from_slice(args);
        self.runner.run_checked(&self.config.mt, &full).await?;
        Ok(())
    }

    async fn status(&self, device: &ChangerDevice) -> Result<ChangerStatus> {
        let lines = self.mtx(device, &["status"]).await?;
        Ok(parse_status(&lines))
    }

    /// Candidate control nodes, numerically ordered
    async fn sg_nodes(&self) -> Result<Vec<PathBuf>> {
        let mut nodes = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.config.device_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if is_sg_node(&name) {
                let index: u32 = name[2..].parse().unwrap_or(u32::MAX);
                nodes.push((index, entry.path()));
            }
        }
        nodes.sort();
        Ok(nodes.into_iter().map(|(_, path)| path).collect())
    }
}

#[async_trait]
impl MediaChanger for MtxChanger {
    async fn discover_device(&self) -> Result<ChangerDevice> {
        for node in self.sg_nodes().await? {
            let dev = node.to_string_lossy().to_string();
            let output = self
                .runner
                .run(&self.config.mtx, &["-f", dev.as_str(), "status"])
                .await?;
            debug!("Status of sg device '{}': {:?}", dev, output.lines);

            if output.success() && !output.lines.is_empty() {
                let device = ChangerDevice::new(node);
                self.mtx(&device, &["inventory"]).await?;
                info!("Using changer device {}", device);
                return Ok(device);
            }
        }

        Err(TapeBackupError::configuration(format!(
            "no changer answered below {}",
            self.config.device_dir.display()
        )))
    }

    async fn scan_slots(
        &self,
        device: &ChangerDevice,
        candidate_ids: &[u32],
    ) -> Result<Vec<SlotStatus>> {
        let status = self.status(device).await?;

        let slots = candidate_ids
            .iter()
            .map(|id| match status.slots.get(id) {
                Some(slot) => slot.clone(),
                None => SlotStatus {
                    id: *id,
                    occupied: false,
                    label: String::new(),
                },
            })
            .collect::<Vec<_>>();

        for slot in slots.iter().filter(|s| !s.occupied) {
            debug!("Tape slot '{}' is empty", slot.id);
        }
        Ok(slots)
    }

    async fn transfer_status(&self, device: &ChangerDevice) -> Result<TransferStatus> {
        let status = self.status(device).await?;
        status.transfer.ok_or_else(|| {
            TapeBackupError::parse(format!(
                "no Data Transfer Element in status output of {}",
                device
            ))
        })
    }

    async fn unload_transfer(&self, device: &ChangerDevice) -> Result<()> {
        let transfer = self.transfer_status(device).await?;
        debug!("Transfer status: {:?}", transfer);

        if transfer.empty {
            info!("Transfer is empty and ready for use");
            return Ok(());
        }

        info!("Unloading loaded tape with label '{}'", transfer.label);
        self.mt(&["rewind"]).await?;
        self.mtx(device, &["unload"]).await?;
        self.mtx(device, &["inventory"]).await?;
        Ok(())
    }

    async fn load_tape(&self, device: &ChangerDevice, slot_id: u32) -> Result<()> {
        info!("Loading tape from slot '{}'", slot_id);
        let slot = slot_id.to_string();
        self.mtx(device, &["load", slot.as_str()]).await?;
        self.mt(&["rewind"]).await?;
        self.mt(&["setblk", self.config.block_size.as_str()]).await?;
        Ok(())
    }
}
