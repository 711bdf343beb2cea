//! Snapshot lifecycle of the encrypted source volume
//!
//! create: `lvcreate` the snapshot, then open and mount it with the
//! cryptmount script. remove: `umount`, `cryptsetup luksClose`, `lvremove`.

use crate::config::SnapshotConfig;
use crate::error::Result;
use crate::shell::CommandRunner;
use async_trait::async_trait;
use tracing::{info, warn};

#[async_trait]
pub trait SnapshotManager: Send + Sync {
    /// Create and mount the snapshot
    async fn create(&self) -> Result<()>;

    /// Unmount, close and remove. Every step is attempted even if an
    /// earlier one fails; the first failure is returned.
    async fn remove(&self) -> Result<()>;
}

/// Program and arguments of one lifecycle step
type Step = (&'static str, Vec<String>);

pub struct LvmSnapshot {
    runner: CommandRunner,
    config: SnapshotConfig,
}

impl LvmSnapshot {
    pub fn new(runner: CommandRunner, config: SnapshotConfig) -> Self {
        Self { runner, config }
    }

    fn mapper_name(&self) -> String {
        format!("{}-{}", self.config.crypt_prefix, self.config.name)
    }

    fn create_steps(&self) -> Vec<Step> {
        let c = &self.config;
        vec![
            (
                "lvcreate",
                vec![
                    format!("-L{}", c.size),
                    "-s".to_string(),
                    "-n".to_string(),
                    c.name.clone(),
                    format!("/dev/{}/{}", c.volume_group, c.logical_volume),
                ],
            ),
            (
                "bash",
                vec![
                    c.cryptmount_script.to_string_lossy().to_string(),
                    format!("{}-{}", c.volume_group, c.name),
                    self.mapper_name(),
                    c.mount.to_string_lossy().to_string(),
                    String::new(),
                ],
            ),
        ]
    }

    fn remove_steps(&self) -> Vec<Step> {
        let c = &self.config;
        vec![
            ("umount", vec![c.mount.to_string_lossy().to_string()]),
            (
                "cryptsetup",
                vec![
                    "luksClose".to_string(),
                    format!("/dev/mapper/{}", self.mapper_name()),
                ],
            ),
            (
                "lvremove",
                vec![format!("/dev/{}/{}", c.volume_group, c.name), "-y".to_string()],
            ),
        ]
    }
}

#[async_trait]
impl SnapshotManager for LvmSnapshot {
    async fn create(&self) -> Result<()> {
        info!("Creating backup snapshot");
        for (program, args) in self.create_steps() {
            self.runner.run_checked(program, args.as_slice()).await?;
        }
        Ok(())
    }

    async fn remove(&self) -> Result<()> {
        info!("Removing backup snapshot");
        let mut first_error = None;

        for (program, args) in self.remove_steps() {
            if let Err(e) = self.runner.run_checked(program, args.as_slice()).await {
                warn!("Snapshot removal step '{}' failed: {}", program, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
