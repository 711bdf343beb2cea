//! Static run configuration
//!
//! Everything a run does is decided by one TOML file. Every key has a default
//! so a minimal file only needs the volume group, logical volume, source path
//! and mail recipient.

use crate::error::{Result, TapeBackupError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// MB per configured TB; tape capacity is a decimal figure.
pub const MB_PER_TB: u64 = 1_000_000;

const CONFIG_DIR_NAME: &str = "tapebackup";
const CONFIG_FILE_NAME: &str = "config.toml";
const SYSTEM_CONFIG_PATH: &str = "/etc/tapebackup/config.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackupConfig {
    /// Slots this instance may use. Disjoint ranges let several instances
    /// share one library.
    pub process_slots: Vec<u32>,
    /// Uncompressed budget per tape, a little below the nominal capacity
    pub tape_capacity_tb: u64,
    /// Move cartridges and handle snapshots but skip the archive writer
    pub dry_run: bool,
    pub source: SourceConfig,
    pub snapshot: SnapshotConfig,
    pub changer: ChangerConfig,
    pub archive: ArchiveConfig,
    pub mail: MailConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceConfig {
    /// Live mount of the source volume; folders are measured here
    pub path: PathBuf,
    pub exclusions: Vec<String>,
    /// When non-empty only these folders are backed up
    pub inclusions: Vec<String>,
    /// Folders named `<prefix>_*` get tapes of their own
    pub special_tape_prefixes: Vec<String>,
    /// Directory below `path` collecting the per-tape content indexes
    pub content_index_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SnapshotConfig {
    pub volume_group: String,
    pub logical_volume: String,
    /// Must match the fstab entry used by the cryptmount script
    pub name: String,
    pub size: String,
    pub mount: PathBuf,
    pub cryptmount_script: PathBuf,
    pub crypt_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChangerConfig {
    /// Directory scanned for `sg<N>` changer control nodes
    pub device_dir: PathBuf,
    /// Tape drive node name below `device_dir`
    pub tape_device: String,
    pub block_size: String,
    pub mtx: String,
    pub mt: String,
    /// stderr fragments that do not indicate a failure
    pub benign_stderr: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArchiveConfig {
    pub program: String,
    pub blocking_factor: u32,
    pub index_tmp_file: PathBuf,
    pub dry_run_delay_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MailConfig {
    pub enabled: bool,
    pub sendmail: PathBuf,
    pub from: String,
    pub to: String,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            process_slots: (1..=8).collect(),
            tape_capacity_tb: 10,
            dry_run: false,
            source: SourceConfig::default(),
            snapshot: SnapshotConfig::default(),
            changer: ChangerConfig::default(),
            archive: ArchiveConfig::default(),
            mail: MailConfig::default(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/data"),
            exclusions: vec![
                "lost+found".to_string(),
                "restore".to_string(),
                "tape_content_index".to_string(),
            ],
            inclusions: Vec::new(),
            special_tape_prefixes: Vec::new(),
            content_index_dir: "tape_content_index".to_string(),
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            volume_group: String::new(),
            logical_volume: String::new(),
            name: "snap_tape".to_string(),
            size: "1000G".to_string(),
            mount: PathBuf::from("/snap_tape"),
            cryptmount_script: PathBuf::from("/usr/local/sbin/cryptmount/cryptmount.sh"),
            crypt_prefix: "crypt".to_string(),
        }
    }
}

impl Default for ChangerConfig {
    fn default() -> Self {
        Self {
            device_dir: PathBuf::from("/dev"),
            tape_device: "st0".to_string(),
            block_size: "64k".to_string(),
            mtx: "mtx".to_string(),
            mt: "mt".to_string(),
            benign_stderr: vec!["Removing leading".to_string()],
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            program: "tar".to_string(),
            blocking_factor: 2048,
            index_tmp_file: PathBuf::from("/tmp/tape_content_index.txt"),
            dry_run_delay_secs: 10,
        }
    }
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sendmail: PathBuf::from("/usr/sbin/sendmail"),
            from: "tapebackup@localhost".to_string(),
            to: String::new(),
        }
    }
}

impl BackupConfig {
    /// Load from an explicit path, or from the first default location present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path()?,
        };
        info!("Loading configuration from {}", path.display());

        let content = std::fs::read_to_string(&path).map_err(|e| {
            TapeBackupError::configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(content)
            .map_err(|e| TapeBackupError::configuration(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        debug!("Effective configuration: {:?}", config);
        Ok(config)
    }

    /// Check invariants and normalise. The content index directory is
    /// always excluded from backup candidates.
    pub fn validate(&mut self) -> Result<()> {
        if self.tape_capacity_tb == 0 {
            return Err(TapeBackupError::configuration("tape_capacity_tb must be > 0"));
        }
        if self.tape_capacity_tb.checked_mul(MB_PER_TB).is_none() {
            return Err(TapeBackupError::configuration(format!(
                "tape_capacity_tb {} is out of range",
                self.tape_capacity_tb
            )));
        }

        let mut seen = HashSet::new();
        for slot in &self.process_slots {
            if !seen.insert(*slot) {
                return Err(TapeBackupError::configuration(format!(
                    "slot {} listed twice in process_slots",
                    slot
                )));
            }
        }

        for (key, value) in [
            ("snapshot.volume_group", &self.snapshot.volume_group),
            ("snapshot.logical_volume", &self.snapshot.logical_volume),
            ("snapshot.name", &self.snapshot.name),
            ("source.content_index_dir", &self.source.content_index_dir),
            ("changer.tape_device", &self.changer.tape_device),
        ] {
            if value.trim().is_empty() {
                return Err(TapeBackupError::configuration(format!("{} must be set", key)));
            }
        }

        for (key, path) in [
            ("source.path", &self.source.path),
            ("snapshot.mount", &self.snapshot.mount),
        ] {
            if !path.is_absolute() {
                return Err(TapeBackupError::configuration(format!(
                    "{} must be an absolute path, got {}",
                    key,
                    path.display()
                )));
            }
        }

        if !self.source.exclusions.contains(&self.source.content_index_dir) {
            warn!(
                "Content index directory '{}' was not excluded, excluding it",
                self.source.content_index_dir
            );
            self.source
                .exclusions
                .push(self.source.content_index_dir.clone());
        }

        if self.mail.enabled && self.mail.to.trim().is_empty() {
            return Err(TapeBackupError::configuration(
                "mail.to must be set when mail is enabled",
            ));
        }

        Ok(())
    }

    pub fn capacity_mb(&self) -> u64 {
        self.tape_capacity_tb.saturating_mul(MB_PER_TB)
    }

    pub fn tape_device_path(&self) -> PathBuf {
        self.changer.device_dir.join(&self.changer.tape_device)
    }

    pub fn dry_run_delay(&self) -> Duration {
        Duration::from_secs(self.archive.dry_run_delay_secs)
    }

    /// Prefix for the mail subject
    pub fn mode_label(&self) -> &'static str {
        if self.dry_run {
            "TRY-MODE - "
        } else {
            ""
        }
    }
}

/// `~/.config/tapebackup/config.toml` first, then the system-wide file
fn default_config_path() -> Result<PathBuf> {
    if let Some(user) = dirs::config_dir().map(|d| d.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME)) {
        if user.exists() {
            return Ok(user);
        }
    }

    let system = PathBuf::from(SYSTEM_CONFIG_PATH);
    if system.exists() {
        return Ok(system);
    }

    Err(TapeBackupError::configuration(format!(
        "no configuration file found (pass --config or create {})",
        SYSTEM_CONFIG_PATH
    )))
}
