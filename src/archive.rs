//! Archive writing and the per-tape content index

use crate::config::BackupConfig;
use crate::error::{Result, TapeBackupError};
use crate::shell::CommandRunner;
use crate::utils::format_file_time;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Result of one archive-writer invocation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArchiveOutcome {
    pub exit_code: i32,
    pub stderr: String,
}

#[async_trait]
pub trait ArchiveWriter: Send + Sync {
    /// Write `sources` to the loaded tape in order. A non-zero exit code is
    /// an outcome, not an error; errors mean the writer could not run.
    async fn write(&self, sources: &[PathBuf]) -> Result<ArchiveOutcome>;
}

/// `tar -chf <tape> <sources...> --blocking-factor <n>`
pub struct TarWriter {
    runner: CommandRunner,
    program: String,
    tape_device: PathBuf,
    blocking_factor: u32,
}

impl TarWriter {
    pub fn new(runner: CommandRunner, config: &BackupConfig) -> Self {
        Self {
            runner,
            program: config.archive.program.clone(),
            tape_device: config.tape_device_path(),
            blocking_factor: config.archive.blocking_factor,
        }
    }

    fn args(&self, sources: &[PathBuf]) -> Vec<String> {
        let mut args = vec![
            "-chf".to_string(),
            self.tape_device.to_string_lossy().to_string(),
        ];
        args.extend(sources.iter().map(|s| s.to_string_lossy().to_string()));
        args.push("--blocking-factor".to_string());
        args.push(self.blocking_factor.to_string());
        args
    }
}

#[async_trait]
impl ArchiveWriter for TarWriter {
    async fn write(&self, sources: &[PathBuf]) -> Result<ArchiveOutcome> {
        info!(
            "Writing {} sources to {}",
            sources.len(),
            self.tape_device.display()
        );
        let args = self.args(sources);
        let output = self.runner.run(&self.program, args.as_slice()).await?;
        Ok(ArchiveOutcome {
            exit_code: output.exit_code,
            stderr: output.stderr,
        })
    }
}

/// A content index ready to be archived
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedContent {
    /// Copy handed to the archive writer
    pub path: PathBuf,
    pub files: usize,
    /// Entries that could not be listed, already logged
    pub skipped: Vec<String>,
}

/// Builds the restore index written as first member of every tape
#[derive(Debug, Clone)]
pub struct ContentIndex {
    /// `<source>/<content_index_dir>`, where the indexes are kept
    index_dir: PathBuf,
    /// Copy handed to the archive writer
    tmp_file: PathBuf,
    snapshot_mount: PathBuf,
}

impl ContentIndex {
    pub fn new<A, B, C>(index_dir: A, tmp_file: B, snapshot_mount: C) -> Self
    where
        A: Into<PathBuf>,
        B: Into<PathBuf>,
        C: Into<PathBuf>,
    {
        Self {
            index_dir: index_dir.into(),
            tmp_file: tmp_file.into(),
            snapshot_mount: snapshot_mount.into(),
        }
    }

    pub fn from_config(config: &BackupConfig) -> Self {
        Self::new(
            config.source.path.join(&config.source.content_index_dir),
            config.archive.index_tmp_file.clone(),
            config.snapshot.mount.clone(),
        )
    }

    pub fn folder_path(&self, folder: &str) -> PathBuf {
        self.snapshot_mount.join(folder)
    }

    /// Archive source list: the index first, then the folders
    pub fn sources(&self, index: PathBuf, folders: &[String]) -> Vec<PathBuf> {
        std::iter::once(index)
            .chain(folders.iter().map(|f| self.folder_path(f)))
            .collect()
    }

    /// List every file of `folders` into a new index file and copy it to the
    /// archive location. Unreadable entries are skipped, not fatal.
    pub async fn build(
        &self,
        slot_id: u32,
        folders: &[String],
        now: DateTime<Local>,
    ) -> Result<IndexedContent> {
        let index_file = self.index_dir.join(format!(
            "tape_content_index_{}_slot{}.txt",
            format_file_time(&now),
            slot_id
        ));
        let roots: Vec<PathBuf> = folders.iter().map(|f| self.folder_path(f)).collect();
        let tmp_file = self.tmp_file.clone();
        let index_dir = self.index_dir.clone();

        let (files, skipped) = tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&index_dir)?;
            let listed = write_index(&index_file, &roots)?;
            std::fs::copy(&index_file, &tmp_file)?;
            debug!("Content index {} copied to {}", index_file.display(), tmp_file.display());
            Ok::<_, TapeBackupError>(listed)
        })
        .await
        .map_err(|e| anyhow::anyhow!("content index task failed: {}", e))??;

        info!(
            "Content index for slot {} lists {} files ({} entries skipped)",
            slot_id,
            files,
            skipped.len()
        );
        Ok(IndexedContent {
            path: self.tmp_file.clone(),
            files,
            skipped,
        })
    }
}

/// One line per regular file, relative to `/`, flushed to disk. Returns the
/// number of files listed and the entries that could not be read.
fn write_index(index_file: &Path, roots: &[PathBuf]) -> Result<(usize, Vec<String>)> {
    let file = File::create(index_file).map_err(|e| {
        TapeBackupError::archive(format!(
            "cannot create content index {}: {}",
            index_file.display(),
            e
        ))
    })?;
    let mut writer = BufWriter::new(file);
    let mut count = 0;
    let mut skipped = Vec::new();

    for root in roots {
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Content index: cannot list {}: {}", root.display(), e);
                    skipped.push(e.to_string());
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path().to_string_lossy();
            writeln!(writer, "{}", path.trim_start_matches('/'))?;
            count += 1;
        }
    }

    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok((count, skipped))
}
