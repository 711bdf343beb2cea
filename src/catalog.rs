//! Folder measurement and candidate filtering

use crate::config::SourceConfig;
use crate::error::{Result, TapeBackupError};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// A top-level entry of the source volume and its size
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Folder {
    pub name: String,
    pub size_mb: u64,
}

impl Folder {
    pub fn new<T: Into<String>>(name: T, size_mb: u64) -> Self {
        Self {
            name: name.into(),
            size_mb,
        }
    }
}

/// Measured folders in catalog order. Names are unique.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Catalog {
    folders: Vec<Folder>,
}

impl Catalog {
    /// Later duplicates of a name are dropped
    pub fn new(folders: Vec<Folder>) -> Self {
        let mut seen = HashSet::new();
        let folders = folders
            .into_iter()
            .filter(|f| seen.insert(f.name.clone()))
            .collect();
        Self { folders }
    }

    pub fn folders(&self) -> &[Folder] {
        &self.folders
    }

    pub fn get(&self, name: &str) -> Option<&Folder> {
        self.folders.iter().find(|f| f.name == name)
    }

    pub fn size_of(&self, name: &str) -> u64 {
        self.get(name).map(|f| f.size_mb).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.folders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.folders.is_empty()
    }

    /// Keep only the folders accepted by `filter`
    pub fn filtered(&self, filter: &FolderFilter) -> Catalog {
        Catalog {
            folders: self
                .folders
                .iter()
                .filter(|f| filter.is_candidate(&f.name))
                .cloned()
                .collect(),
        }
    }
}

impl FromIterator<Folder> for Catalog {
    fn from_iter<I: IntoIterator<Item = Folder>>(iter: I) -> Self {
        Catalog::new(iter.into_iter().collect())
    }
}

/// Exclusion / inclusion sets. Exclusions always win; a non-empty inclusion
/// set restricts candidates to its members.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderFilter {
    exclusions: HashSet<String>,
    inclusions: HashSet<String>,
}

impl FolderFilter {
    pub fn new<E, I>(exclusions: E, inclusions: I) -> Self
    where
        E: IntoIterator,
        E::Item: Into<String>,
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            exclusions: exclusions.into_iter().map(Into::into).collect(),
            inclusions: inclusions.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_config(config: &SourceConfig) -> Self {
        Self::new(config.exclusions.iter().cloned(), config.inclusions.iter().cloned())
    }

    pub fn is_excluded(&self, name: &str) -> bool {
        self.exclusions.contains(name)
    }

    pub fn is_candidate(&self, name: &str) -> bool {
        !self.is_excluded(name) && (self.inclusions.is_empty() || self.inclusions.contains(name))
    }
}

#[async_trait]
pub trait FolderCatalog: Send + Sync {
    /// Measure the candidate folders
    async fn measure(&self) -> Result<Catalog>;
}

/// Disk-usage scan of the top-level entries of a directory. Symlinks are
/// followed; sizes are rounded up to whole MiB. Hidden entries are skipped.
pub struct DiskUsageCatalog {
    root: PathBuf,
    filter: FolderFilter,
}

impl DiskUsageCatalog {
    pub fn new<P: Into<PathBuf>>(root: P, filter: FolderFilter) -> Self {
        Self {
            root: root.into(),
            filter,
        }
    }

    pub fn from_config(config: &SourceConfig) -> Self {
        Self::new(config.path.clone(), FolderFilter::from_config(config))
    }
}

#[async_trait]
impl FolderCatalog for DiskUsageCatalog {
    async fn measure(&self) -> Result<Catalog> {
        let root = self.root.clone();
        let folders = tokio::task::spawn_blocking(move || scan_top_level(&root))
            .await
            .map_err(|e| anyhow::anyhow!("folder scan task failed: {}", e))??;

        let catalog = Catalog::new(folders).filtered(&self.filter);
        info!(
            "Measured {} candidate folders below {}",
            catalog.len(),
            self.root.display()
        );
        debug!("Directories: {:?}", catalog.folders());
        Ok(catalog)
    }
}

fn scan_top_level(root: &Path) -> Result<Vec<Folder>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(root).map_err(|e| {
        TapeBackupError::configuration(format!("cannot read source {}: {}", root.display(), e))
    })? {
        let name = entry?.file_name().to_string_lossy().to_string();
        if !name.starts_with('.') {
            names.push(name);
        }
    }
    names.sort();

    Ok(names
        .into_iter()
        .map(|name| {
            let size_mb = disk_usage_mb(&root.join(&name));
            Folder::new(name, size_mb)
        })
        .collect())
}

/// Apparent size of everything below `path`, in MiB rounded up
pub fn disk_usage_mb(path: &Path) -> u64 {
    let mut bytes = 0u64;
    for entry in WalkDir::new(path).follow_links(true) {
        match entry {
            Ok(entry) => {
                if entry.file_type().is_file() {
                    bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
                }
            }
            Err(e) => warn!("Skipping unreadable entry while measuring: {}", e),
        }
    }
    bytes.div_ceil(BYTES_PER_MB)
}
