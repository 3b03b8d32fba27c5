//! Location of extracted registry archives
//!
//! Downloading and unzipping the published archives happens outside this
//! crate. An [`ArchiveSource`] hands the pipeline the directory an archive was
//! extracted to, and [`discover_files`] picks the dump files out of it.

use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

use super::catalog::VersionInfo;
use super::source::ImportError;

/// File name prefix of address object dumps
pub const ADDRESS_FILE_PREFIX: &str = "AS_ADDROBJ_";
/// File name prefix of house dumps
pub const HOUSE_FILE_PREFIX: &str = "AS_HOUSE_";

/// Complete snapshot or changeset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Full,
    Delta,
}

impl ArchiveKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveKind::Full => "full",
            ArchiveKind::Delta => "delta",
        }
    }
}

impl fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dump files found in one extracted archive
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveFiles {
    pub root: PathBuf,
    pub addresses: Vec<PathBuf>,
    pub houses: Vec<PathBuf>,
}

impl ArchiveFiles {
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty() && self.houses.is_empty()
    }
}

/// Provider of extracted archives for a catalog version
#[async_trait]
pub trait ArchiveSource: Send + Sync {
    async fn fetch(&self, version: &VersionInfo, kind: ArchiveKind) -> Result<ArchiveFiles, ImportError>;
}

/// Archives already extracted to `<root>/<version id>/<full|delta>`
#[derive(Debug, Clone)]
pub struct ExtractedDirArchive {
    root: PathBuf,
}

impl ExtractedDirArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn dir_for(&self, version_id: u32, kind: ArchiveKind) -> PathBuf {
        self.root.join(version_id.to_string()).join(kind.as_str())
    }
}

#[async_trait]
impl ArchiveSource for ExtractedDirArchive {
    async fn fetch(&self, version: &VersionInfo, kind: ArchiveKind) -> Result<ArchiveFiles, ImportError> {
        let dir = self.dir_for(version.version_id, kind);
        if !dir.is_dir() {
            return Err(ImportError::Archive(format!(
                "{} archive of version {} not found at {}",
                kind,
                version.version_id,
                dir.display()
            )));
        }
        let files = tokio::task::spawn_blocking(move || discover_files(&dir)).await?;
        info!(
            "Version {} {} archive: {} address files, {} house files",
            version.version_id,
            kind,
            files.addresses.len(),
            files.houses.len()
        );
        Ok(files)
    }
}

fn has_prefix(name: &str, prefix: &str) -> bool {
    name.len() >= prefix.len()
        && name.is_char_boundary(prefix.len())
        && name[..prefix.len()].eq_ignore_ascii_case(prefix)
}

/// Collect dump files under `root` by name prefix, sorted by path
pub fn discover_files(root: &Path) -> ArchiveFiles {
    let mut files = ArchiveFiles {
        root: root.to_path_buf(),
        ..Default::default()
    };

    for entry in WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if !name.to_ascii_lowercase().ends_with(".xml") {
            continue;
        }
        if has_prefix(name, ADDRESS_FILE_PREFIX) {
            files.addresses.push(entry.path().to_path_buf());
        } else if has_prefix(name, HOUSE_FILE_PREFIX) {
            files.houses.push(entry.path().to_path_buf());
        } else {
            debug!("Ignoring {}", entry.path().display());
        }
    }

    files.addresses.sort();
    files.houses.sort();
    files
}
