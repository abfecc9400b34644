//! Per-session virtual file system.
//!
//! The tree lives in memory between executions and is materialized into the
//! session workspace before each run, then mirrored back afterwards. All
//! quota checks happen before any state changes.

use crate::config::VfsLimits;
use crate::hostfs;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Top-level host directory owned by the runner; never part of the tree.
pub const RESERVED_DIR: &str = ".sandbox";

pub type VfsResult<T> = std::result::Result<T, VfsError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VfsError {
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("file of {size} bytes exceeds the per-file limit of {limit} bytes")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("write would use {required} bytes, above the {limit} byte quota")]
    QuotaExceeded { required: u64, limit: u64 },

    #[error("file count limit of {limit} reached")]
    FileCountExceeded { limit: usize },

    #[error("host sync failed: {0}")]
    Io(String),
}

impl VfsError {
    pub fn is_quota(&self) -> bool {
        matches!(
            self,
            VfsError::FileTooLarge { .. }
                | VfsError::QuotaExceeded { .. }
                | VfsError::FileCountExceeded { .. }
        )
    }
}

impl From<std::io::Error> for VfsError {
    fn from(err: std::io::Error) -> Self {
        VfsError::Io(err.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualFile {
    pub path: String,
    #[serde(skip)]
    pub content: Vec<u8>,
    pub size: u64,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    /// SHA-256, hex encoded
    pub checksum: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualDirectory {
    pub path: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

/// A listing or stat entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VfsEntry {
    pub name: String,
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub modified: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VfsUsage {
    pub total_size: u64,
    pub file_count: usize,
    pub directory_count: usize,
    pub limits: VfsLimits,
}

/// Outcome of mirroring the host workspace back into the tree
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    /// Files left out because they would break a quota or are not regular files
    pub skipped: Vec<String>,
}

/// Normalize an absolute path, resolving `.` and `..` without escaping the root.
pub fn normalize_path(path: &str) -> VfsResult<String> {
    if !path.starts_with('/') {
        return Err(VfsError::InvalidPath(format!("path must be absolute: {path}")));
    }
    if path.contains('\0') {
        return Err(VfsError::InvalidPath("path contains NUL".to_string()));
    }

    let mut components: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => continue,
            ".." => {
                if components.pop().is_none() {
                    return Err(VfsError::InvalidPath("path escapes root".to_string()));
                }
            }
            c => components.push(c),
        }
    }

    if components.is_empty() {
        Ok("/".to_string())
    } else {
        Ok(format!("/{}", components.join("/")))
    }
}

fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn is_reserved(path: &str) -> bool {
    let first = path.trim_start_matches('/').split('/').next().unwrap_or("");
    first == RESERVED_DIR
}

fn checksum(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

fn host_relative(vfs_path: &str) -> &Path {
    Path::new(vfs_path.trim_start_matches('/'))
}

/// Quota-enforced in-memory file tree
#[derive(Debug, Clone)]
pub struct VirtualFileSystem {
    limits: VfsLimits,
    files: BTreeMap<String, VirtualFile>,
    directories: BTreeMap<String, VirtualDirectory>,
    total_size: u64,
}

impl VirtualFileSystem {
    pub fn new(limits: VfsLimits) -> Self {
        let now = Utc::now();
        let mut directories = BTreeMap::new();
        directories.insert(
            "/".to_string(),
            VirtualDirectory {
                path: "/".to_string(),
                created: now,
                modified: now,
            },
        );
        Self {
            limits,
            files: BTreeMap::new(),
            directories,
            total_size: 0,
        }
    }

    pub fn limits(&self) -> VfsLimits {
        self.limits
    }

    /// Create or replace a file, creating missing parent directories.
    pub fn write_file(&mut self, path: &str, content: Vec<u8>) -> VfsResult<&VirtualFile> {
        let path = normalize_path(path)?;
        if path == "/" {
            return Err(VfsError::IsADirectory(path));
        }
        if is_reserved(&path) {
            return Err(VfsError::InvalidPath(format!("{path} is reserved")));
        }
        if self.directories.contains_key(&path) {
            return Err(VfsError::IsADirectory(path));
        }
        self.check_ancestors_are_directories(&path)?;

        let size = content.len() as u64;
        if size > self.limits.max_file_size {
            return Err(VfsError::FileTooLarge {
                size,
                limit: self.limits.max_file_size,
            });
        }
        let previous = self.files.get(&path).map(|f| f.size);
        let required = self.total_size - previous.unwrap_or(0) + size;
        if required > self.limits.max_total_size {
            return Err(VfsError::QuotaExceeded {
                required,
                limit: self.limits.max_total_size,
            });
        }
        if previous.is_none() && self.files.len() >= self.limits.max_files {
            return Err(VfsError::FileCountExceeded {
                limit: self.limits.max_files,
            });
        }

        if let Some(parent) = parent_path(&path) {
            let parent = parent.to_string();
            self.create_dir_chain(&parent);
        }

        let now = Utc::now();
        let created = self
            .files
            .get(&path)
            .map(|f| f.created)
            .unwrap_or(now);
        let file = VirtualFile {
            path: path.clone(),
            size,
            created,
            modified: now,
            checksum: checksum(&content),
            mime_type: mime_guess::from_path(&path)
                .first_or_octet_stream()
                .essence_str()
                .to_string(),
            content,
        };
        self.total_size = required;
        debug!("[VFS] Wrote {} ({} bytes)", path, size);
        self.files.insert(path.clone(), file);
        self.files
            .get(&path)
            .ok_or_else(|| VfsError::NotFound(path.clone()))
    }

    pub fn read_file(&self, path: &str) -> VfsResult<&VirtualFile> {
        let path = normalize_path(path)?;
        if self.directories.contains_key(&path) {
            return Err(VfsError::IsADirectory(path));
        }
        self.files.get(&path).ok_or(VfsError::NotFound(path))
    }

    /// Create a directory and any missing ancestors. Existing directories are fine.
    pub fn mkdir(&mut self, path: &str) -> VfsResult<()> {
        let path = normalize_path(path)?;
        if is_reserved(&path) {
            return Err(VfsError::InvalidPath(format!("{path} is reserved")));
        }
        if self.files.contains_key(&path) {
            return Err(VfsError::NotADirectory(path));
        }
        self.check_ancestors_are_directories(&path)?;
        self.create_dir_chain(&path);
        Ok(())
    }

    /// Immediate children of a directory, directories first.
    pub fn list_directory(&self, path: &str) -> VfsResult<Vec<VfsEntry>> {
        let path = normalize_path(path)?;
        if self.files.contains_key(&path) {
            return Err(VfsError::NotADirectory(path));
        }
        if !self.directories.contains_key(&path) {
            return Err(VfsError::NotFound(path));
        }

        let mut entries: Vec<VfsEntry> = self
            .directories
            .values()
            .filter(|d| parent_path(&d.path) == Some(path.as_str()))
            .map(|d| self.dir_entry(d))
            .collect();
        let mut files: Vec<VfsEntry> = self
            .files
            .values()
            .filter(|f| parent_path(&f.path) == Some(path.as_str()))
            .map(Self::file_entry)
            .collect();
        entries.append(&mut files);
        Ok(entries)
    }

    pub fn stat(&self, path: &str) -> VfsResult<VfsEntry> {
        let path = normalize_path(path)?;
        if let Some(file) = self.files.get(&path) {
            return Ok(Self::file_entry(file));
        }
        self.directories
            .get(&path)
            .map(|d| self.dir_entry(d))
            .ok_or(VfsError::NotFound(path))
    }

    /// Remove a file, or a directory with everything below it.
    pub fn remove(&mut self, path: &str) -> VfsResult<()> {
        let path = normalize_path(path)?;
        if path == "/" {
            return Err(VfsError::InvalidPath("cannot remove the root".to_string()));
        }
        if let Some(file) = self.files.remove(&path) {
            self.total_size -= file.size;
            self.touch_parent(&path);
            return Ok(());
        }
        if !self.directories.contains_key(&path) {
            return Err(VfsError::NotFound(path));
        }

        let prefix = format!("{path}/");
        let doomed: Vec<String> = self
            .files
            .keys()
            .filter(|p| p.starts_with(&prefix))
            .cloned()
            .collect();
        for p in doomed {
            if let Some(file) = self.files.remove(&p) {
                self.total_size -= file.size;
            }
        }
        self.directories
            .retain(|p, _| p != &path && !p.starts_with(&prefix));
        self.touch_parent(&path);
        Ok(())
    }

    pub fn exists(&self, path: &str) -> bool {
        normalize_path(path)
            .map(|p| self.files.contains_key(&p) || self.directories.contains_key(&p))
            .unwrap_or(false)
    }

    pub fn usage(&self) -> VfsUsage {
        VfsUsage {
            total_size: self.total_size,
            file_count: self.files.len(),
            directory_count: self.directories.len(),
            limits: self.limits,
        }
    }

    /// Materialize the tree under `root`. Host files absent from the tree are
    /// pruned; the reserved runner directory is left alone. Symlinks planted
    /// in the workspace are replaced, never written through.
    pub fn sync_to_host(&self, root: &Path) -> VfsResult<()> {
        std::fs::create_dir_all(root)?;

        for dir in self.directories.keys() {
            hostfs::ensure_dir(root, host_relative(dir))?;
        }

        for file in self.files.values() {
            let relative = host_relative(&file.path);
            let unchanged = hostfs::read_capped(root, relative, file.size)
                .ok()
                .flatten()
                .is_some_and(|existing| checksum(&existing) == file.checksum);
            if !unchanged {
                hostfs::write(root, relative, &file.content)?;
            }
        }

        let mut stale_files = Vec::new();
        let mut stale_dirs = Vec::new();
        for entry in WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !(e.depth() == 1 && e.file_name() == RESERVED_DIR))
        {
            let entry = entry.map_err(|e| VfsError::Io(e.to_string()))?;
            let Some(vfs_path) = vfs_path_for(root, entry.path()) else {
                continue;
            };
            if entry.file_type().is_dir() {
                if !self.directories.contains_key(&vfs_path) {
                    stale_dirs.push(vfs_path);
                }
            } else if !self.files.contains_key(&vfs_path) {
                stale_files.push(vfs_path);
            }
        }
        for path in stale_files {
            hostfs::remove_file(root, host_relative(&path))?;
        }
        // Deepest first
        stale_dirs.sort_by_key(|p| std::cmp::Reverse(p.matches('/').count()));
        for path in stale_dirs {
            hostfs::remove_all(root, host_relative(&path))?;
        }
        Ok(())
    }

    /// Mirror the host workspace back into the tree.
    ///
    /// Files that are too large, unreadable or not regular files are reported
    /// as skipped; a skipped path keeps its previous content in the tree.
    pub fn sync_from_host(&mut self, root: &Path) -> VfsResult<SyncReport> {
        let mut report = SyncReport::default();
        let mut seen_files = HashSet::new();
        let mut seen_dirs = vec!["/".to_string()];
        let mut host_files = Vec::new();

        for entry in WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !(e.depth() == 1 && e.file_name() == RESERVED_DIR))
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("[VFS] Unreadable workspace entry during sync: {}", e);
                    if let Some(path) = e.path().and_then(|p| vfs_path_for(root, p)) {
                        seen_files.insert(path.clone());
                        report.skipped.push(path);
                    }
                    continue;
                }
            };
            let Some(vfs_path) = vfs_path_for(root, entry.path()) else {
                report.skipped.push(entry.path().display().to_string());
                continue;
            };
            let file_type = entry.file_type();
            if file_type.is_dir() {
                seen_dirs.push(vfs_path);
            } else if file_type.is_file() {
                seen_files.insert(vfs_path.clone());
                let size = entry.metadata().map(|m| m.len()).unwrap_or(u64::MAX);
                if size > self.limits.max_file_size {
                    warn!(
                        "[VFS] Skipping {} during sync: {} bytes exceeds the per-file limit",
                        vfs_path, size
                    );
                    report.skipped.push(vfs_path);
                } else {
                    host_files.push(vfs_path);
                }
            } else {
                report.skipped.push(vfs_path);
            }
        }

        // Removals first so that replacements have the freed quota available.
        let removed_files: Vec<String> = self
            .files
            .keys()
            .filter(|p| !seen_files.contains(*p))
            .cloned()
            .collect();
        for path in removed_files {
            if let Some(file) = self.files.remove(&path) {
                self.total_size -= file.size;
                report.removed.push(path);
            }
        }
        // Directories that still hold a kept file survive even if the walk
        // could not list them.
        self.directories.retain(|p, _| {
            let prefix = format!("{}/", p.trim_end_matches('/'));
            seen_dirs.contains(p) || seen_files.iter().any(|f| f.starts_with(&prefix))
        });

        for dir in &seen_dirs {
            if !self.directories.contains_key(dir) {
                self.create_dir_chain(dir);
            }
        }

        for vfs_path in host_files {
            let content = match hostfs::read_capped(
                root,
                host_relative(&vfs_path),
                self.limits.max_file_size,
            ) {
                Ok(Some(content)) => content,
                Ok(None) => {
                    report.skipped.push(vfs_path);
                    continue;
                }
                Err(e) => {
                    warn!("[VFS] Skipping {} during sync: {}", vfs_path, e);
                    report.skipped.push(vfs_path);
                    continue;
                }
            };
            let existing = self.files.get(&vfs_path).map(|f| f.checksum.clone());
            if existing.as_deref() == Some(checksum(&content).as_str()) {
                continue;
            }
            match self.write_file(&vfs_path, content) {
                Ok(_) if existing.is_some() => report.updated.push(vfs_path),
                Ok(_) => report.added.push(vfs_path),
                Err(e) => {
                    warn!("[VFS] Skipping {} during sync: {}", vfs_path, e);
                    report.skipped.push(vfs_path);
                }
            }
        }

        Ok(report)
    }

    fn check_ancestors_are_directories(&self, path: &str) -> VfsResult<()> {
        let mut current = parent_path(path);
        while let Some(p) = current {
            if self.files.contains_key(p) {
                return Err(VfsError::NotADirectory(p.to_string()));
            }
            current = parent_path(p);
        }
        Ok(())
    }

    fn create_dir_chain(&mut self, path: &str) {
        let mut missing = Vec::new();
        let mut current = Some(path);
        while let Some(p) = current {
            if self.directories.contains_key(p) {
                break;
            }
            missing.push(p.to_string());
            current = parent_path(p);
        }
        let now = Utc::now();
        for p in missing.into_iter().rev() {
            self.directories.insert(
                p.clone(),
                VirtualDirectory {
                    path: p,
                    created: now,
                    modified: now,
                },
            );
        }
    }

    fn touch_parent(&mut self, path: &str) {
        if let Some(parent) = parent_path(path) {
            if let Some(dir) = self.directories.get_mut(parent) {
                dir.modified = Utc::now();
            }
        }
    }

    fn file_entry(file: &VirtualFile) -> VfsEntry {
        VfsEntry {
            name: file_name(&file.path).to_string(),
            path: file.path.clone(),
            kind: EntryKind::File,
            size: file.size,
            modified: file.modified,
            mime_type: Some(file.mime_type.clone()),
            checksum: Some(file.checksum.clone()),
        }
    }

    fn dir_entry(&self, dir: &VirtualDirectory) -> VfsEntry {
        let prefix = if dir.path == "/" {
            "/".to_string()
        } else {
            format!("{}/", dir.path)
        };
        let size = self
            .files
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .map(|(_, f)| f.size)
            .sum();
        VfsEntry {
            name: if dir.path == "/" {
                "/".to_string()
            } else {
                file_name(&dir.path).to_string()
            },
            path: dir.path.clone(),
            kind: EntryKind::Directory,
            size,
            modified: dir.modified,
            mime_type: None,
            checksum: None,
        }
    }
}

fn vfs_path_for(root: &Path, host: &Path) -> Option<String> {
    let relative = host.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in relative.components() {
        parts.push(component.as_os_str().to_str()?);
    }
    normalize_path(&format!("/{}", parts.join("/"))).ok()
}
