use crate::errors::Result;
use crate::hostfs;
use crate::vfs::RESERVED_DIR;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Host directory backing one session container.
///
/// ```text
/// <base>/<container-name>/
///     .sandbox/                 runner, user code, variables (not mirrored into the VFS)
///     .sandbox/site-packages/   packages installed for this session
///     output/plots/             figures saved by the runner
///     ...                       session files synced from the VFS
/// ```
#[derive(Debug)]
pub struct SessionWorkspace {
    path: PathBuf,
    cleanup_on_drop: bool,
}

impl SessionWorkspace {
    /// Create (or reuse) the workspace directory for `name` under `base`
    pub fn create(base: &Path, name: &str) -> Result<Self> {
        let path = base.join(name);
        std::fs::create_dir_all(path.join(RESERVED_DIR).join("site-packages"))?;

        // Containers may run as a different uid than the server.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            for dir in [path.clone(), path.join(RESERVED_DIR)] {
                std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o777))?;
            }
        }

        info!("[WORKSPACE] Created workspace: {:?}", path);
        Ok(Self {
            path,
            cleanup_on_drop: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn reserved_dir(&self) -> PathBuf {
        self.path.join(RESERVED_DIR)
    }

    pub fn site_packages(&self) -> PathBuf {
        self.reserved_dir().join("site-packages")
    }

    /// Keep the directory after drop
    pub fn keep(&mut self) {
        self.cleanup_on_drop = false;
    }

    /// Delete the directory now
    pub fn remove(mut self) -> Result<()> {
        self.cleanup_on_drop = false;
        if self.path.exists() {
            std::fs::remove_dir_all(&self.path)?;
            info!("[WORKSPACE] Removed workspace: {:?}", self.path);
        }
        Ok(())
    }
}

impl Drop for SessionWorkspace {
    fn drop(&mut self) {
        if self.cleanup_on_drop && self.path.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                warn!(
                    "[WORKSPACE] Failed to cleanup workspace {:?}: {}",
                    self.path, e
                );
            }
        }
    }
}

/// Write a file into the `.sandbox/` directory of the workspace at `root`.
/// Whatever user code left at those paths is replaced, not followed.
pub fn write_reserved(root: &Path, name: &str, contents: &[u8]) -> Result<PathBuf> {
    Ok(hostfs::write(
        root,
        &Path::new(RESERVED_DIR).join(name),
        contents,
    )?)
}

/// Directories under `base` whose names start with `prefix`
pub fn list_workspaces(base: &Path, prefix: &str) -> Result<Vec<String>> {
    if !base.exists() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in std::fs::read_dir(base)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if name.starts_with(prefix) {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_and_cleanup() {
        let base = tempfile::tempdir().unwrap();
        let path = {
            let ws = SessionWorkspace::create(base.path(), "pysandbox-session-1").unwrap();
            assert!(ws.site_packages().is_dir());
            let runner = write_reserved(ws.path(), "runner.py", b"print(1)").unwrap();
            assert_eq!(std::fs::read(runner).unwrap(), b"print(1)");
            ws.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn keep_and_remove() {
        let base = tempfile::tempdir().unwrap();
        let mut ws = SessionWorkspace::create(base.path(), "pysandbox-session-2").unwrap();
        ws.keep();
        let path = ws.path().to_path_buf();
        drop(ws);
        assert!(path.exists());

        let ws = SessionWorkspace::create(base.path(), "pysandbox-session-2").unwrap();
        ws.remove().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn lists_by_prefix() {
        let base = tempfile::tempdir().unwrap();
        let mut a = SessionWorkspace::create(base.path(), "pysandbox-session-a").unwrap();
        let mut b = SessionWorkspace::create(base.path(), "other-b").unwrap();
        a.keep();
        b.keep();
        let names = list_workspaces(base.path(), "pysandbox-session-").unwrap();
        assert_eq!(names, vec!["pysandbox-session-a".to_string()]);
        assert!(list_workspaces(&base.path().join("missing"), "x").unwrap().is_empty());
    }
}
