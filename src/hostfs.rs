//! Host file access confined to a session workspace.
//!
//! User code can plant symlinks, FIFOs or files anywhere in its writable
//! workspace. Every path the server touches there is resolved one component
//! at a time with `symlink_metadata`, and final opens use `O_NOFOLLOW`.

use std::ffi::OsStr;
use std::fs::{File, Metadata, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use tracing::warn;

fn escape_error(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::PermissionDenied,
        format!("{} resolves outside the workspace", path.display()),
    )
}

fn normal_components(relative: &Path) -> io::Result<Vec<&OsStr>> {
    let mut names = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(name) => names.push(name),
            Component::CurDir => {}
            _ => return Err(escape_error(relative)),
        }
    }
    Ok(names)
}

fn split_file(relative: &Path) -> io::Result<(&Path, &OsStr)> {
    let name = relative.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} does not name a file", relative.display()),
        )
    })?;
    Ok((relative.parent().unwrap_or(Path::new("")), name))
}

/// Remove whatever `meta` describes at `path`. Symlinks go, never their targets.
fn remove_entry(path: &Path, meta: &Metadata) -> io::Result<()> {
    if meta.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}

fn open_nofollow(path: &Path, options: &mut OpenOptions) -> io::Result<File> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        // O_NONBLOCK keeps a FIFO swapped in after the type check from hanging the open.
        options.custom_flags(libc::O_NOFOLLOW | libc::O_NONBLOCK);
    }
    options.open(path)
}

fn check_confined(root: &Path, path: &Path) -> io::Result<()> {
    if path.canonicalize()?.starts_with(root.canonicalize()?) {
        Ok(())
    } else {
        Err(escape_error(path))
    }
}

/// Make `relative` a chain of real directories under `root`, replacing any
/// symlink or file found where a directory belongs.
pub fn ensure_dir(root: &Path, relative: &Path) -> io::Result<PathBuf> {
    let mut current = root.to_path_buf();
    for name in normal_components(relative)? {
        current.push(name);
        match std::fs::symlink_metadata(&current) {
            Ok(meta) if meta.is_dir() => {}
            Ok(meta) => {
                warn!("[HOSTFS] Replacing {:?} with a directory", current);
                remove_entry(&current, &meta)?;
                std::fs::create_dir(&current)?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => std::fs::create_dir(&current)?,
            Err(e) => return Err(e),
        }
    }
    check_confined(root, &current)?;
    Ok(current)
}

/// Resolve an existing chain of real directories without changing anything.
/// `None` when a component is missing, a symlink or not a directory.
pub fn existing_dir(root: &Path, relative: &Path) -> io::Result<Option<PathBuf>> {
    let mut current = root.to_path_buf();
    for name in normal_components(relative)? {
        current.push(name);
        match std::fs::symlink_metadata(&current) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        }
    }
    Ok(Some(current))
}

/// Write `contents` to `relative` under `root`, creating parents. An existing
/// symlink or directory at the target is replaced rather than followed.
pub fn write(root: &Path, relative: &Path, contents: &[u8]) -> io::Result<PathBuf> {
    let (parent, name) = split_file(relative)?;
    let target = ensure_dir(root, parent)?.join(name);
    match std::fs::symlink_metadata(&target) {
        Ok(meta) if !meta.is_file() => remove_entry(&target, &meta)?,
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    let mut file = open_nofollow(
        &target,
        OpenOptions::new().write(true).create(true).truncate(true),
    )?;
    file.write_all(contents)?;
    Ok(target)
}

/// Read a regular file of at most `limit` bytes. `Ok(None)` when the entry is
/// missing, is not a regular file, sits behind a symlink or is too large.
pub fn read_capped(root: &Path, relative: &Path, limit: u64) -> io::Result<Option<Vec<u8>>> {
    let (parent, name) = split_file(relative)?;
    let Some(dir) = existing_dir(root, parent)? else {
        return Ok(None);
    };
    let target = dir.join(name);
    match std::fs::symlink_metadata(&target) {
        Ok(meta) if meta.is_file() && meta.len() <= limit => {}
        Ok(_) => return Ok(None),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    }

    let file = open_nofollow(&target, OpenOptions::new().read(true))?;
    let meta = file.metadata()?;
    if !meta.is_file() || meta.len() > limit {
        return Ok(None);
    }
    let mut content = Vec::with_capacity(meta.len() as usize);
    file.take(limit + 1).read_to_end(&mut content)?;
    if content.len() as u64 > limit {
        return Ok(None);
    }
    Ok(Some(content))
}

/// Remove the non-directory entry at `relative`. Nothing happens when a
/// parent component is not a real directory.
pub fn remove_file(root: &Path, relative: &Path) -> io::Result<bool> {
    let (parent, name) = split_file(relative)?;
    let Some(dir) = existing_dir(root, parent)? else {
        return Ok(false);
    };
    let target = dir.join(name);
    match std::fs::symlink_metadata(&target) {
        Ok(meta) if !meta.is_dir() => {
            std::fs::remove_file(&target)?;
            Ok(true)
        }
        Ok(_) => Ok(false),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Remove whatever sits at `relative`: a file, a symlink or a whole
/// directory tree.
pub fn remove_all(root: &Path, relative: &Path) -> io::Result<bool> {
    let (parent, name) = split_file(relative)?;
    let Some(dir) = existing_dir(root, parent)? else {
        return Ok(false);
    };
    let target = dir.join(name);
    match std::fs::symlink_metadata(&target) {
        Ok(meta) => {
            remove_entry(&target, &meta)?;
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    struct Dirs {
        _tmp: tempfile::TempDir,
        root: PathBuf,
        outside: PathBuf,
    }

    fn dirs() -> Dirs {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("ws");
        let outside = tmp.path().join("outside");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(&outside).unwrap();
        Dirs {
            _tmp: tmp,
            root,
            outside,
        }
    }

    #[test]
    fn write_replaces_symlinked_directories() {
        let d = dirs();
        symlink(&d.outside, d.root.join(".sandbox")).unwrap();

        let written = write(&d.root, Path::new(".sandbox/runner.py"), b"pass").unwrap();
        assert_eq!(written, d.root.join(".sandbox/runner.py"));
        assert!(std::fs::symlink_metadata(d.root.join(".sandbox"))
            .unwrap()
            .is_dir());
        assert!(!d.outside.join("runner.py").exists());
    }

    #[test]
    fn write_replaces_symlinked_files() {
        let d = dirs();
        std::fs::write(d.outside.join("secret"), b"keep").unwrap();
        symlink(d.outside.join("secret"), d.root.join("data.txt")).unwrap();

        write(&d.root, Path::new("data.txt"), b"new").unwrap();
        assert_eq!(std::fs::read(d.outside.join("secret")).unwrap(), b"keep");
        assert_eq!(std::fs::read(d.root.join("data.txt")).unwrap(), b"new");
    }

    #[test]
    fn reads_refuse_symlinks_and_oversize_files() {
        let d = dirs();
        std::fs::write(d.outside.join("secret"), b"hidden").unwrap();
        symlink(d.outside.join("secret"), d.root.join("link")).unwrap();
        symlink(&d.outside, d.root.join("dir")).unwrap();
        std::fs::write(d.root.join("big"), vec![0u8; 32]).unwrap();
        std::fs::write(d.root.join("small"), b"ok").unwrap();

        assert_eq!(read_capped(&d.root, Path::new("link"), 64).unwrap(), None);
        assert_eq!(read_capped(&d.root, Path::new("dir/secret"), 64).unwrap(), None);
        assert_eq!(read_capped(&d.root, Path::new("big"), 16).unwrap(), None);
        assert_eq!(
            read_capped(&d.root, Path::new("small"), 16).unwrap(),
            Some(b"ok".to_vec())
        );
    }

    #[test]
    fn removals_stay_inside_the_root() {
        let d = dirs();
        std::fs::write(d.outside.join("victim.py"), b"x").unwrap();
        symlink(&d.outside, d.root.join("pkg")).unwrap();

        assert!(!remove_file(&d.root, Path::new("pkg/victim.py")).unwrap());
        assert!(d.outside.join("victim.py").exists());

        assert!(remove_all(&d.root, Path::new("pkg")).unwrap());
        assert!(!d.root.join("pkg").exists());
        assert!(d.outside.join("victim.py").exists());
    }

    #[test]
    fn parent_components_are_rejected() {
        let d = dirs();
        assert!(write(&d.root, Path::new("../outside/x"), b"x").is_err());
        assert!(ensure_dir(&d.root, Path::new("/etc")).is_err());
        assert!(!d.outside.join("x").exists());
    }
}
