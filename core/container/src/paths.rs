//! Filesystem helpers: destination checks and atomic container writes.

use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;
use tvault_common::{EngineError, EngineResult, ErrorCode, ResultExt};

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Resolve `path` to the spelling used to compare and lock containers.
///
/// Every existing prefix is canonicalised, so `..` and symlinks resolve the
/// way the filesystem resolves them. Components below the deepest existing
/// directory are folded lexically.
pub fn resolve_path(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut resolved = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            Component::Normal(name) => {
                resolved.push(name);
                if let Ok(real) = resolved.canonicalize() {
                    resolved = real;
                }
            }
            other => resolved.push(other.as_os_str()),
        }
    }
    resolved
}

/// Check that a new container may be written at `path`.
///
/// Creates the parent directory when missing.
///
/// # Errors
/// - `ContainerNewPathRequired` if `path` is empty
/// - `ContainerPathExists` if `path` exists and `overwrite` is false
pub fn check_container_path(path: &Path, overwrite: bool) -> EngineResult<()> {
    if path.as_os_str().is_empty() {
        return Err(ErrorCode::ContainerNewPathRequired.into());
    }
    if path.exists() && !overwrite {
        return Err(EngineError::new(ErrorCode::ContainerPathExists)
            .with_details(path.display().to_string()));
    }
    fs::create_dir_all(parent_dir(path)).code(ErrorCode::FileOperation)?;
    Ok(())
}

/// Whether `path` is an existing regular file.
pub fn check_file_exists(path: &Path) -> bool {
    path.is_file()
}

/// Remove a directory. Succeeds when it does not exist.
pub fn remove_dir(path: &Path, recursive: bool) -> EngineResult<()> {
    if !path.exists() {
        return Ok(());
    }
    let result = if recursive {
        fs::remove_dir_all(path)
    } else {
        fs::remove_dir(path)
    };
    result
        .code(ErrorCode::FileOperation)
        .map_err(|e| e.with_details(path.display().to_string()))
}

/// A fully written, fsynced file waiting to be renamed into place.
///
/// Dropping it without [`StagedFile::commit`] removes the temporary file,
/// leaving the destination untouched.
#[derive(Debug)]
pub struct StagedFile {
    temp: NamedTempFile,
    dest: PathBuf,
}

impl StagedFile {
    /// Write `bytes` to a temporary file next to `dest`.
    pub fn write(dest: &Path, bytes: &[u8]) -> io::Result<Self> {
        let dir = parent_dir(dest);
        fs::create_dir_all(dir)?;

        let mut temp = NamedTempFile::new_in(dir)?;
        temp.write_all(bytes)?;
        temp.as_file().sync_all()?;

        Ok(Self {
            temp,
            dest: dest.to_path_buf(),
        })
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }

    /// Rename into place.
    ///
    /// # Errors
    /// - `AlreadyExists` when `overwrite` is false and the destination exists
    pub fn commit(self, overwrite: bool) -> io::Result<()> {
        let dest = self.dest;
        if overwrite {
            self.temp.persist(&dest)?;
        } else {
            self.temp.persist_noclobber(&dest)?;
        }

        #[cfg(unix)]
        if let Ok(dir) = fs::File::open(parent_dir(&dest)) {
            // Best effort: persist the rename itself.
            let _ = dir.sync_all();
        }

        debug!(path = %dest.display(), "Committed file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_container_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/c.tvlt");

        check_container_path(&path, false).unwrap();
        assert!(dir.path().join("nested/deeper").is_dir());

        fs::write(&path, b"x").unwrap();
        let err = check_container_path(&path, false).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ContainerPathExists);
        assert!(check_container_path(&path, true).is_ok());

        let err = check_container_path(Path::new(""), false).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ContainerNewPathRequired);
    }

    #[test]
    fn test_resolve_path_folds_aliases() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs::create_dir(root.join("sub")).unwrap();
        let plain = root.join("c.tvlt");

        assert_eq!(resolve_path(&plain), plain);
        assert_eq!(resolve_path(&root.join("sub/../c.tvlt")), plain);
        assert_eq!(resolve_path(&root.join("./sub/./../c.tvlt")), plain);
        assert_eq!(resolve_path(&root.join("missing/../c.tvlt")), plain);

        fs::write(&plain, b"x").unwrap();
        assert_eq!(resolve_path(&root.join("sub/../c.tvlt")), plain);
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_path_follows_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs::create_dir(root.join("real")).unwrap();
        std::os::unix::fs::symlink(root.join("real"), root.join("link")).unwrap();

        assert_eq!(
            resolve_path(&root.join("link/c.tvlt")),
            root.join("real/c.tvlt")
        );
    }

    #[test]
    fn test_check_file_exists() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        fs::write(&file, b"x").unwrap();

        assert!(check_file_exists(&file));
        assert!(!check_file_exists(dir.path()));
        assert!(!check_file_exists(&dir.path().join("missing")));
    }

    #[test]
    fn test_remove_dir() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a/b");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("f"), b"x").unwrap();

        assert!(remove_dir(&dir.path().join("a"), false).is_err());
        remove_dir(&dir.path().join("a"), true).unwrap();
        assert!(!dir.path().join("a").exists());

        remove_dir(&dir.path().join("never"), false).unwrap();
    }

    #[test]
    fn test_staged_file_commit_and_abort() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.tvlt");

        let staged = StagedFile::write(&dest, b"first").unwrap();
        drop(staged);
        assert!(!dest.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);

        StagedFile::write(&dest, b"first").unwrap().commit(false).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"first");

        let err = StagedFile::write(&dest, b"second")
            .unwrap()
            .commit(false)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(fs::read(&dest).unwrap(), b"first");

        StagedFile::write(&dest, b"second").unwrap().commit(true).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"second");
    }
}
