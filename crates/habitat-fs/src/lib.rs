//! Filesystem primitives shared by the fetchers.

use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod archive;

pub const TEMP_DIR_PREFIX: &str = "TEMP-HABITAT-";

#[derive(Error, Debug)]
pub enum FsError {
    #[error("{context} {path}: {source}")]
    Io {
        context: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("destination path {0} already exists")]
    DestinationExists(String),
    #[error("cannot move a directory {0} into itself")]
    MoveIntoSelf(String),
    #[error("file {0} is not a supported archive format")]
    UnsupportedArchive(String),
    #[error("failed to extract {path}: {source}")]
    Zip {
        path: String,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("`{command}` failed with {status}")]
    Command { command: String, status: String },
}

pub(crate) fn io_err<'a>(
    context: &'static str,
    path: &'a Path,
) -> impl FnOnce(std::io::Error) -> FsError + 'a {
    move |source| FsError::Io {
        context,
        path: path.display().to_string(),
        source,
    }
}

/// Remove a directory tree, retrying read-only entries.
///
/// Git working trees on Windows contain read-only object files that make a
/// plain remove fail with a permission error; those entries are made
/// writable and removed individually.
pub fn rmtree(path: &Path) -> Result<(), FsError> {
    let mut attempts = 0;
    while path.exists() {
        match std::fs::remove_dir_all(path) {
            Ok(()) => break,
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied && attempts < 3 => {
                attempts += 1;
                make_tree_writable(path);
            }
            Err(e) if !path.exists() => {
                debug!("tree {} vanished during removal: {e}", path.display());
                break;
            }
            Err(e) => return Err(io_err("failed to remove", path)(e)),
        }
    }
    Ok(())
}

fn make_tree_writable(path: &Path) {
    for entry in walkdir::WalkDir::new(path).into_iter().flatten() {
        if let Ok(metadata) = entry.metadata() {
            let mut permissions = metadata.permissions();
            #[allow(clippy::permissions_set_readonly_false)]
            permissions.set_readonly(false);
            let _ = std::fs::set_permissions(entry.path(), permissions);
        }
    }
}

/// Recursively move a file or directory, like `mv`.
///
/// Renames when possible; falls back to copy-then-remove across
/// filesystems, recreating symlinks instead of following them. Moving into
/// an existing directory places the source inside it.
pub fn move_path(src: &Path, dst: &Path) -> Result<PathBuf, FsError> {
    let real_dst = if dst.is_dir() && !dst.symlink_metadata().map(|m| m.is_symlink()).unwrap_or(false)
    {
        let named = dst.join(src.file_name().unwrap_or(std::ffi::OsStr::new("SRC")));
        if same_file(src, dst) {
            // Case-insensitive filesystem; rename in place.
            std::fs::rename(src, dst).map_err(io_err("failed to rename", src))?;
            return Ok(dst.to_path_buf());
        }
        if named.exists() {
            return Err(FsError::DestinationExists(named.display().to_string()));
        }
        named
    } else {
        dst.to_path_buf()
    };

    if std::fs::rename(src, &real_dst).is_ok() {
        return Ok(real_dst);
    }

    let metadata = src
        .symlink_metadata()
        .map_err(io_err("failed to stat", src))?;
    if metadata.is_symlink() {
        let target = std::fs::read_link(src).map_err(io_err("failed to read link", src))?;
        symlink(&target, &real_dst)?;
        std::fs::remove_file(src).map_err(io_err("failed to remove", src))?;
    } else if metadata.is_dir() {
        if real_dst.starts_with(src) {
            return Err(FsError::MoveIntoSelf(src.display().to_string()));
        }
        copy_dir_all(src, &real_dst)?;
        rmtree(src)?;
    } else {
        std::fs::copy(src, &real_dst).map_err(io_err("failed to copy", src))?;
        std::fs::remove_file(src).map_err(io_err("failed to remove", src))?;
    }
    Ok(real_dst)
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Deep-copy a directory, preserving symlinks as symlinks. Existing
/// destination directories are merged into.
pub fn copy_dir_all(src: &Path, dst: &Path) -> Result<(), FsError> {
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry.map_err(|e| FsError::Io {
            context: "failed to walk",
            path: src.display().to_string(),
            source: e.into(),
        })?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir yields children of src");
        let target = dst.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target).map_err(io_err("failed to create", &target))?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())
                .map_err(io_err("failed to read link", entry.path()))?;
            if target.symlink_metadata().is_ok() {
                std::fs::remove_file(&target).map_err(io_err("failed to remove", &target))?;
            }
            symlink(&link, &target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(io_err("failed to create", parent))?;
            }
            std::fs::copy(entry.path(), &target).map_err(io_err("failed to copy", entry.path()))?;
        }
    }
    Ok(())
}

/// Create a symbolic link at `dst` pointing to `src`, creating parent
/// directories as needed. A missing `src` is skipped with a log line, the
/// way a reference that fetched nothing should be.
pub fn create_symlink(src: &Path, dst: &Path) -> Result<(), FsError> {
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent).map_err(io_err("failed to create", parent))?;
    }
    if src.exists() {
        symlink(src, dst)?;
        info!("symbolic link created from {} to {}", dst.display(), src.display());
    }
    Ok(())
}

fn symlink(src: &Path, dst: &Path) -> Result<(), FsError> {
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(src, dst).map_err(io_err("failed to link", dst))
    }
    #[cfg(windows)]
    {
        if src.is_dir() {
            std::os::windows::fs::symlink_dir(src, dst).map_err(io_err("failed to link", dst))
        } else {
            std::os::windows::fs::symlink_file(src, dst).map_err(io_err("failed to link", dst))
        }
    }
}

/// Create a uniquely named `TEMP-HABITAT-*` directory under `root_dir`.
/// The caller owns cleanup; `clean_temp_dirs` sweeps leftovers.
pub fn create_temp_dir(root_dir: &Path, name: &str) -> Result<PathBuf, FsError> {
    let prefix = format!("{TEMP_DIR_PREFIX}{name}-");
    let dir = tempfile::Builder::new()
        .prefix(&prefix)
        .tempdir_in(root_dir)
        .map_err(io_err("failed to create temp dir in", root_dir))?;
    Ok(dir.into_path())
}

/// Remove every leftover temp directory under `root_dir`.
pub fn clean_temp_dirs(root_dir: &Path) {
    let Ok(entries) = std::fs::read_dir(root_dir) else {
        return;
    };
    for entry in entries.flatten() {
        if entry.file_name().to_string_lossy().starts_with(TEMP_DIR_PREFIX) {
            if let Err(e) = rmtree(&entry.path()) {
                warn!("failed to clean temp dir {}: {e}", entry.path().display());
            }
        }
    }
}

/// Normalize a path lexically, resolving `.` and `..` without touching the
/// filesystem. Used to compare target directories for conflicts.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut components = path.components().peekable();
    let mut normalized = if let Some(c @ Component::Prefix(..)) = components.peek().cloned() {
        components.next();
        PathBuf::from(c.as_os_str())
    } else {
        PathBuf::new()
    };
    for component in components {
        match component {
            Component::Prefix(..) => unreachable!(),
            Component::RootDir => {
                normalized.push(component.as_os_str());
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push(Component::ParentDir.as_os_str());
                }
            }
            Component::Normal(c) => {
                normalized.push(c);
            }
        }
    }
    if normalized.as_os_str().is_empty() {
        normalized.push(".");
    }
    normalized
}

/// True when `sub` equals or lies under one of the given path prefixes.
pub fn matches_any_prefix(sub: &Path, prefixes: &[String]) -> bool {
    prefixes.iter().any(|p| {
        let prefix = Path::new(p.trim_end_matches('/'));
        sub == prefix || sub.starts_with(prefix)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_move_file_and_dir() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("a.txt");
        std::fs::write(&src, "a").unwrap();
        let dst = tmp.path().join("b.txt");
        move_path(&src, &dst).unwrap();
        assert!(!src.exists());
        assert_eq!(std::fs::read_to_string(&dst).unwrap(), "a");

        let dir = tmp.path().join("dir");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("f"), "f").unwrap();
        let moved = tmp.path().join("moved");
        move_path(&dir, &moved).unwrap();
        assert!(moved.join("f").exists());
        assert!(!dir.exists());
    }

    #[test]
    fn test_move_into_existing_dir() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir(&src).unwrap();
        std::fs::write(src.join("f"), "f").unwrap();
        let dst = tmp.path().join("dst");
        std::fs::create_dir(&dst).unwrap();
        let real = move_path(&src, &dst).unwrap();
        assert_eq!(real, dst.join("src"));
        assert!(dst.join("src/f").exists());
    }

    #[test]
    fn test_rmtree_readonly() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("tree");
        std::fs::create_dir_all(dir.join("sub")).unwrap();
        let file = dir.join("sub/locked");
        std::fs::write(&file, "x").unwrap();
        let mut perms = std::fs::metadata(&file).unwrap().permissions();
        perms.set_readonly(true);
        std::fs::set_permissions(&file, perms).unwrap();
        rmtree(&dir).unwrap();
        assert!(!dir.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_dir_preserves_symlinks() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir(&src).unwrap();
        std::fs::write(src.join("real"), "content").unwrap();
        std::os::unix::fs::symlink("real", src.join("link")).unwrap();

        let dst = tmp.path().join("dst");
        copy_dir_all(&src, &dst).unwrap();
        let meta = dst.join("link").symlink_metadata().unwrap();
        assert!(meta.is_symlink());
        assert_eq!(std::fs::read_to_string(dst.join("link")).unwrap(), "content");
    }

    #[test]
    fn test_create_symlink_skips_missing_source() {
        let tmp = TempDir::new().unwrap();
        let dst = tmp.path().join("nested/link");
        create_symlink(&tmp.path().join("missing"), &dst).unwrap();
        assert!(!dst.exists());
        assert!(dst.parent().unwrap().is_dir());
    }

    #[test]
    fn test_temp_dir_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let dir = create_temp_dir(tmp.path(), "GIT-FETCHER-x").unwrap();
        assert!(dir.is_dir());
        assert!(dir
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("TEMP-HABITAT-GIT-FETCHER-x-"));
        clean_temp_dirs(tmp.path());
        assert!(!dir.exists());
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(
            normalize_path(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
        assert_eq!(normalize_path(Path::new("a/..")), PathBuf::from("."));
        assert_eq!(
            normalize_path(Path::new("/root/main/sub1/../sub2")),
            PathBuf::from("/root/main/sub2")
        );
    }

    #[test]
    fn test_matches_any_prefix() {
        let prefixes = vec!["include".to_string(), "lib/".to_string()];
        assert!(matches_any_prefix(Path::new("include/a.h"), &prefixes));
        assert!(matches_any_prefix(Path::new("lib"), &prefixes));
        assert!(!matches_any_prefix(Path::new("src/a.c"), &prefixes));
    }
}
