//! Archive extraction for http dependencies.
//!
//! Zip archives go through the `zip` crate so that mode bits (stored in the
//! high 16 bits of `external_attr`) and symlink entries survive. Tar
//! archives use the `tar` crate for plain and gzip compression; the rarer
//! bzip2/xz variants fall back to the platform `tar` binary.

use crate::{io_err, matches_any_prefix, FsError};
use std::io::Read;
use std::path::Path;
use tracing::debug;

const ZIP_EXTENSIONS: &[&str] = &[".aar", ".jar", ".zip"];
const TAR_EXTENSIONS: &[&str] = &[".tar", ".tgz", ".gz"];
const TAR_FALLBACK_EXTENSIONS: &[&str] = &[".tbz2", ".bz2", ".txz", ".xz"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Zip,
    Tar,
    TarFallback,
}

fn detect_format(file_name: &str) -> Option<Format> {
    let lower = file_name.to_ascii_lowercase();
    if ZIP_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
        Some(Format::Zip)
    } else if TAR_FALLBACK_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
        Some(Format::TarFallback)
    } else if TAR_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
        Some(Format::Tar)
    } else {
        None
    }
}

/// Extract `src` into `dst`, keeping only entries under `paths` when the
/// filter is non-empty, then delete the archive.
pub fn extract_archive(src: &Path, dst: &Path, paths: &[String]) -> Result<(), FsError> {
    let file_name = src
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let format = detect_format(&file_name)
        .ok_or_else(|| FsError::UnsupportedArchive(src.display().to_string()))?;
    debug!("extract {} ({format:?}) into {}", src.display(), dst.display());
    std::fs::create_dir_all(dst).map_err(io_err("failed to create", dst))?;
    match format {
        Format::Zip => extract_zip(src, dst, paths)?,
        Format::Tar => extract_tar(src, dst, paths)?,
        Format::TarFallback => extract_tar_with_binary(src, dst, paths)?,
    }
    std::fs::remove_file(src).map_err(io_err("failed to remove", src))?;
    Ok(())
}

fn zip_error(path: &Path) -> impl FnOnce(zip::result::ZipError) -> FsError + '_ {
    move |source| FsError::Zip {
        path: path.display().to_string(),
        source,
    }
}

fn extract_zip(src: &Path, dst: &Path, paths: &[String]) -> Result<(), FsError> {
    let file = std::fs::File::open(src).map_err(io_err("failed to open", src))?;
    let mut archive = zip::ZipArchive::new(file).map_err(zip_error(src))?;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(zip_error(src))?;
        let Some(rel) = entry.enclosed_name().map(Path::to_path_buf) else {
            continue;
        };
        if !paths.is_empty() && !matches_any_prefix(&rel, paths) {
            continue;
        }
        let out = dst.join(&rel);
        let mode = entry.unix_mode();
        if is_symlink_mode(mode) {
            let mut target = String::new();
            entry
                .read_to_string(&mut target)
                .map_err(io_err("failed to read", &out))?;
            if let Some(parent) = out.parent() {
                std::fs::create_dir_all(parent).map_err(io_err("failed to create", parent))?;
            }
            #[cfg(unix)]
            std::os::unix::fs::symlink(&target, &out).map_err(io_err("failed to link", &out))?;
            #[cfg(windows)]
            std::os::windows::fs::symlink_file(&target, &out)
                .map_err(io_err("failed to link", &out))?;
            continue;
        }
        if entry.is_dir() {
            std::fs::create_dir_all(&out).map_err(io_err("failed to create", &out))?;
            continue;
        }
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent).map_err(io_err("failed to create", parent))?;
        }
        let mut writer = std::fs::File::create(&out).map_err(io_err("failed to create", &out))?;
        std::io::copy(&mut entry, &mut writer).map_err(io_err("failed to write", &out))?;
        #[cfg(unix)]
        if let Some(mode) = mode {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&out, std::fs::Permissions::from_mode(mode))
                .map_err(io_err("failed to chmod", &out))?;
        }
    }
    Ok(())
}

fn is_symlink_mode(mode: Option<u32>) -> bool {
    const S_IFMT: u32 = 0o170000;
    const S_IFLNK: u32 = 0o120000;
    mode.map(|m| m & S_IFMT == S_IFLNK).unwrap_or(false)
}

fn extract_tar(src: &Path, dst: &Path, paths: &[String]) -> Result<(), FsError> {
    let file = std::fs::File::open(src).map_err(io_err("failed to open", src))?;
    let gzipped = !src
        .extension()
        .map(|e| e.eq_ignore_ascii_case("tar"))
        .unwrap_or(false);
    if gzipped {
        unpack_tar(tar::Archive::new(flate2::read::GzDecoder::new(file)), dst, paths)
    } else {
        unpack_tar(tar::Archive::new(file), dst, paths)
    }
}

fn unpack_tar<R: Read>(
    mut archive: tar::Archive<R>,
    dst: &Path,
    paths: &[String],
) -> Result<(), FsError> {
    archive.set_preserve_permissions(true);
    let entries = archive.entries().map_err(io_err("failed to read", dst))?;
    for entry in entries {
        let mut entry = entry.map_err(io_err("failed to read", dst))?;
        let rel = entry
            .path()
            .map_err(io_err("failed to read", dst))?
            .to_path_buf();
        if !paths.is_empty() && !matches_any_prefix(&rel, paths) {
            continue;
        }
        entry
            .unpack_in(dst)
            .map_err(io_err("failed to extract into", dst))?;
    }
    Ok(())
}

fn extract_tar_with_binary(src: &Path, dst: &Path, paths: &[String]) -> Result<(), FsError> {
    let tar = if cfg!(windows) { "tar.exe" } else { "tar" };
    let mut command = std::process::Command::new(tar);
    command
        .arg("-xpf")
        .arg(src)
        .arg("-C")
        .arg(dst)
        .args(paths);
    let status = command.status().map_err(io_err("failed to run", src))?;
    if !status.success() {
        return Err(FsError::Command {
            command: format!("{tar} -xpf {}", src.display()),
            status: status.to_string(),
        });
    }
    Ok(())
}
