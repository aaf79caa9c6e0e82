//! Local mirroring of duplicate sources.
//!
//! When a sibling already owns this node's source, fetching degrades to
//! replicating the sibling's materialized paths, as symlinks by default or
//! as deep copies when linking is disabled.

use crate::component::{Component, LocalRef};
use crate::ResolveError;
use habitat_fs::{copy_dir_all, create_symlink, normalize_path};
use habitat_types::SyncOptions;
use std::path::PathBuf;
use tracing::{debug, warn};

pub(crate) async fn mirror(
    component: &Component,
    local: &LocalRef,
    _options: &SyncOptions,
) -> Result<Vec<PathBuf>, ResolveError> {
    let reference = &local.reference;

    if !reference.is_fetched() {
        // Register before re-checking: a completion between the check and
        // the registration would otherwise be missed forever.
        let receiver = reference
            .parent()
            .and_then(|parent| {
                parent
                    .group
                    .as_ref()
                    .map(|group| group.events.register_consumer(&reference.name))
            });
        if let Some(receiver) = receiver {
            if !reference.is_fetched() {
                debug!(
                    "reference component {reference} has not been fetched yet, waiting on its completion"
                );
                // A closed channel means the group was cleared; proceed so
                // the barrier can surface the original error.
                let _ = receiver.await;
                debug!("reference component {reference} completed, start to fetch {component}");
            }
        }
    }

    let use_symlink = local.symlink && !component.spec.disable_link;
    for path in reference.fetched_paths() {
        let rel = path
            .strip_prefix(&reference.target_dir)
            .map(PathBuf::from)
            .unwrap_or_default();
        let (src, dst) = if rel.as_os_str().is_empty() {
            (reference.target_dir.clone(), component.target_dir.clone())
        } else {
            (reference.target_dir.join(&rel), component.target_dir.join(&rel))
        };

        if !use_symlink {
            if dst.symlink_metadata().map(|m| m.is_symlink()).unwrap_or(false) {
                debug!("{} is an existing symlink, remove it", dst.display());
                std::fs::remove_file(&dst).map_err(|e| habitat_fs::FsError::Io {
                    context: "failed to remove",
                    path: dst.display().to_string(),
                    source: e,
                })?;
            }
            debug!("copying {} to {} instead of creating symlink", src.display(), dst.display());
            let (src, dst) = (src.clone(), dst.clone());
            tokio::task::spawn_blocking(move || deep_copy(&src, &dst))
                .await
                .map_err(|e| habitat_fetch::FetchError::Join(e.to_string()))??;
            continue;
        }

        if dst.symlink_metadata().map(|m| m.is_symlink()).unwrap_or(false) {
            // Stale link from an earlier layout.
            std::fs::remove_file(&dst).map_err(|e| habitat_fs::FsError::Io {
                context: "failed to remove",
                path: dst.display().to_string(),
                source: e,
            })?;
        }
        if normalize_path(&src) == normalize_path(&dst) {
            warn!(
                "src path is the same as dst path when creating symlink\nsrc: {}\ndst: {}",
                src.display(),
                dst.display()
            );
            continue;
        }
        if dst.exists() {
            warn!(
                "dst path {} already exists, skip creating symlink",
                dst.display()
            );
            continue;
        }
        create_symlink(&src, &dst).map_err(ResolveError::Fs)?;
    }

    Ok(reference.fetched_paths())
}

fn deep_copy(src: &std::path::Path, dst: &std::path::Path) -> Result<(), ResolveError> {
    if src.is_dir() {
        copy_dir_all(src, dst).map_err(ResolveError::Fs)
    } else {
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent).map_err(|e| habitat_fs::FsError::Io {
                context: "failed to create",
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        std::fs::copy(src, dst).map(|_| ()).map_err(|e| {
            ResolveError::Fs(habitat_fs::FsError::Io {
                context: "failed to copy",
                path: src.display().to_string(),
                source: e,
            })
        })
    }
}
