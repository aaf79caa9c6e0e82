//! The git fetcher: working-tree checkout at an exact ref, backed by a
//! global bare-repo object cache wired in through alternates.

use crate::{blocking, FetchError, Fetcher};
use async_trait::async_trait;
use habitat_cache::hex_md5;
use habitat_fs::{create_temp_dir, move_path, rmtree};
use habitat_git::{git, GitError, HeadState};
use habitat_types::{FetchMode, GitSpec, SolutionSpec, SyncOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub struct GitFetcher {
    name: String,
    target_dir: PathBuf,
    spec: GitSpec,
    is_root: bool,
    fetch_mode: Option<FetchMode>,
}

/// How HEAD is positioned once the ref has been fetched.
enum Checkout {
    FetchHead,
    Branch(String),
    Tag(String),
}

impl GitFetcher {
    pub fn new(
        name: impl Into<String>,
        target_dir: impl Into<PathBuf>,
        spec: GitSpec,
        is_root: bool,
        fetch_mode: Option<FetchMode>,
    ) -> Self {
        Self {
            name: name.into(),
            target_dir: target_dir.into(),
            spec,
            is_root,
            fetch_mode,
        }
    }

    /// A solution repository is fetched like a plain git dependency with no
    /// tag, patches, or sparse paths.
    pub fn for_solution(
        name: impl Into<String>,
        target_dir: impl Into<PathBuf>,
        spec: &SolutionSpec,
        is_root: bool,
        fetch_mode: Option<FetchMode>,
    ) -> Self {
        Self::new(
            name,
            target_dir,
            GitSpec {
                url: spec.url.clone(),
                branch: spec.branch.clone(),
                commit: spec.commit.clone(),
                tag: None,
                enable_lfs: false,
                patches: None,
                paths: None,
            },
            is_root,
            fetch_mode,
        )
    }

    async fn resolve_refspec(
        &self,
        source_dir: &Path,
        remote: &str,
        url: &str,
        new_init: bool,
    ) -> Result<Option<(String, Checkout)>, FetchError> {
        if let Some(commit) = &self.spec.commit {
            let full = if commit.len() == 40 {
                commit.clone()
            } else {
                habitat_git::full_commit_id(commit, url).await?
            };
            return Ok(Some((full, Checkout::FetchHead)));
        }
        if let Some(branch) = &self.spec.branch {
            return Ok(Some((
                branch_refspec(remote, branch),
                Checkout::Branch(branch.clone()),
            )));
        }
        if let Some(tag) = &self.spec.tag {
            return Ok(Some((
                format!("+refs/tags/{tag}:refs/tag/{tag}"),
                Checkout::Tag(tag.clone()),
            )));
        }
        if new_init {
            let branch = habitat_git::remote_head_branch(source_dir, remote).await?;
            return Ok(Some((
                branch_refspec(remote, &branch),
                Checkout::Branch(branch),
            )));
        }
        // No ref configured on an existing tree: refresh whatever is
        // checked out, or nothing when HEAD is detached.
        match habitat_git::head_state(source_dir).await? {
            HeadState::Detached => Ok(None),
            HeadState::OnBranch(branch) => Ok(Some((
                branch_refspec(remote, &branch),
                Checkout::Branch(branch),
            ))),
        }
    }
}

fn branch_refspec(remote: &str, branch: &str) -> String {
    format!("+refs/heads/{branch}:refs/remotes/{remote}/{branch}")
}

#[async_trait]
impl Fetcher for GitFetcher {
    async fn fetch(
        &self,
        root_dir: &Path,
        options: &SyncOptions,
    ) -> Result<Vec<PathBuf>, FetchError> {
        let target_dir = self.target_dir.clone();
        let url = match &options.git_auth {
            Some(auth) => habitat_git::convert_git_url_to_http(&self.spec.url, Some(auth)),
            None => self.spec.url.clone(),
        };
        info!("fetch git repository {} to {}", self.spec.url, target_dir.display());

        // Raw non-root checkouts and --clean runs go through a scratch
        // directory that is moved onto the target at the end.
        let in_place = !options.clean && (!options.raw || self.is_root);
        let source_dir = if in_place {
            target_dir.clone()
        } else {
            create_temp_dir(root_dir, &format!("GIT-FETCHER-{}", self.name.replace('/', "_")))?
        };

        let mut new_init = false;
        if !habitat_git::is_git_root(&source_dir).await {
            git(["init"]).arg(source_dir.display().to_string()).run().await?;
            new_init = true;
        } else if !habitat_git::is_repo_valid(&source_dir).await {
            // The alternates point at a cleaned cache; objects can not be
            // trusted anymore.
            let stale = source_dir.clone();
            blocking(move || rmtree(&stale).map_err(Into::into)).await?;
            git(["init"]).arg(source_dir.display().to_string()).run().await?;
            new_init = true;
        }

        let remote = git(["remote"]).cwd(&source_dir).output().await?;
        let remote = match remote.lines().next() {
            Some(r) => r.to_string(),
            None => {
                git(["config", "remote.origin.url", &url])
                    .cwd(&source_dir)
                    .run()
                    .await?;
                "origin".to_string()
            }
        };

        // A repository fetched before `git lfs install` ends up with
        // pointer files in place of the tracked content.
        if self.spec.enable_lfs {
            if let Err(e) = git(["lfs", "install"]).cwd(&source_dir).run().await {
                warn!(
                    "{e} This may be caused by: 1. git lfs not installed. \
                     2. a git lfs install command is already running."
                );
            }
        }

        if options.force && !new_init {
            if options.raw {
                let paths_to_clean: Vec<PathBuf> = match &self.spec.paths {
                    Some(paths) => paths.iter().map(|p| target_dir.join(p)).collect(),
                    None => vec![target_dir.clone()],
                };
                for path in paths_to_clean {
                    if path.exists() {
                        warn!("remove existing target directory {}", path.display());
                        blocking(move || rmtree(&path).map_err(Into::into)).await?;
                    }
                }
            } else {
                git(["clean", "-fd"]).cwd(&source_dir).run().await?;
                git(["reset", "--hard"]).cwd(&source_dir).run().await?;
            }
        }

        // Reserved names in file paths make checkout complain
        // "error: invalid path..." on NTFS.
        #[cfg(windows)]
        git(["config", "core.protectNTFS", "false"])
            .cwd(&source_dir)
            .run()
            .await?;

        let sparse_result = match &self.spec.paths {
            Some(paths) => {
                git(["sparse-checkout", "set"])
                    .args(paths.clone())
                    .cwd(&source_dir)
                    .run()
                    .await
            }
            None => {
                git(["sparse-checkout", "disable"])
                    .cwd(&source_dir)
                    .run()
                    .await
            }
        };
        if let Err(e) = sparse_result {
            // Old git releases predate sparse checkouts.
            warn!("sparse checkout is not supported, skip: {e}");
        }

        let Some((mut ref_spec, checkout)) = self
            .resolve_refspec(&source_dir, &remote, &url, new_init)
            .await?
        else {
            return Ok(vec![target_dir]);
        };

        let fetch_all = self.fetch_mode == Some(FetchMode::All);
        let mut depth_args: Vec<String> = Vec::new();
        if self.is_root || fetch_all {
            ref_spec = "+refs/heads/*:refs/remotes/origin/*".to_string();
        } else if options.no_history {
            depth_args = vec!["--depth=1".to_string(), "--no-tags".to_string()];
        }

        if !options.disable_cache {
            let global_cache_dir = options.cache_dir.join("git");
            let cache_repo =
                ensure_cache_repo(&url, &ref_spec, &global_cache_dir, fetch_all).await?;
            habitat_git::set_alternates(&source_dir, &cache_repo.join("objects"))?;
        }

        git(["fetch"])
            .args(depth_args)
            .args(["--force", "--progress", "--update-head-ok", "--"])
            .arg(&url)
            .arg(&ref_spec)
            .cwd(&source_dir)
            .retries(1)
            .run()
            .await?;

        if options.raw {
            std::fs::create_dir_all(&target_dir)?;
            git([format!("--work-tree={}", target_dir.display())])
                .args(["checkout", "FETCH_HEAD", "--", "."])
                .cwd(&source_dir)
                .run()
                .await?;
        } else {
            let checkout_args: Vec<String> = match &checkout {
                Checkout::FetchHead => vec!["checkout".into(), "FETCH_HEAD".into()],
                Checkout::Branch(branch) => vec![
                    "checkout".into(),
                    "-B".into(),
                    branch.clone(),
                    format!("refs/remotes/{remote}/{branch}"),
                ],
                Checkout::Tag(tag) => vec!["checkout".into(), tag.clone()],
            };
            git(checkout_args).cwd(&source_dir).run().await?;
        }

        if self.spec.enable_lfs {
            git(["lfs", "pull"])
                .cwd(&source_dir)
                .run()
                .await
                .map_err(|source| FetchError::LfsPull { source })?;
        }

        if let Some(patches) = &self.spec.patches {
            for pattern in patches.iter() {
                apply_patches(pattern, &source_dir).await?;
            }
        }

        if source_dir != target_dir && !options.raw {
            if target_dir.exists() {
                let existing = target_dir.clone();
                blocking(move || rmtree(&existing).map_err(Into::into)).await?;
            }
            let (src, dst) = (source_dir.clone(), target_dir.clone());
            blocking(move || move_path(&src, &dst).map(|_| ()).map_err(Into::into)).await?;
        } else if source_dir != target_dir {
            blocking(move || rmtree(&source_dir).map_err(Into::into)).await?;
        }

        Ok(vec![target_dir])
    }
}

/// Make sure the bare cache repository for `url` holds the wanted ref and
/// return its path. Blobs in it are shared with every checkout of the same
/// url through alternates.
async fn ensure_cache_repo(
    url: &str,
    ref_token: &str,
    global_cache_dir: &Path,
    fetch_all: bool,
) -> Result<PathBuf, FetchError> {
    let repo_name = url
        .rsplit(['/', ':'])
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("repo");
    let repo_cache_dir = global_cache_dir.join(repo_name).join(hex_md5(url.as_bytes()));
    std::fs::create_dir_all(&repo_cache_dir)?;

    let need_fetch = if !habitat_git::is_bare_repo(&repo_cache_dir).await {
        git(["init", "--bare"])
            .arg(repo_cache_dir.display().to_string())
            .run()
            .await?;
        git(["config", "remote.origin.url", url])
            .cwd(&repo_cache_dir)
            .run()
            .await?;
        true
    } else if fetch_all {
        true
    } else {
        !git(["rev-parse", ref_token]).cwd(&repo_cache_dir).check().await
    };

    if need_fetch {
        debug!("update git cache in {}", repo_cache_dir.display());
        git(["fetch", "--force", "--progress", "--update-head-ok", "--"])
            .arg(url)
            .arg("+refs/heads/*:refs/remotes/origin/*")
            .cwd(&repo_cache_dir)
            .run()
            .await?;
    }
    Ok(repo_cache_dir)
}

/// Expand one patch glob and apply the matches in lexicographic order.
/// `git am` keeps authorship when an identity is configured; `git apply`
/// otherwise.
async fn apply_patches(pattern: &str, cwd: &Path) -> Result<(), FetchError> {
    let mut expanded: Vec<PathBuf> = glob::glob(pattern)
        .map_err(|e| FetchError::BadPatchPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?
        .flatten()
        .collect();
    expanded.sort();
    if expanded.is_empty() {
        warn!("patch pattern {pattern} matched nothing");
        return Ok(());
    }

    let subcommand = if habitat_git::is_git_user_set().await {
        "am"
    } else {
        "apply"
    };
    git([subcommand])
        .args(expanded.iter().map(|p| p.display().to_string()))
        .cwd(cwd)
        .run()
        .await
        .map_err(|e| match e {
            GitError::CommandFailed { stderr, .. } => FetchError::PatchFailed { output: stderr },
            other => other.into(),
        })
}
