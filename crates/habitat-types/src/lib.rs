//! Core types for habitat.
//!
//! This crate defines the configuration model shared by the resolver and the
//! fetchers: the per-kind dependency specs, source stamps, and the options
//! that flow from the CLI into every fetch operation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

pub mod settings;

#[derive(Error, Debug)]
pub enum SpecError {
    #[error("field {field} is required for dependency {name}")]
    MissingField { name: String, field: &'static str },
    #[error("invalid value {value:?} for field {field} in dependency {name}: {reason}")]
    InvalidValue {
        name: String,
        field: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// A dependency configuration, tagged by `type`.
///
/// This is the deserialized form of one entry of a `DEPS` table after target
/// merging; `condition` expressions have already been evaluated down to a
/// plain boolean by that point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepSpec {
    #[serde(flatten)]
    pub kind: KindSpec,
    #[serde(default = "default_true")]
    pub condition: bool,
    #[serde(default)]
    pub require: Vec<String>,
    #[serde(default)]
    pub ignore_in_git: bool,
    #[serde(default)]
    pub fetch_mode: Option<FetchMode>,
    #[serde(default)]
    pub disable_link: bool,
}

fn default_true() -> bool {
    true
}

/// Kind-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum KindSpec {
    Git(GitSpec),
    Http(HttpSpec),
    Action(ActionSpec),
    Solution(SolutionSpec),
    /// Anything this binary does not recognize; kept so newer configs
    /// degrade to a warning instead of a parse failure.
    #[serde(other)]
    Unknown,
}

/// A git dependency: a working tree checked out at an exact ref.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitSpec {
    pub url: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub enable_lfs: bool,
    #[serde(default)]
    pub patches: Option<Patches>,
    /// Sparse-checkout paths; absent means the full tree.
    #[serde(default)]
    pub paths: Option<Vec<String>>,
}

/// One patch path/glob or an ordered list of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Patches {
    One(String),
    Many(Vec<String>),
}

impl Patches {
    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        match self {
            Patches::One(p) => std::slice::from_ref(p).iter(),
            Patches::Many(ps) => ps.iter(),
        }
    }
}

/// An http dependency: a downloaded artifact, optionally decompressed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSpec {
    pub url: String,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default = "default_true")]
    pub decompress: bool,
    #[serde(default)]
    pub paths: Vec<String>,
}

/// An action dependency: a command sequence run in place of a fetch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionSpec {
    #[serde(default)]
    pub commands: Vec<CommandSpec>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// A single string runs through the shell; a list is spawned as argv.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandSpec {
    Shell(String),
    Argv(Vec<String>),
}

/// A solution: a git repository carrying its own deps file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolutionSpec {
    pub url: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default = "default_deps_file")]
    pub deps_file: String,
    #[serde(default)]
    pub targets: Option<Vec<String>>,
    #[serde(default)]
    pub target_deps_files: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub mapping_file: Option<String>,
}

fn default_deps_file() -> String {
    "DEPS".to_string()
}

/// A named solution entry from the top-level `.habitat` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolutionEntry {
    /// Directory of the solution, relative to the root.
    pub name: String,
    #[serde(flatten)]
    pub spec: SolutionSpec,
}

/// Overrides the default shallow-for-leaf fetch behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    /// Fetch all heads with full history.
    #[serde(alias = "full")]
    All,
    /// Fetch only the pinned ref at depth 1.
    Shallow,
}

impl KindSpec {
    pub fn type_name(&self) -> &'static str {
        match self {
            KindSpec::Git(_) => "git",
            KindSpec::Http(_) => "http",
            KindSpec::Action(_) => "action",
            KindSpec::Solution(_) => "solution",
            KindSpec::Unknown => "unknown",
        }
    }

    /// Identity of the upstream content, independent of the pinned ref.
    ///
    /// Two nodes share a source iff these strings are byte-equal.
    pub fn source(&self) -> String {
        match self {
            KindSpec::Git(g) => g.url.clone(),
            KindSpec::Http(h) => h.url.clone(),
            KindSpec::Solution(s) => s.url.clone(),
            KindSpec::Action(_) | KindSpec::Unknown => String::new(),
        }
    }

    /// Canonical `source@ref+ref` string pinning the node's exact content.
    pub fn source_stamp(&self) -> String {
        let refs: Vec<&str> = match self {
            KindSpec::Git(g) => [g.branch.as_deref(), g.commit.as_deref(), g.tag.as_deref()]
                .into_iter()
                .flatten()
                .collect(),
            KindSpec::Solution(s) => [s.branch.as_deref(), s.commit.as_deref()]
                .into_iter()
                .flatten()
                .collect(),
            KindSpec::Http(h) => vec![h.url.as_str()],
            // Actions have no upstream content and are never cached.
            KindSpec::Action(_) => return "(action)".to_string(),
            KindSpec::Unknown => return "(unknown)".to_string(),
        };
        format!("{}@{}", self.source(), refs.join("+"))
    }

    /// The paths subset this node materializes, when restricted.
    pub fn paths(&self) -> Option<&[String]> {
        match self {
            KindSpec::Git(g) => g.paths.as_deref(),
            KindSpec::Http(h) => {
                if h.paths.is_empty() {
                    None
                } else {
                    Some(&h.paths)
                }
            }
            _ => None,
        }
    }

    /// The pinned commit, when one is configured.
    pub fn commit(&self) -> Option<&str> {
        match self {
            KindSpec::Git(g) => g.commit.as_deref(),
            KindSpec::Solution(s) => s.commit.as_deref(),
            _ => None,
        }
    }
}

impl DepSpec {
    pub fn validate(&self, name: &str) -> Result<(), SpecError> {
        match &self.kind {
            KindSpec::Git(g) => {
                if !is_git_url(&g.url) {
                    return Err(SpecError::InvalidValue {
                        name: name.to_string(),
                        field: "url",
                        value: g.url.clone(),
                        reason: "not a recognized git url",
                    });
                }
                if let Some(commit) = &g.commit {
                    if !is_git_sha(commit) {
                        return Err(SpecError::InvalidValue {
                            name: name.to_string(),
                            field: "commit",
                            value: commit.clone(),
                            reason: "not a hex-encoded sha",
                        });
                    }
                }
            }
            KindSpec::Http(h) => {
                if !is_http_url(&h.url) {
                    return Err(SpecError::InvalidValue {
                        name: name.to_string(),
                        field: "url",
                        value: h.url.clone(),
                        reason: "not an http(s) url",
                    });
                }
            }
            KindSpec::Solution(s) => {
                if !is_git_url(&s.url) {
                    return Err(SpecError::InvalidValue {
                        name: name.to_string(),
                        field: "url",
                        value: s.url.clone(),
                        reason: "not a recognized repository url",
                    });
                }
            }
            KindSpec::Action(_) | KindSpec::Unknown => {}
        }
        Ok(())
    }
}

/// Options for one `sync` run, assembled once at program entry and passed
/// down to every fetcher.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub force: bool,
    pub clean: bool,
    pub no_history: bool,
    pub raw: bool,
    pub target: Option<String>,
    pub target_only: bool,
    pub all: bool,
    pub main: bool,
    pub git_auth: Option<String>,
    pub disable_cache: bool,
    pub cache_dir: PathBuf,
    pub strict: bool,
    pub disable_ignore: bool,
    pub compatible: bool,
    pub runtime: RuntimeContext,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            force: false,
            clean: false,
            no_history: false,
            raw: false,
            target: None,
            target_only: false,
            all: false,
            main: false,
            git_auth: None,
            disable_cache: false,
            cache_dir: settings::default_cache_dir(),
            strict: false,
            disable_ignore: false,
            compatible: false,
            runtime: RuntimeContext::from_env(),
        }
    }
}

impl SyncOptions {
    /// The comma-separated `--target` list, or `[None]` when unset.
    pub fn target_list(&self) -> Vec<Option<String>> {
        match &self.target {
            Some(t) => t.split(',').map(|s| Some(s.trim().to_string())).collect(),
            None => vec![None],
        }
    }
}

/// Process-scoped limits, read once from the environment.
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    /// Cap on concurrent HTTP requests across the whole process.
    pub http_concurrency: usize,
    /// Bound on a `require` wait before giving up.
    pub max_dependency_wait: std::time::Duration,
}

impl RuntimeContext {
    pub fn from_env() -> Self {
        Self {
            http_concurrency: settings::http_concurrency(),
            max_dependency_wait: settings::max_dependency_wait(),
        }
    }
}

pub fn is_git_url(url: &str) -> bool {
    url.starts_with("git@")
        || url.starts_with("ssh://")
        || url.starts_with("https://")
        || url.starts_with("http://")
        || url.starts_with("file://")
}

pub fn is_http_url(url: &str) -> bool {
    url.starts_with("https://") || url.starts_with("http://")
}

/// True for a valid hex-encoded sha, full or abbreviated.
pub fn is_git_sha(revision: &str) -> bool {
    (6..=40).contains(&revision.len()) && revision.chars().all(|c| c.is_ascii_hexdigit())
}

/// True only for a full 40-hex pin; anything shorter cannot be trusted to
/// identify content across runs.
pub fn is_full_git_sha(revision: &str) -> bool {
    revision.len() == 40 && revision.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> DepSpec {
        toml::from_str(s).unwrap()
    }

    #[test]
    fn test_git_spec_source_stamp() {
        let spec = parse(
            r#"
            type = "git"
            url = "https://example.com/repo.git"
            branch = "main"
            "#,
        );
        assert_eq!(spec.kind.source(), "https://example.com/repo.git");
        assert_eq!(spec.kind.source_stamp(), "https://example.com/repo.git@main");
        assert!(spec.condition);
        assert!(!spec.disable_link);
    }

    #[test]
    fn test_stamp_joins_present_refs() {
        let spec = parse(
            r#"
            type = "git"
            url = "https://example.com/repo.git"
            branch = "main"
            commit = "e0caee08e5f09b374a27a676d04978c81fcb1928"
            "#,
        );
        assert_eq!(
            spec.kind.source_stamp(),
            "https://example.com/repo.git@main+e0caee08e5f09b374a27a676d04978c81fcb1928"
        );
    }

    #[test]
    fn test_action_stamp_is_constant() {
        let spec = parse(
            r#"
            type = "action"
            commands = ["ls -al"]
            "#,
        );
        assert_eq!(spec.kind.source_stamp(), "(action)");
        assert_eq!(spec.kind.source(), "");
    }

    #[test]
    fn test_http_stamp_uses_url() {
        let spec = parse(
            r#"
            type = "http"
            url = "https://example.com/binary.zip"
            "#,
        );
        assert_eq!(
            spec.kind.source_stamp(),
            "https://example.com/binary.zip@https://example.com/binary.zip"
        );
        if let KindSpec::Http(h) = &spec.kind {
            assert!(h.decompress);
        } else {
            panic!("expected http spec");
        }
    }

    #[test]
    fn test_unrecognized_type_degrades_to_unknown() {
        let spec = parse(
            r#"
            type = "svn"
            url = "svn://example.com/repo"
            "#,
        );
        assert!(matches!(spec.kind, KindSpec::Unknown));
        assert_eq!(spec.kind.source_stamp(), "(unknown)");
    }

    #[test]
    fn test_command_spec_shell_or_argv() {
        let spec = parse(
            r#"
            type = "action"
            commands = ["echo hi", ["git", "status"]]
            "#,
        );
        if let KindSpec::Action(a) = &spec.kind {
            assert!(matches!(a.commands[0], CommandSpec::Shell(_)));
            assert!(matches!(a.commands[1], CommandSpec::Argv(_)));
        } else {
            panic!("expected action spec");
        }
    }

    #[test]
    fn test_validate_rejects_bad_commit() {
        let spec = parse(
            r#"
            type = "git"
            url = "https://example.com/repo.git"
            commit = "not-a-sha"
            "#,
        );
        assert!(spec.validate("dep").is_err());
    }

    #[test]
    fn test_fetch_mode_aliases() {
        let spec = parse(
            r#"
            type = "git"
            url = "https://example.com/repo.git"
            fetch_mode = "all"
            "#,
        );
        assert_eq!(spec.fetch_mode, Some(FetchMode::All));
        let spec = parse(
            r#"
            type = "git"
            url = "https://example.com/repo.git"
            fetch_mode = "full"
            "#,
        );
        assert_eq!(spec.fetch_mode, Some(FetchMode::All));
    }

    #[test]
    fn test_sha_validators() {
        assert!(is_git_sha("e0caee0"));
        assert!(!is_git_sha("e0ca"));
        assert!(!is_git_sha("not-hex"));
        assert!(is_full_git_sha("e0caee08e5f09b374a27a676d04978c81fcb1928"));
        assert!(!is_full_git_sha("e0caee0"));
    }

    #[test]
    fn test_target_list() {
        let options = SyncOptions {
            target: Some("android,ios".to_string()),
            ..Default::default()
        };
        assert_eq!(
            options.target_list(),
            vec![Some("android".to_string()), Some("ios".to_string())]
        );
        assert_eq!(SyncOptions::default().target_list(), vec![None]);
    }
}
