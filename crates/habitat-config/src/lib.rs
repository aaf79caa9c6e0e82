//! Loading of `.habitat` solution files and `DEPS` files.
//!
//! Configuration is plain TOML prepared in two stages: literal `{target}` /
//! `{root_dir}` tokens are substituted into the raw text, then `condition`
//! fields (boolean literals or restricted `target == "x"` expressions) are
//! evaluated down to booleans. No user code is executed.

use habitat_types::{DepSpec, SolutionEntry, SpecError};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use toml::Value;
use tracing::warn;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("can not find {key} in file {path}")]
    MissingKey { path: String, key: &'static str },
    #[error("dependency {name} has an invalid configuration: {source}")]
    InvalidDependency {
        name: String,
        #[source]
        source: toml::de::Error,
    },
    #[error(transparent)]
    InvalidSpec(#[from] SpecError),
    #[error("unsupported condition expression {expr:?}, expected a boolean or `target == \"...\"`")]
    BadCondition { expr: String },
    #[error("expected mapping file in {path}")]
    MissingMappingFile { path: String },
    #[error("current version ({current}) is not compatible with the configuration ({declared})")]
    IncompatibleVersion { current: String, declared: String },
}

/// Attribute rewrites keyed by dependency type: `type -> attr -> old -> new`.
pub type Mappings = BTreeMap<String, BTreeMap<String, BTreeMap<String, String>>>;

/// The parsed top-level `.habitat` file.
#[derive(Debug, Clone, Deserialize)]
pub struct SolutionsFile {
    #[serde(default)]
    pub habitat_version: Option<String>,
    #[serde(default)]
    pub solutions: Vec<SolutionEntry>,
    #[serde(default)]
    pub mappings: Option<Mappings>,
}

/// Substitute `{target}` and `{root_dir}` literally, before parsing.
///
/// A missing target renders as the empty string.
pub fn render_template(content: &str, target: Option<&str>, root_dir: &str) -> String {
    content
        .replace("{target}", target.unwrap_or(""))
        .replace("{root_dir}", root_dir)
}

/// Load and parse the `.habitat` solutions file.
pub fn load_solutions_file(path: &Path, root_dir: &Path) -> Result<SolutionsFile, ConfigError> {
    let content = read(path)?;
    let rendered = render_template(&content, None, &root_dir.to_string_lossy());
    let file: SolutionsFile = toml::from_str(&rendered).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    if file.solutions.is_empty() {
        return Err(ConfigError::MissingKey {
            path: path.display().to_string(),
            key: "solutions",
        });
    }
    Ok(file)
}

/// Compare a declared `habitat_version` against the running binary's.
pub fn verify_version(declared: Option<&str>, current: &str) -> Result<(), ConfigError> {
    match declared {
        Some(v) if v != current => Err(ConfigError::IncompatibleVersion {
            current: current.to_string(),
            declared: v.to_string(),
        }),
        _ => Ok(()),
    }
}

/// Evaluate a `DEPS` file for one target: template, parse, and normalize
/// every `condition` to a boolean. Returns the raw `deps` table, ready for
/// merging.
pub fn eval_deps(
    path: &Path,
    target: Option<&str>,
    root_dir: &Path,
) -> Result<toml::Table, ConfigError> {
    let content = read(path)?;
    let rendered = render_template(&content, target, &root_dir.to_string_lossy());
    let doc: toml::Table = rendered.parse().map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    let mut deps = match doc.get("deps") {
        Some(Value::Table(t)) => t.clone(),
        _ => {
            return Err(ConfigError::MissingKey {
                path: path.display().to_string(),
                key: "deps",
            })
        }
    };
    for (_, config) in deps.iter_mut() {
        if let Value::Table(table) = config {
            if let Some(raw) = table.get("condition").cloned() {
                table.insert("condition".into(), Value::Boolean(eval_condition(&raw, target)?));
            }
        }
    }
    Ok(deps)
}

/// Evaluate a condition value against the current target.
fn eval_condition(value: &Value, target: Option<&str>) -> Result<bool, ConfigError> {
    match value {
        Value::Boolean(b) => Ok(*b),
        Value::String(expr) => {
            let (negated, rest) = if let Some(rest) = split_once_trim(expr, "!=") {
                (true, rest)
            } else if let Some(rest) = split_once_trim(expr, "==") {
                (false, rest)
            } else {
                return Err(ConfigError::BadCondition { expr: expr.clone() });
            };
            let (lhs, rhs) = rest;
            if lhs != "target" {
                return Err(ConfigError::BadCondition { expr: expr.clone() });
            }
            let expected = rhs.trim_matches('"').trim_matches('\'');
            let holds = target == Some(expected);
            Ok(holds != negated)
        }
        _ => Err(ConfigError::BadCondition {
            expr: value.to_string(),
        }),
    }
}

fn split_once_trim<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    expr.split_once(op).map(|(l, r)| (l.trim(), r.trim()))
}

/// Merge two evaluated deps tables. Per dependency, `condition` fields
/// OR-combine and every other field takes the right-hand value where
/// present.
pub fn merge_deps(base: toml::Table, new: toml::Table) -> toml::Table {
    if base.is_empty() {
        return new;
    }
    if new.is_empty() {
        return base;
    }
    let mut merged = toml::Table::new();
    let keys: Vec<String> = base.keys().chain(new.keys()).cloned().collect();
    for key in keys {
        if merged.contains_key(&key) {
            continue;
        }
        let value = match (base.get(&key), new.get(&key)) {
            (Some(Value::Table(b)), Some(Value::Table(n))) => {
                Value::Table(merge_dep_entry(b, n))
            }
            (_, Some(n)) => n.clone(),
            (Some(b), None) => b.clone(),
            (None, None) => unreachable!(),
        };
        merged.insert(key, value);
    }
    merged
}

fn merge_dep_entry(base: &toml::Table, new: &toml::Table) -> toml::Table {
    let mut merged = toml::Table::new();
    let keys: Vec<String> = base.keys().chain(new.keys()).cloned().collect();
    for key in keys {
        if merged.contains_key(&key) {
            continue;
        }
        if key == "condition" {
            if let Some(value) = merge_condition(base.get(&key), new.get(&key)) {
                merged.insert(key, value);
            }
            continue;
        }
        let value = match (base.get(&key), new.get(&key)) {
            (_, Some(n)) => n.clone(),
            (Some(b), None) => b.clone(),
            (None, None) => unreachable!(),
        };
        merged.insert(key, value);
    }
    merged
}

fn merge_condition(base: Option<&Value>, new: Option<&Value>) -> Option<Value> {
    match (base, new) {
        (Some(b), _) if matches!(b, Value::Boolean(true)) => Some(b.clone()),
        (_, Some(n)) => Some(n.clone()),
        _ => None,
    }
}

/// Deserialize a merged deps table into validated specs, keeping the
/// declaration order of the file; that order decides which of two
/// same-source nodes fetches first.
pub fn deps_from_table(table: toml::Table) -> Result<Vec<(String, DepSpec)>, ConfigError> {
    let mut deps = Vec::with_capacity(table.len());
    for (name, value) in table {
        let spec: DepSpec = value
            .try_into()
            .map_err(|source| ConfigError::InvalidDependency {
                name: name.clone(),
                source,
            })?;
        spec.validate(&name)?;
        deps.push((name, spec));
    }
    Ok(deps)
}

/// Load the `mappings` table of a standalone mapping file, if the file
/// exists.
pub fn load_mapping_file(path: &Path) -> Result<Option<Mappings>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = read(path)?;
    #[derive(Deserialize)]
    struct MappingFile {
        #[serde(default)]
        mappings: Option<Mappings>,
    }
    let file: MappingFile = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    Ok(file.mappings)
}

/// Rewrite a spec's attributes according to the mappings for its type.
pub fn apply_mapping(name: &str, spec: &mut DepSpec, mappings: &Mappings) {
    let Some(by_attr) = mappings.get(spec.kind.type_name()) else {
        return;
    };
    for (attr, table) in by_attr {
        let Some(original) = get_attr(spec, attr) else {
            continue;
        };
        if let Some(replacement) = table.get(&original) {
            tracing::info!("replace ({name})'s [{attr}] {original} with {replacement}");
            set_attr(spec, attr, replacement.clone());
        }
    }
}

fn get_attr(spec: &DepSpec, attr: &str) -> Option<String> {
    use habitat_types::KindSpec::*;
    match (&spec.kind, attr) {
        (Git(g), "url") => Some(g.url.clone()),
        (Git(g), "branch") => g.branch.clone(),
        (Git(g), "commit") => g.commit.clone(),
        (Git(g), "tag") => g.tag.clone(),
        (Http(h), "url") => Some(h.url.clone()),
        (Solution(s), "url") => Some(s.url.clone()),
        (Solution(s), "branch") => s.branch.clone(),
        (Solution(s), "commit") => s.commit.clone(),
        _ => {
            warn!(
                "no mappable attribute {attr} on a {} dependency",
                spec.kind.type_name()
            );
            None
        }
    }
}

fn set_attr(spec: &mut DepSpec, attr: &str, value: String) {
    use habitat_types::KindSpec::*;
    match (&mut spec.kind, attr) {
        (Git(g), "url") => g.url = value,
        (Git(g), "branch") => g.branch = Some(value),
        (Git(g), "commit") => g.commit = Some(value),
        (Git(g), "tag") => g.tag = Some(value),
        (Http(h), "url") => h.url = value,
        (Solution(s), "url") => s.url = value,
        (Solution(s), "branch") => s.branch = Some(value),
        (Solution(s), "commit") => s.commit = Some(value),
        _ => {}
    }
}

fn read(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_render_template() {
        let rendered = render_template("url = \"file://{root_dir}/x\"", Some("android"), "/tmp/r");
        assert_eq!(rendered, "url = \"file:///tmp/r/x\"");
        let rendered = render_template("t = \"{target}\"", None, "/");
        assert_eq!(rendered, "t = \"\"");
    }

    #[test]
    fn test_eval_deps_normalizes_conditions() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "DEPS",
            r#"
            [deps.base]
            type = "git"
            url = "https://example.com/base.git"
            branch = "main"

            [deps.android-only]
            type = "git"
            url = "https://example.com/android.git"
            branch = "main"
            condition = 'target == "android"'
            "#,
        );
        let deps = eval_deps(&path, Some("android"), dir.path()).unwrap();
        assert_eq!(
            deps["android-only"]["condition"],
            Value::Boolean(true)
        );
        let deps = eval_deps(&path, Some("ios"), dir.path()).unwrap();
        assert_eq!(
            deps["android-only"]["condition"],
            Value::Boolean(false)
        );
        assert!(deps["base"].get("condition").is_none());
    }

    #[test]
    fn test_eval_deps_rejects_unknown_expression() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "DEPS",
            r#"
            [deps.a]
            type = "git"
            url = "https://example.com/a.git"
            condition = "os == linux"
            "#,
        );
        assert!(matches!(
            eval_deps(&path, None, dir.path()),
            Err(ConfigError::BadCondition { .. })
        ));
    }

    #[test]
    fn test_merge_rhs_wins_except_condition() {
        let base: toml::Table = r#"
            [lib]
            type = "git"
            url = "https://example.com/a.git"
            branch = "main"
            condition = false
        "#
        .parse()
        .unwrap();
        let new: toml::Table = r#"
            [lib]
            type = "git"
            url = "https://example.com/a.git"
            branch = "release"
            condition = true
        "#
        .parse()
        .unwrap();
        let merged = merge_deps(base, new);
        let lib = merged["lib"].as_table().unwrap();
        assert_eq!(lib["branch"], Value::String("release".into()));
        assert_eq!(lib["condition"], Value::Boolean(true));
    }

    #[test]
    fn test_merge_condition_or_combines() {
        let base: toml::Table = "[a]\ncondition = true".parse().unwrap();
        let new: toml::Table = "[a]\ncondition = false".parse().unwrap();
        let merged = merge_deps(base, new);
        assert_eq!(merged["a"]["condition"], Value::Boolean(true));
    }

    #[test]
    fn test_merge_keeps_disjoint_entries() {
        let base: toml::Table = "[a]\ntype = \"git\"".parse().unwrap();
        let new: toml::Table = "[b]\ntype = \"git\"".parse().unwrap();
        let merged = merge_deps(base, new);
        assert!(merged.contains_key("a"));
        assert!(merged.contains_key("b"));
    }

    #[test]
    fn test_deps_from_table_preserves_order_and_validates() {
        let table: toml::Table = r#"
            [zlib]
            type = "git"
            url = "https://example.com/zlib.git"
            [abc]
            type = "http"
            url = "https://example.com/abc.zip"
        "#
        .parse()
        .unwrap();
        let deps = deps_from_table(table).unwrap();
        let names: Vec<&str> = deps.iter().map(|(n, _)| n.as_str()).collect();
        // Declaration order, not alphabetical.
        assert_eq!(names, vec!["zlib", "abc"]);

        let bad: toml::Table = r#"
            [broken]
            type = "git"
            url = "not-a-url"
        "#
        .parse()
        .unwrap();
        assert!(deps_from_table(bad).is_err());
    }

    #[test]
    fn test_load_solutions_file() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            ".habitat",
            r#"
            habitat_version = "0.3.0"

            [[solutions]]
            name = "."
            url = "file://{root_dir}/main/.git"
            branch = "master"
            "#,
        );
        let file = load_solutions_file(&path, dir.path()).unwrap();
        assert_eq!(file.solutions.len(), 1);
        assert_eq!(file.solutions[0].name, ".");
        assert!(file.solutions[0]
            .spec
            .url
            .starts_with(&format!("file://{}", dir.path().display())));
        assert_eq!(file.solutions[0].spec.deps_file, "DEPS");
    }

    #[test]
    fn test_verify_version() {
        assert!(verify_version(None, "0.3.0").is_ok());
        assert!(verify_version(Some("0.3.0"), "0.3.0").is_ok());
        assert!(verify_version(Some("0.2.9"), "0.3.0").is_err());
    }

    #[test]
    fn test_apply_mapping_rewrites_url() {
        let spec: DepSpec = toml::from_str(
            r#"
            type = "git"
            url = "https://old.example.com/repo.git"
            branch = "main"
            "#,
        )
        .unwrap();
        let mut spec = spec;
        let mappings: Mappings = toml::from_str(
            r#"
            [git.url]
            "https://old.example.com/repo.git" = "https://mirror.example.com/repo.git"
            "#,
        )
        .unwrap();
        apply_mapping("repo", &mut spec, &mappings);
        match &spec.kind {
            habitat_types::KindSpec::Git(g) => {
                assert_eq!(g.url, "https://mirror.example.com/repo.git")
            }
            _ => panic!("expected git spec"),
        }
    }
}
