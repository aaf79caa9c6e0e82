//! Solutions: top-level nodes that evaluate DEPS files, instantiate the
//! child graph, and own the entries cache.

use crate::component::{Component, SharedMaps};
use crate::{group, ResolveError};
use habitat_cache::EntriesCache;
use habitat_config::{ConfigError, Mappings};
use habitat_types::settings::DEFAULT_CONFIG_FILE_NAME;
use habitat_types::{DepSpec, KindSpec, SyncOptions};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// Load every solution declared by the root `.habitat` file.
///
/// With `enable_version_checking` a declared `habitat_version` that does not
/// match `current_version` is an error; otherwise it only warns.
pub async fn load_solutions(
    root_dir: &Path,
    current_version: &str,
    ignore_non_existing: bool,
    enable_version_checking: bool,
) -> Result<Vec<Arc<Component>>, ResolveError> {
    let solution_file = root_dir.join(DEFAULT_CONFIG_FILE_NAME);
    if !solution_file.exists() {
        if ignore_non_existing {
            return Ok(Vec::new());
        }
        return Err(ResolveError::MissingSolutionsFile(
            DEFAULT_CONFIG_FILE_NAME.to_string(),
            root_dir.to_path_buf(),
        ));
    }

    let file = habitat_config::load_solutions_file(&solution_file, root_dir)?;
    if let Err(e) = habitat_config::verify_version(file.habitat_version.as_deref(), current_version)
    {
        warn!("{e}");
        if enable_version_checking {
            return Err(e.into());
        }
        warn!("habitat compatible check is disabled");
    }

    let mut solutions = Vec::with_capacity(file.solutions.len());
    for entry in file.solutions {
        let target_dir = root_dir.join(&entry.name);
        let spec = DepSpec {
            kind: KindSpec::Solution(entry.spec),
            condition: true,
            require: Vec::new(),
            ignore_in_git: false,
            fetch_mode: None,
            disable_link: false,
        };
        spec.validate(&entry.name).map_err(ConfigError::InvalidSpec)?;
        solutions.push(Component::new(entry.name, target_dir, spec));
    }
    Ok(solutions)
}

/// Resolve a solution's dependency graph without fetching the solution
/// repository itself. The root directory is pre-claimed as a target so a
/// dependency cannot overwrite the host repo.
pub async fn fetch_deps_only(
    solution: Arc<Component>,
    root_dir: &Path,
    options: &SyncOptions,
    shared: &SharedMaps,
) -> Result<(), ResolveError> {
    shared.register_target(root_dir, solution.clone());
    solution.mark_fetched();
    load_deps_for(&solution, root_dir, options).await?;
    group::fetch_children(solution, root_dir, options, shared).await
}

/// Evaluate the solution's DEPS files for the requested targets,
/// instantiate children, and refresh the entries cache.
pub async fn load_deps_for(
    solution: &Arc<Component>,
    root_dir: &Path,
    options: &SyncOptions,
) -> Result<(), ResolveError> {
    let KindSpec::Solution(spec) = solution.spec.kind.clone() else {
        return Ok(());
    };

    let deps_file_path = solution.target_dir.join(&spec.deps_file);
    if !deps_file_path.exists() {
        warn!(
            "deps file {} not found, skip sync deps",
            deps_file_path.display()
        );
        return Ok(());
    }

    let targets: Vec<Option<String>> = if options.all {
        spec.targets
            .clone()
            .unwrap_or_default()
            .into_iter()
            .map(Some)
            .collect()
    } else {
        options.target_list()
    };

    // The loaded table is what children consult for up-to-date checks; the
    // rebuilt one below records what this run resolved.
    let loaded = habitat_cache::load_entries_cache(root_dir).await;
    solution.set_stamps(Arc::new(loaded.entries));

    let skip_base_deps = options.target_only && targets != vec![None];
    let mut deps_table = toml::Table::new();
    for target in &targets {
        if !skip_base_deps {
            deps_table = habitat_config::merge_deps(
                deps_table,
                habitat_config::eval_deps(&deps_file_path, target.as_deref(), root_dir)?,
            );
        }
        if let (Some(target), Some(files)) = (target, &spec.target_deps_files) {
            if let Some(file) = files.get(target) {
                let target_deps_path = solution.target_dir.join(file);
                deps_table = habitat_config::merge_deps(
                    deps_table,
                    habitat_config::eval_deps(&target_deps_path, Some(target), root_dir)?,
                );
            }
        }
    }

    let mappings = resolve_mappings(&spec.mapping_file, root_dir)?;
    let deps = habitat_config::deps_from_table(deps_table)?;
    for (name, mut dep_spec) in deps {
        if let Some(mappings) = &mappings {
            habitat_config::apply_mapping(&name, &mut dep_spec, mappings);
        }
        let target_dir = solution.target_dir.join(&name);
        let child = Component::new(name, target_dir, dep_spec);
        solution.add_child(child);
    }

    let mut entries = BTreeMap::new();
    for child in solution.children() {
        if child.spec.condition {
            entries.insert(child.name.clone(), child.source_stamp());
        }
    }
    habitat_cache::store_entries_cache(root_dir, &EntriesCache::new(entries)).await?;
    Ok(())
}

/// Mappings defined by the root `.habitat` file win over the solution's own
/// mapping file, which must exist when configured.
fn resolve_mappings(
    mapping_file: &Option<String>,
    root_dir: &Path,
) -> Result<Option<Mappings>, ResolveError> {
    let root_config = root_dir.join(DEFAULT_CONFIG_FILE_NAME);
    if let Some(mappings) = habitat_config::load_mapping_file(&root_config)? {
        return Ok(Some(mappings));
    }
    match mapping_file {
        None => Ok(None),
        Some(rel_path) => {
            let path = root_dir.join(rel_path);
            match habitat_config::load_mapping_file(&path)? {
                Some(mappings) => Ok(Some(mappings)),
                None => Err(ConfigError::MissingMappingFile {
                    path: path.display().to_string(),
                }
                .into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use habitat_types::RuntimeContext;
    use tempfile::TempDir;

    fn options() -> SyncOptions {
        SyncOptions {
            runtime: RuntimeContext {
                http_concurrency: 1,
                max_dependency_wait: std::time::Duration::from_secs(2),
            },
            ..Default::default()
        }
    }

    async fn init_repo(dir: &Path) {
        habitat_git::git(["init", "--initial-branch=master"])
            .arg(dir.display().to_string())
            .run()
            .await
            .unwrap();
        habitat_git::git(["config", "user.email", "t@example.com"])
            .cwd(dir)
            .run()
            .await
            .unwrap();
        habitat_git::git(["config", "user.name", "t"])
            .cwd(dir)
            .run()
            .await
            .unwrap();
    }

    async fn commit_all(dir: &Path) {
        habitat_git::git(["add", "."]).cwd(dir).run().await.unwrap();
        habitat_git::git(["commit", "-m", "test"])
            .cwd(dir)
            .run()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_load_solutions_reads_habitat_file() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join(".habitat"),
            r#"
            [[solutions]]
            name = "."
            url = "file:///repos/main/.git"
            branch = "master"
            "#,
        )
        .unwrap();
        let solutions = load_solutions(tmp.path(), "0.3.0", false, true).await.unwrap();
        assert_eq!(solutions.len(), 1);
        assert!(solutions[0].group.is_some());
        assert_eq!(solutions[0].target_dir, tmp.path().join("."));
    }

    #[tokio::test]
    async fn test_load_solutions_missing_file() {
        let tmp = TempDir::new().unwrap();
        assert!(load_solutions(tmp.path(), "0.3.0", true, true)
            .await
            .unwrap()
            .is_empty());
        assert!(matches!(
            load_solutions(tmp.path(), "0.3.0", false, true).await,
            Err(ResolveError::MissingSolutionsFile(..))
        ));
    }

    #[tokio::test]
    async fn test_load_solutions_version_gate() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join(".habitat"),
            r#"
            habitat_version = "9.9.9"

            [[solutions]]
            name = "."
            url = "file:///repos/main/.git"
            "#,
        )
        .unwrap();
        assert!(load_solutions(tmp.path(), "0.3.0", false, true).await.is_err());
        assert!(load_solutions(tmp.path(), "0.3.0", false, false).await.is_ok());
    }

    #[tokio::test]
    async fn test_load_deps_instantiates_children_and_stores_entries() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        init_repo(&root).await;
        std::fs::write(
            root.join("DEPS"),
            r#"
            [deps.lib]
            type = "git"
            url = "https://example.com/lib.git"
            branch = "main"

            [deps.disabled]
            type = "git"
            url = "https://example.com/disabled.git"
            branch = "main"
            condition = false
            "#,
        )
        .unwrap();
        commit_all(&root).await;

        let solution: DepSpec = toml::from_str(&format!(
            "type = \"solution\"\nurl = \"file://{}/.git\"\nbranch = \"master\"",
            root.display()
        ))
        .unwrap();
        let solution = Component::new(".", root.clone(), solution);
        load_deps_for(&solution, &root, &options()).await.unwrap();

        // Children keep the declaration order of the deps file.
        let children = solution.children();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].name, "lib");
        assert_eq!(children[1].name, "disabled");

        let cache = habitat_cache::load_entries_cache(&root).await;
        assert!(cache.entries.contains_key("lib"));
        assert!(!cache.entries.contains_key("disabled"));
        assert_eq!(
            cache.entries["lib"],
            "https://example.com/lib.git@main"
        );
    }
}
