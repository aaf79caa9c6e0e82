//! Command implementations behind the CLI surface.

use crate::storage::KeyValueStorage;
use crate::VERSION;
use habitat_config::ConfigError;
use habitat_fs::normalize_path;
use habitat_resolver::{
    fetch_component, fetch_deps_only, load_deps_for, load_solutions, Component, ResolveError,
    SharedMaps,
};
use habitat_types::{is_git_url, settings, SyncOptions};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Git(#[from] habitat_git::GitError),
    #[error(transparent)]
    Cache(#[from] habitat_cache::CacheError),
    #[error("{0}")]
    Usage(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub fn is_version_mismatch(&self) -> bool {
        matches!(
            self,
            CliError::Config(ConfigError::IncompatibleVersion { .. })
                | CliError::Resolve(ResolveError::Config(ConfigError::IncompatibleVersion { .. }))
        )
    }
}

/// The explicit root, or the top of the enclosing git repository.
async fn resolve_root(root: Option<PathBuf>) -> Result<PathBuf, CliError> {
    let cwd = std::env::current_dir()?;
    match root {
        Some(root) => {
            let absolute = if root.is_absolute() { root } else { cwd.join(root) };
            Ok(normalize_path(&absolute))
        }
        None => Ok(habitat_git::git_root_dir(&cwd).await?),
    }
}

pub async fn sync(root: Option<PathBuf>, options: SyncOptions) -> Result<(), CliError> {
    let root_dir = resolve_root(root).await?;
    let solutions = load_solutions(
        &root_dir,
        VERSION,
        options.compatible,
        settings::compatible_check_enabled(),
    )
    .await?;

    for solution in solutions {
        let shared = SharedMaps::new();
        if options.main {
            fetch_component(solution.clone(), root_dir.clone(), options.clone(), shared).await?;
        } else {
            fetch_deps_only(solution.clone(), &root_dir, &options, &shared).await?;
        }

        if !options.disable_ignore {
            for dep in solution.walk() {
                if !dep.spec.condition || !dep.spec.ignore_in_git {
                    continue;
                }
                let Some(parent) = dep.parent() else { continue };
                if let Err(e) =
                    habitat_git::ignore_paths(&parent.target_dir, &[dep.target_dir.clone()]).await
                {
                    warn!("failed to ignore {} in git: {e}", dep.target_dir.display());
                }
            }
        }

        debug!("dependency tree:\n{}", solution.pretty_tree());
    }
    Ok(())
}

pub struct DepsOptions {
    pub raw: bool,
    pub source_stamp: bool,
    pub format: Option<String>,
    pub target: Option<String>,
    pub type_filter: Option<String>,
    pub name_filter: Option<String>,
    pub ignore_condition: bool,
}

pub async fn deps(root: Option<PathBuf>, opts: DepsOptions) -> Result<(), CliError> {
    let root_dir = resolve_root(root).await?;
    let solutions = load_solutions(
        &root_dir,
        VERSION,
        false,
        settings::compatible_check_enabled(),
    )
    .await?;

    let load_options = SyncOptions {
        target: opts.target.clone(),
        ..Default::default()
    };

    for solution in solutions {
        load_deps_for(&solution, &root_dir, &load_options).await?;

        let deps: Vec<Arc<Component>> = solution
            .walk()
            .into_iter()
            .filter(|dep| {
                opts.name_filter
                    .as_ref()
                    .map(|name| &dep.name == name)
                    .unwrap_or(true)
            })
            .filter(|dep| {
                opts.type_filter
                    .as_ref()
                    .map(|t| dep.spec.kind.type_name() == t)
                    .unwrap_or(true)
            })
            .filter(|dep| opts.ignore_condition || dep.spec.condition)
            .collect();

        if opts.raw {
            for dep in &deps {
                println!("{dep}");
            }
        } else if opts.source_stamp {
            for dep in &deps {
                println!("{}", dep.source_stamp());
            }
        } else if let Some(format) = &opts.format {
            for dep in &deps {
                println!("{}", format_partial(format, dep));
            }
        } else {
            println!("Dependency tree:\n{}", solution.pretty_tree());
        }
    }
    Ok(())
}

/// Substitute `{attr}` placeholders from the component's attributes,
/// rendering missing ones as `~`.
fn format_partial(format: &str, component: &Component) -> String {
    let attributes = component.attributes();
    let pattern = regex::Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static pattern");
    pattern
        .replace_all(format, |caps: &regex::Captures<'_>| {
            attributes
                .get(&caps[1])
                .cloned()
                .unwrap_or_else(|| "~".to_string())
        })
        .to_string()
}

pub async fn clean(
    root: Option<PathBuf>,
    all: bool,
    deps_cache: bool,
    global_cache: bool,
) -> Result<(), CliError> {
    let cwd = std::env::current_dir()?;
    let root_dir = match root {
        Some(root) => normalize_path(&cwd.join(root)),
        None => match habitat_git::git_root_dir(&cwd).await {
            Ok(dir) => dir,
            Err(_) => cwd,
        },
    };

    habitat_fs::clean_temp_dirs(&root_dir);

    if deps_cache || all {
        if !habitat_cache::clean_entries_cache(&root_dir).await? {
            warn!("no deps cache found");
        }
    }

    if global_cache || all {
        let cache_dir = settings::default_cache_dir();
        for subdir in ["git", "objects"] {
            habitat_fs::rmtree(&cache_dir.join(subdir)).map_err(ResolveError::Fs)?;
        }
    }
    Ok(())
}

pub fn config(
    url: &str,
    dir: PathBuf,
    name: &str,
    branch: Option<String>,
) -> Result<(), CliError> {
    if !is_git_url(url) {
        return Err(CliError::Usage(format!("{url} is not a recognized repository url")));
    }
    let config_path = dir.join(settings::DEFAULT_CONFIG_FILE_NAME);
    if config_path.exists() {
        return Err(CliError::Usage(format!(
            "config file exists in {}",
            dir.display()
        )));
    }
    std::fs::create_dir_all(&dir)?;

    let mut solution = toml::Table::new();
    solution.insert("name".into(), toml::Value::String(name.to_string()));
    solution.insert("deps_file".into(), toml::Value::String("DEPS".to_string()));
    solution.insert("url".into(), toml::Value::String(url.to_string()));
    if let Some(branch) = branch {
        solution.insert("branch".into(), toml::Value::String(branch));
    }
    let mut document = toml::Table::new();
    document.insert(
        "solutions".into(),
        toml::Value::Array(vec![toml::Value::Table(solution)]),
    );

    tracing::info!("write new configuration to {}", config_path.display());
    let rendered = toml::to_string_pretty(&document)
        .map_err(|e| CliError::Usage(format!("failed to render configuration: {e}")))?;
    std::fs::write(&config_path, rendered)?;
    Ok(())
}

pub fn setup(configs: Option<&str>, list: bool) -> Result<(), CliError> {
    let mut storage = KeyValueStorage::open(settings::user_config_storage_path())?;

    if list {
        println!("Current configs:");
        for (key, value) in storage.iter() {
            // Environment overrides win over stored values.
            let effective = storage.get(key).unwrap_or_else(|| value.clone());
            println!("  {key}: {effective}");
        }
        return Ok(());
    }

    let Some(configs) = configs else {
        return Err(CliError::Usage(
            "expected configurations in the format of \"aaa=bbb,ccc=ddd\"".to_string(),
        ));
    };
    let pattern = regex::Regex::new(r"^(\S+)=(.*)$").expect("static pattern");
    for expr in configs.split(',') {
        let Some(caps) = pattern.captures(expr.trim()) else {
            return Err(CliError::Usage(format!("invalid expression {expr}")));
        };
        storage.set(caps[1].to_string(), caps[2].to_string())?;
    }
    Ok(())
}
