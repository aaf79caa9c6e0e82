//! habitat - a source and binary dependency manager for monorepo codebases.

use clap::{Parser, Subcommand};
use habitat_types::{settings, RuntimeContext, SyncOptions};
use miette::IntoDiagnostic;
use std::path::PathBuf;
use std::process::ExitCode;

mod commands;
mod storage;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const EXIT_INCOMPATIBLE_VERSION: u8 = 3;

#[derive(Parser)]
#[command(name = "hab")]
#[command(version, about = "Sync dependencies of a monorepo codebase", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Show more detail in output (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync dependencies
    Sync {
        /// Source root of the codebase, default to the root of the current
        /// git repository
        root: Option<PathBuf>,
        /// Sync the main repository along with dependencies
        #[arg(long)]
        main: bool,
        /// Targets to fetch dependencies for, comma separated; visible to
        /// deps files as {target}
        #[arg(long)]
        target: Option<String>,
        /// Sync target dependencies only
        #[arg(long)]
        target_only: bool,
        /// Sync dependencies for all of the solution's targets
        #[arg(short, long)]
        all: bool,
        /// Sync git dependencies without history
        #[arg(long)]
        no_history: bool,
        /// Only check out the source tree, without keeping the git repository
        #[arg(long)]
        raw: bool,
        /// Force overriding existing files
        #[arg(short, long)]
        force: bool,
        /// Force cleaning existing directories
        #[arg(long)]
        clean: bool,
        /// user:token credentials; ssh urls are rewritten to authenticated
        /// http
        #[arg(long)]
        git_auth: Option<String>,
        /// Do not use the global cache
        #[arg(long)]
        disable_cache: bool,
        /// Global cache directory
        #[arg(long)]
        cache_dir: Option<PathBuf>,
        /// Stop on dependency conflicts instead of resolving them
        #[arg(long)]
        strict: bool,
        /// Do not add dependency directories to the repository's git excludes
        #[arg(long)]
        disable_ignore: bool,
        /// Do not fail when no configuration file is found
        #[arg(long)]
        compatible: bool,
    },

    /// List dependencies
    Deps {
        /// Source root of the codebase
        root: Option<PathBuf>,
        /// Print raw dependency info
        #[arg(short, long)]
        raw: bool,
        /// Print only source stamps
        #[arg(long)]
        source_stamp: bool,
        /// Format string; {attr} placeholders are substituted, missing
        /// attributes print as ~
        #[arg(long)]
        format: Option<String>,
        /// Target to list dependencies for
        #[arg(long)]
        target: Option<String>,
        /// Filter by dependency type
        #[arg(long = "type")]
        type_filter: Option<String>,
        /// Filter by dependency name
        #[arg(long = "name")]
        name_filter: Option<String>,
        /// List dependencies regardless of their condition
        #[arg(long)]
        ignore_condition: bool,
    },

    /// Clean cache files or downloaded dependencies
    Clean {
        /// Source root of the codebase
        root: Option<PathBuf>,
        /// Clean everything habitat fetched, including both caches
        #[arg(short, long)]
        all: bool,
        /// Clean the entries cache of the current HEAD
        #[arg(short, long)]
        deps_cache: bool,
        /// Clean the global cache
        #[arg(short = 'c', long)]
        global_cache: bool,
    },

    /// Create a new configuration in a directory
    Config {
        /// Repository url of the solution
        url: String,
        /// Target directory
        dir: Option<PathBuf>,
        /// Override the default solution name
        #[arg(long, default_value = ".")]
        name: String,
        /// Branch to check out
        #[arg(short, long)]
        branch: Option<String>,
    },

    /// Set up user-level configuration values
    Setup {
        /// key=value pairs, comma separated
        configs: Option<String>,
        /// List all user configurations
        #[arg(short, long)]
        list: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if settings::debug_enabled() {
        "debug"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_version_mismatch() => {
            eprintln!("{e}");
            ExitCode::from(EXIT_INCOMPATIBLE_VERSION)
        }
        Err(e) => {
            let report = Err::<(), _>(e).into_diagnostic().unwrap_err();
            eprintln!("{report:?}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> Result<(), commands::CliError> {
    match command {
        Commands::Sync {
            root,
            main,
            target,
            target_only,
            all,
            no_history,
            raw,
            force,
            clean,
            git_auth,
            disable_cache,
            cache_dir,
            strict,
            disable_ignore,
            compatible,
        } => {
            let options = SyncOptions {
                force,
                clean,
                no_history,
                raw,
                target,
                target_only,
                all,
                main,
                git_auth,
                disable_cache,
                cache_dir: cache_dir.unwrap_or_else(settings::default_cache_dir),
                strict,
                disable_ignore,
                compatible,
                runtime: RuntimeContext::from_env(),
            };
            commands::sync(root, options).await
        }
        Commands::Deps {
            root,
            raw,
            source_stamp,
            format,
            target,
            type_filter,
            name_filter,
            ignore_condition,
        } => {
            commands::deps(
                root,
                commands::DepsOptions {
                    raw,
                    source_stamp,
                    format,
                    target,
                    type_filter,
                    name_filter,
                    ignore_condition,
                },
            )
            .await
        }
        Commands::Clean {
            root,
            all,
            deps_cache,
            global_cache,
        } => commands::clean(root, all, deps_cache, global_cache).await,
        Commands::Config {
            url,
            dir,
            name,
            branch,
        } => commands::config(&url, dir.unwrap_or_else(|| PathBuf::from(".")), &name, branch),
        Commands::Setup { configs, list } => commands::setup(configs.as_deref(), list),
    }
}
