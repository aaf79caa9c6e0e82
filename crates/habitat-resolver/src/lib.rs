//! The dependency graph engine.
//!
//! A [`Component`] is one vertex of the resolution graph. Solutions are
//! components that own children and an event manager; their children fetch
//! concurrently under the `require` partial order, with duplicate sources
//! collapsing into local mirrors and conflicting targets skipped.

use std::path::PathBuf;
use thiserror::Error;

mod component;
mod events;
mod group;
mod local;
mod solution;

pub use component::{fetch_component, Component, GroupState, LocalRef, SharedMaps};
pub use events::EventManager;
pub use group::fetch_children;
pub use solution::{fetch_deps_only, load_deps_for, load_solutions};

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("failed to fetch dependency {stamp} to {target_dir:?}")]
    Fetch {
        stamp: String,
        target_dir: PathBuf,
        #[source]
        source: Box<ResolveError>,
    },
    #[error(transparent)]
    Fetcher(#[from] habitat_fetch::FetchError),
    #[error(transparent)]
    Config(#[from] habitat_config::ConfigError),
    #[error(transparent)]
    Cache(#[from] habitat_cache::CacheError),
    #[error(transparent)]
    Git(#[from] habitat_git::GitError),
    #[error(transparent)]
    Fs(#[from] habitat_fs::FsError),
    #[error("file {0} not found in directory {1:?}")]
    MissingSolutionsFile(String, PathBuf),
    #[error(
        "source stamps conflict:\n  {existing_stamp} ({existing_target:?}) \
         vs {stamp} ({target:?})"
    )]
    Conflict {
        existing_stamp: String,
        existing_target: PathBuf,
        stamp: String,
        target: PathBuf,
    },
    #[error("timeout of {seconds} seconds expired when waiting on event {event} for {waiter}")]
    Timeout {
        seconds: u64,
        event: String,
        waiter: String,
    },
    #[error("found a circular dependency, please check {name}'s requirement {requirement}")]
    Cycle { name: String, requirement: String },
}
