//! Group scheduling: concurrent child fetches under conflict resolution,
//! `require` ordering, pruning, and cycle detection.

use crate::component::{fetch_component, Component, LocalRef, SharedMaps};
use crate::ResolveError;
use habitat_types::SyncOptions;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Schedule every eligible child of a group concurrently.
///
/// Children observe each other through the shared source/target maps:
/// the first node claiming a source fetches it, later ones mirror it
/// locally; later nodes claiming an already-claimed target are skipped.
pub async fn fetch_children(
    group_component: Arc<Component>,
    root_dir: &Path,
    options: &SyncOptions,
    shared: &SharedMaps,
) -> Result<(), ResolveError> {
    let Some(group) = &group_component.group else {
        return Ok(());
    };

    let mut to_fetch: Vec<Arc<Component>> = Vec::new();
    for child in group_component.children() {
        if !child.spec.condition {
            info!("skip dependency {} due to unsatisfied condition", child.name);
            continue;
        }

        let source = child.source();
        // Actions have no source; every one of them runs.
        if !source.is_empty() {
            if let Some(existing) = shared.get_source(&source) {
                if existing.source_stamp() != child.source_stamp() {
                    let conflict = ResolveError::Conflict {
                        existing_stamp: existing.source_stamp(),
                        existing_target: existing.target_dir.clone(),
                        stamp: child.source_stamp(),
                        target: child.target_dir.clone(),
                    };
                    if options.strict {
                        return Err(conflict);
                    }
                    // Non-strict: fall through to a direct fetch.
                    warn!("{conflict}");
                } else if paths_of(&existing) == paths_of(&child) {
                    // Identical pinned content materializes once; this node
                    // just links to the first claimant.
                    child.bind_local_ref(LocalRef {
                        reference: existing.clone(),
                        symlink: !child.spec.disable_link,
                    });
                    to_fetch.push(child);
                    continue;
                }
            }
        }

        if let Some(target_item) = shared.get_target(&child.target_dir) {
            if target_item.source() != source {
                warn!(
                    "skip fetching {} to {} because another source {} exists in the same directory",
                    source,
                    child.target_dir.display(),
                    target_item.source()
                );
            }
            continue;
        }
        to_fetch.push(child);
    }

    prune_missing_requirements(&mut to_fetch);
    detect_require_cycles(&to_fetch)?;

    let mut tasks = Vec::with_capacity(to_fetch.len());
    for child in &to_fetch {
        let events: Vec<(String, oneshot::Receiver<()>)> = child
            .spec
            .require
            .iter()
            .map(|name| (name.clone(), group.events.register_consumer(name)))
            .collect();

        // Register before scheduling so concurrent siblings observe the
        // claim immediately.
        shared.register_target(&child.target_dir, child.clone());
        let source = child.source();
        if !source.is_empty() {
            shared.register_source_if_absent(source, child.clone());
        }

        tasks.push(fetch_child(
            child.clone(),
            events,
            root_dir.to_path_buf(),
            options.clone(),
            shared.clone(),
        ));
    }

    match futures::future::try_join_all(tasks).await {
        Ok(_) => Ok(()),
        Err(e) => {
            // Release every outstanding waiter so the original error is not
            // masked by a downstream timeout.
            group.events.clear();
            Err(e)
        }
    }
}

async fn fetch_child(
    child: Arc<Component>,
    events: Vec<(String, oneshot::Receiver<()>)>,
    root_dir: std::path::PathBuf,
    options: SyncOptions,
    shared: SharedMaps,
) -> Result<(), ResolveError> {
    debug!("fetch child {} parent: {:?}", child.name, child.parent().map(|p| p.name.clone()));
    let wait = options.runtime.max_dependency_wait;
    for (name, receiver) in events {
        debug!("waiting on event {name}");
        match tokio::time::timeout(wait, receiver).await {
            // A closed channel means the manager was cleared; proceed and
            // let the group barrier report the real failure.
            Ok(_) => debug!("got event {name}"),
            Err(_) => {
                return Err(ResolveError::Timeout {
                    seconds: wait.as_secs(),
                    event: name,
                    waiter: child.name.clone(),
                })
            }
        }
    }
    fetch_component(child, root_dir, options, shared).await
}

/// Drop children whose `require` names something that is not being
/// fetched, repeating until a fixed point: removing one child can strand
/// another.
fn prune_missing_requirements(to_fetch: &mut Vec<Arc<Component>>) {
    loop {
        let names: HashSet<String> = to_fetch.iter().map(|c| c.name.clone()).collect();
        let mut removed = false;
        to_fetch.retain(|child| {
            let satisfied = child.spec.require.iter().all(|r| names.contains(r));
            if !satisfied {
                warn!(
                    "skip component {} due to the fact that some requirements were skipped",
                    child.name
                );
                removed = true;
            }
            satisfied
        });
        if !removed {
            break;
        }
    }
}

/// Reject a `require` graph that can never make progress.
fn detect_require_cycles(to_fetch: &[Arc<Component>]) -> Result<(), ResolveError> {
    let by_name: HashMap<&str, &Arc<Component>> =
        to_fetch.iter().map(|c| (c.name.as_str(), c)).collect();

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        name: &'a str,
        by_name: &HashMap<&'a str, &'a Arc<Component>>,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> Result<(), ResolveError> {
        marks.insert(name, Mark::Visiting);
        if let Some(component) = by_name.get(name) {
            for requirement in &component.spec.require {
                match marks.get(requirement.as_str()) {
                    Some(Mark::Visiting) => {
                        return Err(ResolveError::Cycle {
                            name: name.to_string(),
                            requirement: requirement.clone(),
                        })
                    }
                    Some(Mark::Done) => {}
                    None => visit(requirement.as_str(), by_name, marks)?,
                }
            }
        }
        marks.insert(name, Mark::Done);
        Ok(())
    }

    let mut marks = HashMap::new();
    for component in to_fetch {
        if !marks.contains_key(component.name.as_str()) {
            visit(component.name.as_str(), &by_name, &mut marks)?;
        }
    }
    Ok(())
}

fn paths_of(component: &Component) -> BTreeSet<String> {
    component
        .spec
        .kind
        .paths()
        .map(|paths| paths.iter().cloned().collect())
        .unwrap_or_default()
}
