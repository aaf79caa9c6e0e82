//! Graph vertices and the per-node fetch orchestration.

use crate::events::EventManager;
use crate::{group, local, solution, ResolveError};
use futures::future::BoxFuture;
use futures::FutureExt;
use habitat_fetch::{ActionFetcher, DummyFetcher, Fetcher, GitFetcher, HttpFetcher};
use habitat_fs::normalize_path;
use habitat_types::{is_full_git_sha, DepSpec, KindSpec, SyncOptions};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::{debug, info};

/// Children and rendezvous state of a dependency group node.
#[derive(Default)]
pub struct GroupState {
    pub(crate) children: RwLock<Vec<Arc<Component>>>,
    pub(crate) events: EventManager,
}

/// Binding to an already-scheduled node with the same source; fetching
/// becomes mirroring its paths.
#[derive(Clone)]
pub struct LocalRef {
    pub reference: Arc<Component>,
    pub symlink: bool,
}

#[derive(Default)]
struct FetchState {
    fetched: bool,
    fetched_paths: Vec<PathBuf>,
    local_ref: Option<LocalRef>,
}

/// One vertex of the dependency graph.
pub struct Component {
    pub name: String,
    pub target_dir: PathBuf,
    pub spec: DepSpec,
    /// Present iff this node owns children (solutions).
    pub group: Option<GroupState>,
    parent: RwLock<Weak<Component>>,
    state: Mutex<FetchState>,
    /// The owning solution's entries table, consulted by `up_to_date`.
    stamps: RwLock<Arc<BTreeMap<String, String>>>,
}

impl Component {
    pub fn new(name: impl Into<String>, target_dir: impl Into<PathBuf>, spec: DepSpec) -> Arc<Self> {
        let group = matches!(spec.kind, KindSpec::Solution(_)).then(GroupState::default);
        Arc::new(Self {
            name: name.into(),
            target_dir: target_dir.into(),
            spec,
            group,
            parent: RwLock::new(Weak::new()),
            state: Mutex::new(FetchState::default()),
            stamps: RwLock::new(Arc::new(BTreeMap::new())),
        })
    }

    pub fn parent(&self) -> Option<Arc<Component>> {
        self.parent.read().expect("parent lock").upgrade()
    }

    pub fn set_parent(&self, parent: &Arc<Component>) {
        *self.parent.write().expect("parent lock") = Arc::downgrade(parent);
    }

    pub fn is_root(&self) -> bool {
        self.parent().is_none()
    }

    pub fn source(&self) -> String {
        self.spec.kind.source()
    }

    pub fn source_stamp(&self) -> String {
        self.spec.kind.source_stamp()
    }

    pub fn is_fetched(&self) -> bool {
        self.state.lock().expect("state lock").fetched
    }

    pub fn mark_fetched(&self) {
        self.state.lock().expect("state lock").fetched = true;
    }

    pub fn fetched_paths(&self) -> Vec<PathBuf> {
        self.state.lock().expect("state lock").fetched_paths.clone()
    }

    pub fn set_fetched_paths(&self, paths: Vec<PathBuf>) {
        self.state.lock().expect("state lock").fetched_paths = paths;
    }

    pub(crate) fn bind_local_ref(&self, local: LocalRef) {
        self.state.lock().expect("state lock").local_ref = Some(local);
    }

    fn local_ref(&self) -> Option<LocalRef> {
        self.state.lock().expect("state lock").local_ref.clone()
    }

    pub fn stamps(&self) -> Arc<BTreeMap<String, String>> {
        self.stamps.read().expect("stamps lock").clone()
    }

    pub fn set_stamps(&self, stamps: Arc<BTreeMap<String, String>>) {
        *self.stamps.write().expect("stamps lock") = stamps;
    }

    pub fn add_child(self: &Arc<Self>, child: Arc<Component>) {
        child.set_parent(self);
        child.set_stamps(self.stamps());
        if let Some(group) = &self.group {
            group.children.write().expect("children lock").push(child);
        }
    }

    pub fn children(&self) -> Vec<Arc<Component>> {
        match &self.group {
            Some(group) => group.children.read().expect("children lock").clone(),
            None => Vec::new(),
        }
    }

    /// A node is current when its recorded stamp matches and, for git-backed
    /// kinds, the pin is a full 40-hex sha; anything else may have moved
    /// upstream.
    pub fn up_to_date(&self) -> bool {
        match &self.spec.kind {
            KindSpec::Action(_) | KindSpec::Unknown => false,
            KindSpec::Git(_) | KindSpec::Solution(_) => {
                self.spec
                    .kind
                    .commit()
                    .map(is_full_git_sha)
                    .unwrap_or(false)
                    && self.stamp_matches()
            }
            KindSpec::Http(_) => self.stamp_matches(),
        }
    }

    fn stamp_matches(&self) -> bool {
        self.stamps().get(&self.name) == Some(&self.source_stamp())
    }

    /// Breadth-first walk of the subtree rooted here, self included.
    pub fn walk(self: &Arc<Self>) -> Vec<Arc<Component>> {
        let mut queue = std::collections::VecDeque::from([self.clone()]);
        let mut seen = Vec::new();
        while let Some(node) = queue.pop_front() {
            queue.extend(node.children());
            seen.push(node);
        }
        seen
    }

    /// Render the subtree for logs and the `deps` command.
    pub fn pretty_tree(self: &Arc<Self>) -> String {
        fn render(node: &Arc<Component>, depth: usize, out: &mut String) {
            for child in node.children() {
                out.push_str(&format!("\n{}└──{}", "   ".repeat(depth + 1), child.name));
                render(&child, depth + 1, out);
            }
        }
        let mut out = self.name.clone();
        render(self, 0, &mut out);
        out
    }

    /// Flat attribute view for `deps --format` substitution.
    pub fn attributes(&self) -> HashMap<String, String> {
        let mut attrs = HashMap::new();
        attrs.insert("name".into(), self.name.clone());
        attrs.insert("type".into(), self.spec.kind.type_name().into());
        attrs.insert("target_dir".into(), self.target_dir.display().to_string());
        attrs.insert("source".into(), self.source());
        attrs.insert("source_stamp".into(), self.source_stamp());
        attrs.insert("condition".into(), self.spec.condition.to_string());
        match &self.spec.kind {
            KindSpec::Git(g) => {
                attrs.insert("url".into(), g.url.clone());
                if let Some(branch) = &g.branch {
                    attrs.insert("branch".into(), branch.clone());
                }
                if let Some(commit) = &g.commit {
                    attrs.insert("commit".into(), commit.clone());
                }
                if let Some(tag) = &g.tag {
                    attrs.insert("tag".into(), tag.clone());
                }
            }
            KindSpec::Http(h) => {
                attrs.insert("url".into(), h.url.clone());
                if let Some(sha256) = &h.sha256 {
                    attrs.insert("sha256".into(), sha256.clone());
                }
            }
            KindSpec::Solution(s) => {
                attrs.insert("url".into(), s.url.clone());
                attrs.insert("deps_file".into(), s.deps_file.clone());
                if let Some(branch) = &s.branch {
                    attrs.insert("branch".into(), branch.clone());
                }
                if let Some(commit) = &s.commit {
                    attrs.insert("commit".into(), commit.clone());
                }
            }
            KindSpec::Action(_) | KindSpec::Unknown => {}
        }
        attrs
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}(target_dir: {} fetched: {})",
            self.name,
            self.target_dir.display(),
            self.is_fetched()
        )
    }
}

/// Resolution-wide registries of claimed sources and target directories,
/// shared across every group so duplicates collapse across solutions.
#[derive(Clone, Default)]
pub struct SharedMaps {
    sources: Arc<Mutex<HashMap<String, Arc<Component>>>>,
    targets: Arc<Mutex<HashMap<PathBuf, Arc<Component>>>>,
}

impl SharedMaps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_source(&self, source: &str) -> Option<Arc<Component>> {
        self.sources.lock().expect("sources lock").get(source).cloned()
    }

    pub(crate) fn register_source_if_absent(&self, source: String, component: Arc<Component>) {
        self.sources
            .lock()
            .expect("sources lock")
            .entry(source)
            .or_insert(component);
    }

    pub fn get_target(&self, target_dir: &Path) -> Option<Arc<Component>> {
        self.targets
            .lock()
            .expect("targets lock")
            .get(&normalize_path(target_dir))
            .cloned()
    }

    pub fn register_target(&self, target_dir: &Path, component: Arc<Component>) {
        self.targets
            .lock()
            .expect("targets lock")
            .insert(normalize_path(target_dir), component);
    }
}

fn build_fetcher(component: &Component) -> Box<dyn Fetcher> {
    match &component.spec.kind {
        KindSpec::Git(spec) => Box::new(GitFetcher::new(
            component.name.clone(),
            component.target_dir.clone(),
            spec.clone(),
            component.is_root(),
            component.spec.fetch_mode,
        )),
        KindSpec::Solution(spec) => Box::new(GitFetcher::for_solution(
            component.name.clone(),
            component.target_dir.clone(),
            spec,
            component.is_root(),
            component.spec.fetch_mode,
        )),
        KindSpec::Http(spec) => Box::new(HttpFetcher::new(
            component.name.clone(),
            component.target_dir.clone(),
            spec.clone(),
        )),
        KindSpec::Action(spec) => Box::new(ActionFetcher::new(
            component.name.clone(),
            component.target_dir.clone(),
            spec.clone(),
        )),
        KindSpec::Unknown => Box::new(DummyFetcher {
            name: component.name.clone(),
        }),
    }
}

/// Fetch one node and, for groups, its children.
///
/// The completion event is produced on every exit path, success or failure,
/// so `require` waiters are released and the group barrier surfaces the
/// error instead of a downstream timeout.
pub fn fetch_component(
    component: Arc<Component>,
    root_dir: PathBuf,
    options: SyncOptions,
    shared: SharedMaps,
) -> BoxFuture<'static, Result<(), ResolveError>> {
    async move {
        // A nested solution becomes the root of its own subtree.
        let root_dir = if component.group.is_some() && !component.is_root() {
            component.target_dir.clone()
        } else {
            root_dir
        };

        let self_result = fetch_self(&component, &root_dir, &options).await;
        if let Some(parent) = component.parent() {
            if let Some(group) = &parent.group {
                group.events.produce(&component.name);
            }
        }
        self_result.map_err(|source| ResolveError::Fetch {
            stamp: component.source_stamp(),
            target_dir: component.target_dir.clone(),
            source: Box::new(source),
        })?;

        if component.group.is_some() {
            group::fetch_children(component, &root_dir, &options, &shared).await?;
        }
        Ok(())
    }
    .boxed()
}

async fn fetch_self(
    component: &Arc<Component>,
    root_dir: &Path,
    options: &SyncOptions,
) -> Result<(), ResolveError> {
    info!("sync dependency {}", component.name);
    if options.force || !component.up_to_date() {
        let paths = match component.local_ref() {
            Some(local) => local::mirror(component, &local, options).await?,
            None => build_fetcher(component).fetch(root_dir, options).await?,
        };
        component.set_fetched_paths(paths);
    } else {
        debug!(
            "local source stamp cache of {} is synchronized with source stamp, skip fetching",
            component.name
        );
    }
    component.mark_fetched();
    if component.group.is_some() {
        solution::load_deps_for(component, root_dir, options).await?;
    }
    Ok(())
}
