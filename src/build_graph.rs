//! The build-domain graph: entries, targets, dependencies, asset groups and
//! assets, connected by what produced them and what they depend on.
//!
//! The graph only encodes structure and per-node state. Deciding which
//! request completes a node, and running it, is up to the
//! [`GraphBuilder`](crate::GraphBuilder).

use std::collections::{BTreeSet, HashSet};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::Hash32;
use crate::error::GraphError;
use crate::graph::{DirectedGraph, Removed};
use crate::request::RequestId;
use crate::types::{Asset, AssetGroup, Dependency, Entry, EnvironmentContext, Target};

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(Hash32);

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", self.0.short())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.short())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BuildNodeKind {
    Root,
    EntrySpecifier(Utf8PathBuf),
    EntryFile(Entry),
    Target { entry: Utf8PathBuf, target: Target },
    Dependency(Dependency),
    AssetGroup(AssetGroup),
    Asset(Asset),
}

impl BuildNodeKind {
    /// Content-derived id, stable across runs.
    pub fn id(&self) -> NodeId {
        let hash = match self {
            BuildNodeKind::Root => Hash32::of("root", &()),
            BuildNodeKind::EntrySpecifier(path) => Hash32::of("entry_specifier", path),
            BuildNodeKind::EntryFile(entry) => Hash32::of("entry_file", entry),
            BuildNodeKind::Target { entry, target } => Hash32::of("target", &(entry, target)),
            BuildNodeKind::Dependency(dependency) => dependency.id(),
            BuildNodeKind::AssetGroup(group) => group.id(),
            BuildNodeKind::Asset(asset) => Hash32::of("asset", &asset.id),
        };

        NodeId(hash)
    }

    pub fn name(&self) -> &'static str {
        match self {
            BuildNodeKind::Root => "root",
            BuildNodeKind::EntrySpecifier(_) => "entry_specifier",
            BuildNodeKind::EntryFile(_) => "entry_file",
            BuildNodeKind::Target { .. } => "target",
            BuildNodeKind::Dependency(_) => "dependency",
            BuildNodeKind::AssetGroup(_) => "asset_group",
            BuildNodeKind::Asset(_) => "asset",
        }
    }

    /// Short human-readable description for diagnostics.
    pub fn label(&self) -> String {
        match self {
            BuildNodeKind::Root => "root".into(),
            BuildNodeKind::EntrySpecifier(path) => format!("entry_specifier: {path}"),
            BuildNodeKind::EntryFile(entry) => format!("entry_file: {}", entry.file_path),
            BuildNodeKind::Target { target, .. } => format!("target: {}", target.name),
            BuildNodeKind::Dependency(dependency) => format!("dependency: {}", dependency.specifier),
            BuildNodeKind::AssetGroup(group) => format!("asset_group: {}", group.file_path),
            BuildNodeKind::Asset(asset) => format!("asset: {}", asset.file_path),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    /// The node's result has been applied.
    pub complete: bool,
    /// Excluded from traversal because its environment is not built.
    pub deferred: bool,
    /// Forces a re-visit even if the node was already visited in this build.
    pub has_deferred_descendant: bool,
    /// The request whose valid result completes this node.
    pub request: Option<RequestId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildNode {
    pub kind: BuildNodeKind,
    pub state: NodeState,
}

impl BuildNode {
    fn keyed(kind: BuildNodeKind, complete: bool) -> (NodeId, Self) {
        let node = BuildNode {
            kind,
            state: NodeState {
                complete,
                ..Default::default()
            },
        };

        (node.kind.id(), node)
    }
}

// State is not part of a node's identity, and assets are identified by their
// id alone so that a re-transformed asset refreshes in place.
impl PartialEq for BuildNode {
    fn eq(&self, other: &Self) -> bool {
        match (&self.kind, &other.kind) {
            (BuildNodeKind::Asset(a), BuildNodeKind::Asset(b)) => a.id == b.id,
            (a, b) => a == b,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildEdge {
    Produces,
    DependsOn,
}

/// The project as the bundler sees it, rooted at a single root node.
///
/// Entries, targets, dependencies, asset groups and assets hang below the
/// root. Node ids are derived from node content, so resolving the same input
/// twice lands on the same node. Every mutation returns the nodes it pruned.
#[derive(Serialize, Deserialize)]
pub struct BuildGraph {
    graph: DirectedGraph<NodeId, BuildNode, BuildEdge>,
    #[serde(skip)]
    filter: Option<BTreeSet<EnvironmentContext>>,
}

impl Default for BuildGraph {
    fn default() -> Self {
        let (id, root) = BuildNode::keyed(BuildNodeKind::Root, true);

        Self {
            graph: DirectedGraph::with_root(id, root),
            filter: None,
        }
    }
}

impl BuildGraph {
    /// A graph holding only the root.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn graph(&self) -> &DirectedGraph<NodeId, BuildNode, BuildEdge> {
        &self.graph
    }

    /// Id of the root node. It is the same for every graph.
    pub fn root(&self) -> NodeId {
        BuildNodeKind::Root.id()
    }

    pub fn get(&self, id: &NodeId) -> Option<&BuildNode> {
        self.graph.get(id)
    }

    /// Number of nodes, the root included.
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Children in the order they were attached, over every edge type.
    pub fn children(&self, id: &NodeId) -> Vec<NodeId> {
        self.graph.connected_from(id, None)
    }

    /// Every asset currently in the graph, in no particular order.
    pub fn assets(&self) -> impl Iterator<Item = &Asset> {
        self.graph.nodes().filter_map(|(_, node)| match &node.kind {
            BuildNodeKind::Asset(asset) => Some(asset),
            _ => None,
        })
    }

    /// Seeds the root with the entry specifiers and the explicitly requested
    /// asset groups.
    pub fn initialize(
        &mut self,
        entries: &[Utf8PathBuf],
        asset_groups: &[AssetGroup],
    ) -> Result<Removed<NodeId, BuildNode>, GraphError> {
        let children = entries
            .iter()
            .map(|path| BuildNode::keyed(BuildNodeKind::EntrySpecifier(path.clone()), false))
            .chain(
                asset_groups
                    .iter()
                    .map(|group| BuildNode::keyed(BuildNodeKind::AssetGroup(group.clone()), false)),
            )
            .collect();

        let root = self.root();
        self.graph
            .replace_nodes_connected_from(&root, children, Some(BuildEdge::Produces))
    }

    /// Attaches the entries an entry specifier resolved to.
    pub fn resolve_entry(
        &mut self,
        specifier: &Utf8Path,
        entries: Vec<Entry>,
        request: RequestId,
    ) -> Result<Removed<NodeId, BuildNode>, GraphError> {
        let id = BuildNodeKind::EntrySpecifier(specifier.to_owned()).id();
        let children = entries
            .into_iter()
            .map(|entry| BuildNode::keyed(BuildNodeKind::EntryFile(entry), false))
            .collect();

        let removed = self
            .graph
            .replace_nodes_connected_from(&id, children, Some(BuildEdge::Produces))?;

        self.complete(&id, request)?;
        Ok(removed)
    }

    /// Attaches the targets of an entry file, each depending on the entry
    /// dependency built for that target.
    pub fn resolve_targets(
        &mut self,
        entry: &Entry,
        targets: Vec<Target>,
        request: RequestId,
    ) -> Result<Removed<NodeId, BuildNode>, GraphError> {
        let id = BuildNodeKind::EntryFile(entry.clone()).id();
        let children: Vec<_> = targets
            .into_iter()
            .map(|target| {
                let kind = BuildNodeKind::Target {
                    entry: entry.file_path.clone(),
                    target,
                };
                BuildNode::keyed(kind, true)
            })
            .collect();

        let attached: Vec<_> = children
            .iter()
            .filter_map(|(id, node)| match &node.kind {
                BuildNodeKind::Target { target, .. } => Some((*id, Dependency::entry(entry, target))),
                _ => None,
            })
            .collect();

        let mut removed = self
            .graph
            .replace_nodes_connected_from(&id, children, Some(BuildEdge::Produces))?;

        for (target, dependency) in attached {
            let child = BuildNode::keyed(BuildNodeKind::Dependency(dependency), false);
            removed.extend(self.graph.replace_nodes_connected_from(
                &target,
                vec![child],
                Some(BuildEdge::DependsOn),
            )?);
        }

        self.complete(&id, request)?;
        Ok(removed)
    }

    /// Attaches the asset group a dependency resolved to, or detaches it when
    /// the dependency resolved to nothing. A group whose environment is not
    /// part of the build is kept but deferred.
    pub fn resolve_dependency(
        &mut self,
        dependency: &Dependency,
        group: Option<AssetGroup>,
        request: RequestId,
    ) -> Result<Removed<NodeId, BuildNode>, GraphError> {
        let id = NodeId(dependency.id());

        let mut deferred = None;
        let children = match group {
            Some(group) => {
                let is_deferred = !group.env.is_compatible(self.filter.as_ref());
                let (child, mut node) = BuildNode::keyed(BuildNodeKind::AssetGroup(group), false);
                node.state.deferred = is_deferred;
                deferred = Some((child, is_deferred));
                vec![(child, node)]
            }
            None => Vec::new(),
        };

        let removed = self
            .graph
            .replace_nodes_connected_from(&id, children, Some(BuildEdge::Produces))?;

        // an already existing group keeps its state, apart from deferral
        if let Some((child, is_deferred)) = deferred
            && let Some(node) = self.graph.get_mut(&child)
        {
            node.state.deferred = is_deferred;
        }

        self.complete(&id, request)?;
        Ok(removed)
    }

    /// Attaches the assets produced by transforming a group, each depending
    /// on its own dependencies.
    pub fn resolve_asset_group(
        &mut self,
        group: &AssetGroup,
        assets: Vec<Asset>,
        request: RequestId,
    ) -> Result<Removed<NodeId, BuildNode>, GraphError> {
        let id = NodeId(group.id());
        let children: Vec<_> = assets
            .iter()
            .map(|asset| BuildNode::keyed(BuildNodeKind::Asset(asset.clone()), true))
            .collect();

        let mut removed = self
            .graph
            .replace_nodes_connected_from(&id, children, Some(BuildEdge::Produces))?;

        for asset in assets {
            let asset_id = BuildNodeKind::Asset(asset.clone()).id();
            let dependencies = asset
                .dependencies
                .iter()
                .map(|dependency| BuildNode::keyed(BuildNodeKind::Dependency(dependency.clone()), false))
                .collect();

            if let Some(node) = self.graph.get_mut(&asset_id) {
                node.kind = BuildNodeKind::Asset(asset);
                node.state.complete = true;
            }

            removed.extend(self.graph.replace_nodes_connected_from(
                &asset_id,
                dependencies,
                Some(BuildEdge::DependsOn),
            )?);
        }

        self.complete(&id, request)?;
        Ok(removed)
    }

    /// Deferred asset groups are not entered from their dependency.
    pub fn should_visit_child(&self, parent: &NodeId, child: &NodeId) -> bool {
        let (Some(parent), Some(child)) = (self.graph.get(parent), self.graph.get(child)) else {
            return false;
        };

        !matches!(
            (&parent.kind, &child.kind),
            (BuildNodeKind::Dependency(_), BuildNodeKind::AssetGroup(_)) if child.state.deferred
        )
    }

    /// Changes the set of environments being built and re-evaluates every
    /// deferred decision. Returns the groups that became active again; their
    /// ancestors are flagged so the next traversal reaches them.
    pub fn set_environment_filter(&mut self, filter: Option<BTreeSet<EnvironmentContext>>) -> Vec<NodeId> {
        self.filter = filter;

        let groups: Vec<(NodeId, bool)> = self
            .graph
            .nodes()
            .filter_map(|(id, node)| match &node.kind {
                BuildNodeKind::AssetGroup(group) => {
                    Some((*id, group.env.is_compatible(self.filter.as_ref())))
                }
                _ => None,
            })
            .filter(|(id, _)| self.has_dependency_parent(id))
            .collect();

        let mut reactivated = Vec::new();
        for (id, compatible) in groups {
            let Some(node) = self.graph.get_mut(&id) else {
                continue;
            };

            if node.state.deferred && compatible {
                node.state.deferred = false;
                reactivated.push(id);
            } else if !node.state.deferred && !compatible {
                node.state.deferred = true;
            }
        }

        for id in &reactivated {
            self.mark_ancestors(id);
        }

        reactivated
    }

    /// Clears `complete` on nodes whose request result is no longer valid.
    /// Returns how many nodes were reset.
    pub fn reset_invalidated<F>(&mut self, is_valid: F) -> usize
    where
        F: Fn(&RequestId) -> bool,
    {
        let mut count = 0;

        for (_, node) in self.graph.nodes_mut() {
            if let Some(request) = &node.state.request
                && node.state.complete
                && !is_valid(request)
            {
                node.state.complete = false;
                count += 1;
            }
        }

        count
    }

    pub fn mark_visited(&mut self, id: &NodeId) {
        if let Some(node) = self.graph.get_mut(id) {
            node.state.has_deferred_descendant = false;
        }
    }

    fn complete(&mut self, id: &NodeId, request: RequestId) -> Result<(), GraphError> {
        let node = self
            .graph
            .get_mut(id)
            .ok_or_else(|| GraphError::unknown(id))?;

        node.state.complete = true;
        node.state.request = Some(request);
        Ok(())
    }

    fn has_dependency_parent(&self, id: &NodeId) -> bool {
        self.graph
            .connected_to(id, None)
            .iter()
            .filter_map(|parent| self.graph.get(parent))
            .any(|parent| matches!(parent.kind, BuildNodeKind::Dependency(_)))
    }

    fn mark_ancestors(&mut self, id: &NodeId) {
        let mut seen = HashSet::new();
        let mut stack = self.graph.connected_to(id, None);

        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }

            if let Some(node) = self.graph.get_mut(&id) {
                node.state.has_deferred_descendant = true;
            }

            stack.extend(self.graph.connected_to(&id, None));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Environment;

    fn request(name: &str) -> RequestId {
        RequestId::new("test", name)
    }

    fn entry(path: &str) -> Entry {
        Entry {
            file_path: path.into(),
            package_path: "".into(),
        }
    }

    fn target(name: &str) -> Target {
        Target {
            name: name.into(),
            dist_dir: "dist".into(),
            dist_entry: None,
            public_url: "/".into(),
            env: Environment::default(),
        }
    }

    fn asset(path: &str, deps: &[&str]) -> Asset {
        Asset {
            id: path.into(),
            file_path: path.into(),
            asset_type: "js".into(),
            env: Environment::default(),
            content_key: Hash32::hash(path),
            dependencies: deps
                .iter()
                .map(|spec| {
                    let mut dep = Dependency::new(*spec, Environment::default());
                    dep.resolve_from = Some(path.into());
                    dep
                })
                .collect(),
        }
    }

    #[test]
    fn test_initialize() {
        let mut graph = BuildGraph::new();
        graph.initialize(&["src/index.js".into()], &[]).unwrap();

        let children = graph.children(&graph.root());
        assert_eq!(children.len(), 1);

        let node = graph.get(&children[0]).unwrap();
        assert!(matches!(node.kind, BuildNodeKind::EntrySpecifier(_)));
        assert!(!node.state.complete);
        assert!(graph.get(&graph.root()).unwrap().state.complete);
    }

    #[test]
    fn test_resolve_entry_replaces_files() {
        let mut graph = BuildGraph::new();
        graph.initialize(&["src".into()], &[]).unwrap();

        graph
            .resolve_entry(Utf8Path::new("src"), vec![entry("src/a.js"), entry("src/b.js")], request("e1"))
            .unwrap();
        let spec = BuildNodeKind::EntrySpecifier("src".into()).id();
        assert_eq!(graph.children(&spec).len(), 2);
        assert_eq!(graph.get(&spec).unwrap().state.request, Some(request("e1")));

        let removed = graph
            .resolve_entry(Utf8Path::new("src"), vec![entry("src/a.js")], request("e2"))
            .unwrap();
        assert_eq!(removed.len(), 1);
        assert!(matches!(&removed[0].1.kind, BuildNodeKind::EntryFile(e) if e.file_path == "src/b.js"));
    }

    #[test]
    fn test_resolve_targets_adds_entry_dependency() {
        let mut graph = BuildGraph::new();
        graph.initialize(&["src/a.js".into()], &[]).unwrap();
        graph
            .resolve_entry(Utf8Path::new("src/a.js"), vec![entry("src/a.js")], request("e"))
            .unwrap();
        graph
            .resolve_targets(&entry("src/a.js"), vec![target("web")], request("t"))
            .unwrap();

        let file = BuildNodeKind::EntryFile(entry("src/a.js")).id();
        let targets = graph.children(&file);
        assert_eq!(targets.len(), 1);

        let deps = graph.children(&targets[0]);
        assert_eq!(deps.len(), 1);
        match &graph.get(&deps[0]).unwrap().kind {
            BuildNodeKind::Dependency(dep) => {
                assert!(dep.is_entry);
                assert_eq!(dep.specifier, "src/a.js");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    fn graph_with_dependency() -> (BuildGraph, Dependency) {
        let mut graph = BuildGraph::new();
        graph.initialize(&["src/a.js".into()], &[]).unwrap();
        graph
            .resolve_entry(Utf8Path::new("src/a.js"), vec![entry("src/a.js")], request("e"))
            .unwrap();
        graph
            .resolve_targets(&entry("src/a.js"), vec![target("web")], request("t"))
            .unwrap();

        (graph, Dependency::entry(&entry("src/a.js"), &target("web")))
    }

    #[test]
    fn test_resolve_asset_group_keeps_asset_state() {
        let (mut graph, dep) = graph_with_dependency();
        let group = AssetGroup::new("src/a.js", Environment::default());
        graph
            .resolve_dependency(&dep, Some(group.clone()), request("d"))
            .unwrap();
        graph
            .resolve_asset_group(&group, vec![asset("src/a.js", &["./b"])], request("a1"))
            .unwrap();
        assert_eq!(graph.assets().count(), 1);

        let mut changed = asset("src/a.js", &["./c"]);
        changed.content_key = Hash32::hash("changed");
        let removed = graph
            .resolve_asset_group(&group, vec![changed.clone()], request("a2"))
            .unwrap();

        assert_eq!(graph.assets().next(), Some(&changed));
        assert_eq!(removed.len(), 1);
        assert!(matches!(&removed[0].1.kind, BuildNodeKind::Dependency(d) if d.specifier == "./b"));
    }

    #[test]
    fn test_resolve_dependency_to_nothing_prunes() {
        let (mut graph, dep) = graph_with_dependency();
        let group = AssetGroup::new("src/a.js", Environment::default());
        graph
            .resolve_dependency(&dep, Some(group.clone()), request("d"))
            .unwrap();
        graph
            .resolve_asset_group(&group, vec![asset("src/a.js", &[])], request("a"))
            .unwrap();

        let removed = graph.resolve_dependency(&dep, None, request("d")).unwrap();

        assert_eq!(removed.len(), 2);
        assert_eq!(graph.assets().count(), 0);
    }

    #[test]
    fn test_deferral_and_reactivation() {
        let (mut graph, dep) = graph_with_dependency();
        graph.set_environment_filter(Some(BTreeSet::from([EnvironmentContext::Browser])));

        let worker = Environment::new(EnvironmentContext::WebWorker);
        let group = AssetGroup::new("src/worker.js", worker);
        graph
            .resolve_dependency(&dep, Some(group.clone()), request("d"))
            .unwrap();

        let dep_id = NodeId(dep.id());
        let group_id = NodeId(group.id());
        assert!(graph.get(&group_id).unwrap().state.deferred);
        assert!(!graph.should_visit_child(&dep_id, &group_id));

        let reactivated = graph.set_environment_filter(None);

        assert_eq!(reactivated, vec![group_id]);
        assert!(graph.should_visit_child(&dep_id, &group_id));
        assert!(graph.get(&dep_id).unwrap().state.has_deferred_descendant);
        assert!(graph.get(&graph.root()).unwrap().state.has_deferred_descendant);

        graph.mark_visited(&dep_id);
        assert!(!graph.get(&dep_id).unwrap().state.has_deferred_descendant);
    }

    #[test]
    fn test_reset_invalidated() {
        let (mut graph, _) = graph_with_dependency();
        let spec = BuildNodeKind::EntrySpecifier("src/a.js".into()).id();

        let reset = graph.reset_invalidated(|id| *id != request("e"));

        assert_eq!(reset, 1);
        assert!(!graph.get(&spec).unwrap().state.complete);
        // targets have no request and stay complete
        let file = BuildNodeKind::EntryFile(entry("src/a.js")).id();
        let target = graph.children(&file)[0];
        assert!(graph.get(&target).unwrap().state.complete);
    }
}
