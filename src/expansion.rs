//! On-demand fetching of a node's children.
//!
//! The tree service only knows how to return the entire forest, so every
//! expansion fetches it (or reuses a very recent snapshot, when enabled),
//! re-locates the subtree of the node being expanded and installs its
//! children into the [`TreeCache`] in a single update.
//!
//! The loader does not deduplicate in-flight requests: callers must not
//! expand the same address twice concurrently.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::contract::{Forest, RemoteRecord, TreeFilter, TreeService};
use crate::error::ExpansionError;
use crate::node::{self, FilePayload, Node, NodeAddress, NodeKind, NodeSource};
use crate::tree_cache::TreeCache;

enum Target {
    Root,
    Project,
    Dataset,
}

struct Snapshot {
    fetched_at: Instant,
    forest: Arc<Forest>,
}

pub struct ExpansionLoader<S> {
    service: S,
    cache: Arc<TreeCache>,
    filter: TreeFilter,
    source: NodeSource,
    snapshot_ttl: Option<Duration>,
    snapshot: Mutex<Option<Snapshot>>,
}

impl<S> ExpansionLoader<S>
where
    S: TreeService,
{
    pub fn new(service: S, cache: Arc<TreeCache>) -> Self {
        ExpansionLoader {
            service,
            cache,
            filter: TreeFilter::default(),
            source: NodeSource::default(),
            snapshot_ttl: None,
            snapshot: Mutex::new(None),
        }
    }

    pub fn with_filter(mut self, filter: TreeFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_source(mut self, source: NodeSource) -> Self {
        self.source = source;
        self
    }

    /// Reuse a fetched forest for expansions issued within `ttl` of the fetch.
    pub fn with_snapshot_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.snapshot_ttl = ttl;
        self
    }

    pub fn cache(&self) -> &Arc<TreeCache> {
        &self.cache
    }

    /// Drop the reused forest so the next expansion fetches again.
    pub fn invalidate_snapshot(&self) {
        *self.snapshot.lock() = None;
    }

    /// Fetch and install the children of `address`, returning what was installed.
    ///
    /// On any failure the cache is left untouched.
    pub async fn expand(
        &self,
        address: &NodeAddress,
    ) -> Result<HashMap<NodeAddress, Node>, ExpansionError> {
        let target = if address.is_root() {
            Target::Root
        } else {
            match node::parse(address)? {
                (NodeKind::Project, _) => Target::Project,
                (NodeKind::Dataset, _) => Target::Dataset,
                (NodeKind::File, _) => {
                    debug!(address = %address, "Expansion of a leaf is a no-op");
                    return Ok(HashMap::new());
                }
            }
        };

        info!(address = %address, "Expanding node");
        let forest = self.forest(address).await?;

        let children = match target {
            Target::Root => self.project_nodes(address, &forest)?,
            Target::Project => {
                let project = find_project(&forest, address).ok_or_else(|| {
                    fetch_failed(address, "project not present in the fetched tree")
                })?;
                self.child_nodes(address, project)?
            }
            Target::Dataset => {
                let dataset = find_dataset(&forest, address).ok_or_else(|| {
                    fetch_failed(address, "dataset not present in the fetched tree")
                })?;
                self.child_nodes(address, dataset)?
            }
        };

        if let Some(duplicate) = first_duplicate(&children) {
            warn!(parent = %address, child = %duplicate, "Duplicate child in fetched tree");
            return Err(fetch_failed(
                address,
                format!("child {duplicate} appears more than once"),
            ));
        }

        let installed = self.cache.install_children(address, children)?;
        info!(address = %address, children = installed.len(), "Expansion installed children");
        Ok(installed)
    }

    async fn forest(&self, address: &NodeAddress) -> Result<Arc<Forest>, ExpansionError> {
        let reusable = self.snapshot_ttl.and_then(|ttl| {
            let snapshot = self.snapshot.lock();
            let fresh = snapshot
                .as_ref()
                .filter(|s| s.fetched_at.elapsed() < ttl)
                .map(|s| s.forest.clone());
            fresh
        });
        if let Some(forest) = reusable {
            debug!(address = %address, "Reusing recent tree snapshot");
            return Ok(forest);
        }

        let forest = match self.service.fetch_tree(&self.filter).await {
            Ok(forest) => Arc::new(forest),
            Err(e) => {
                error!(address = %address, error = %e, "Fetching tree failed");
                return Err(fetch_failed(address, e));
            }
        };
        debug!(projects = forest.len(), "Fetched tree snapshot");

        if self.snapshot_ttl.is_some() {
            *self.snapshot.lock() = Some(Snapshot {
                fetched_at: Instant::now(),
                forest: forest.clone(),
            });
        }
        Ok(forest)
    }

    fn project_nodes(&self, root: &NodeAddress, forest: &Forest) -> Result<Vec<Node>, ExpansionError> {
        forest
            .iter()
            .map(|record| {
                if record.kind != NodeKind::Project {
                    warn!(id = record.id, kind = %record.kind, "Top level record is not a project");
                    return Err(fetch_failed(
                        root,
                        format!("top level record {}-{} is not a project", record.kind, record.id),
                    ));
                }
                Ok(self.to_node(record))
            })
            .collect()
    }

    fn child_nodes(&self, parent: &NodeAddress, record: &RemoteRecord) -> Result<Vec<Node>, ExpansionError> {
        let expected = record.kind.child_kind();
        record
            .children
            .iter()
            .map(|child| {
                if Some(child.kind) != expected {
                    warn!(parent = %parent, id = child.id, kind = %child.kind, "Unexpected child kind");
                    return Err(fetch_failed(
                        parent,
                        format!("child {}-{} has unexpected kind", child.kind, child.id),
                    ));
                }
                Ok(self.to_node(child))
            })
            .collect()
    }

    fn to_node(&self, record: &RemoteRecord) -> Node {
        let source = self.source.clone();
        let child_count = record.child_count.unwrap_or(record.children.len());
        match record.kind {
            NodeKind::Project => Node::project(record.id, &record.name, source).with_child_count(child_count),
            NodeKind::Dataset => Node::dataset(record.id, &record.name, source).with_child_count(child_count),
            NodeKind::File => Node::file(
                FilePayload {
                    remote_id: record.id,
                    name: record.name.clone(),
                    mimetype: record.mimetype.clone(),
                    size: record.size,
                    path: record.path.clone(),
                },
                source,
            ),
        }
    }
}

fn find_project<'a>(forest: &'a Forest, address: &NodeAddress) -> Option<&'a RemoteRecord> {
    forest
        .iter()
        .find(|p| p.kind == NodeKind::Project && node::address(p.kind, p.id) == *address)
}

fn find_dataset<'a>(forest: &'a Forest, address: &NodeAddress) -> Option<&'a RemoteRecord> {
    forest
        .iter()
        .flat_map(|project| project.children.iter())
        .find(|d| d.kind == NodeKind::Dataset && node::address(d.kind, d.id) == *address)
}

fn first_duplicate(children: &[Node]) -> Option<NodeAddress> {
    let mut seen = HashSet::with_capacity(children.len());
    children
        .iter()
        .find(|c| !seen.insert(&c.address))
        .map(|c| c.address.clone())
}

fn fetch_failed(address: &NodeAddress, reason: impl ToString) -> ExpansionError {
    ExpansionError::FetchFailed {
        address: address.to_string(),
        reason: reason.to_string(),
    }
}
