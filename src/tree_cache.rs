//! Flat, randomly addressable store of every node fetched so far.
//!
//! The cache is the only shared mutable state of the browser. All writes go
//! through [`TreeCache::put`] and [`TreeCache::install_children`], each of
//! which holds the write lock for the whole update, so a reader never sees a
//! parent whose children are only partly installed.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use tracing::{debug, error};

use crate::error::CacheError;
use crate::node::{Node, NodeAddress};

#[derive(Debug)]
pub struct TreeCache {
    nodes: RwLock<HashMap<NodeAddress, Node>>,
}

impl Default for TreeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeCache {
    /// A cache holding only the placeholder root.
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        let root = Node::root();
        nodes.insert(root.address.clone(), root);
        TreeCache {
            nodes: RwLock::new(nodes),
        }
    }

    pub fn get(&self, address: &NodeAddress) -> Option<Node> {
        self.nodes.read().get(address).cloned()
    }

    pub fn contains(&self, address: &NodeAddress) -> bool {
        self.nodes.read().contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Merges records into the store. A record already present is replaced
    /// as a whole, never patched field by field.
    ///
    /// Fails without writing anything if a record would change the kind of an
    /// existing node.
    pub fn put(&self, nodes_by_id: HashMap<NodeAddress, Node>) -> Result<(), CacheError> {
        let mut nodes = self.nodes.write();
        for (address, node) in &nodes_by_id {
            if *address != node.address {
                return Err(CacheError::PreconditionViolation(format!(
                    "record for '{}' stored under key '{}'",
                    node.address, address
                )));
            }
            check_kind_unchanged(&nodes, node)?;
        }
        let count = nodes_by_id.len();
        nodes.extend(nodes_by_id);
        debug!(count, total = nodes.len(), "Merged nodes into tree cache");
        Ok(())
    }

    /// Writes `children` and the parent (with its child list rebuilt from
    /// `children`, in order) as one update.
    pub fn install_children(
        &self,
        parent_address: &NodeAddress,
        children: Vec<Node>,
    ) -> Result<HashMap<NodeAddress, Node>, CacheError> {
        let mut nodes = self.nodes.write();

        let mut parent = match nodes.get(parent_address) {
            Some(parent) => parent.clone(),
            None => {
                error!(parent = %parent_address, "install_children on an address absent from the cache");
                return Err(CacheError::PreconditionViolation(format!(
                    "cannot install children under unknown parent '{parent_address}'"
                )));
            }
        };
        if !parent.is_folder() {
            return Err(CacheError::PreconditionViolation(format!(
                "cannot install children under leaf '{parent_address}'"
            )));
        }
        {
            let mut seen = HashSet::with_capacity(children.len());
            for child in &children {
                if !seen.insert(&child.address) {
                    return Err(CacheError::PreconditionViolation(format!(
                        "child '{}' listed twice under '{parent_address}'",
                        child.address
                    )));
                }
                check_kind_unchanged(&nodes, child)?;
            }
        }

        parent.child_addresses = children.iter().map(|c| c.address.clone()).collect();
        parent.child_count = children.len();

        let installed: HashMap<NodeAddress, Node> = children
            .into_iter()
            .map(|c| (c.address.clone(), c))
            .collect();

        nodes.insert(parent.address.clone(), parent);
        for (address, node) in &installed {
            nodes.insert(address.clone(), node.clone());
        }
        debug!(
            parent = %parent_address,
            children = installed.len(),
            "Installed children in tree cache"
        );
        Ok(installed)
    }

    /// Children of `address` in server order, resolved under one read lock.
    /// `None` if the address is unknown.
    pub fn children(&self, address: &NodeAddress) -> Option<Vec<Node>> {
        let nodes = self.nodes.read();
        let parent = nodes.get(address)?;
        Some(
            parent
                .child_addresses
                .iter()
                .filter_map(|a| nodes.get(a).cloned())
                .collect(),
        )
    }

    /// Depth-first listing of everything reachable from `address` through
    /// expanded nodes, starting with `address` itself at depth 0.
    pub fn walk(&self, address: &NodeAddress) -> Vec<(usize, Node)> {
        let nodes = self.nodes.read();
        let mut out = Vec::new();
        let mut stack: Vec<(usize, &NodeAddress)> = vec![(0, address)];
        while let Some((depth, current)) = stack.pop() {
            let Some(node) = nodes.get(current) else {
                continue;
            };
            for child in node.child_addresses.iter().rev() {
                stack.push((depth + 1, child));
            }
            out.push((depth, node.clone()));
        }
        out
    }
}

fn check_kind_unchanged(nodes: &HashMap<NodeAddress, Node>, incoming: &Node) -> Result<(), CacheError> {
    match nodes.get(&incoming.address) {
        Some(existing) if existing.kind() != incoming.kind() => {
            Err(CacheError::PreconditionViolation(format!(
                "node '{}' cannot change kind from {:?} to {:?}",
                incoming.address,
                existing.kind(),
                incoming.kind()
            )))
        }
        _ => Ok(()),
    }
}
