//! Route resolution over an arena of routers.
//!
//! Routers are addressed by [`NodeId`] handles. Parent and child links are
//! stored as handles, never as owning references, so the tree can be walked
//! from either direction without reference cycles.
//!
//! ```text
//!            root (route 0x0)
//!           /            \
//!     adapter 1        adapter 3
//!   route 0x01        route 0x03
//!         |
//!     adapter 5
//!   route 0x0501
//! ```

use std::collections::HashMap;

use crate::error::{Result, TbError};
use crate::protocol::Route;
use crate::transport::NodeId;

struct TreeNode<T> {
    value: T,
    route: Route,
    parent: Option<NodeId>,
    /// Child per adapter number; `None` until the router's adapter count is
    /// known. Index 0 is the upstream interface and never holds a child.
    adapters: Option<Vec<Option<NodeId>>>,
}

/// Arena-backed router tree keyed by [`NodeId`].
pub struct RouterTree<T> {
    nodes: HashMap<NodeId, TreeNode<T>>,
    root: Option<NodeId>,
    next_id: u64,
}

impl<T> RouterTree<T> {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            root: None,
            next_id: 0,
        }
    }

    /// Reserve a fresh handle. Handles are never reused.
    pub fn allocate_id(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }

    #[inline]
    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: NodeId) -> Option<&T> {
        self.nodes.get(&id).map(|node| &node.value)
    }

    pub fn route(&self, id: NodeId) -> Option<Route> {
        self.nodes.get(&id).map(|node| node.route)
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(&id).and_then(|node| node.parent)
    }

    /// Child reached through `adapter`, if any.
    pub fn child(&self, id: NodeId, adapter: u8) -> Option<NodeId> {
        let adapters = self.nodes.get(&id)?.adapters.as_ref()?;
        adapters.get(adapter as usize).copied().flatten()
    }

    /// Occupied adapter slots of `id` in adapter order.
    pub fn children(&self, id: NodeId) -> Vec<(u8, NodeId)> {
        let Some(adapters) = self.nodes.get(&id).and_then(|n| n.adapters.as_ref()) else {
            return Vec::new();
        };
        adapters
            .iter()
            .enumerate()
            .filter_map(|(adapter, slot)| slot.map(|child| (adapter as u8, child)))
            .collect()
    }

    /// `id` and all routers below it, children before their parents.
    pub fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        if self.nodes.contains_key(&id) {
            self.collect_post_order(id, &mut order);
        }
        order
    }

    fn collect_post_order(&self, id: NodeId, order: &mut Vec<NodeId>) {
        for (_, child) in self.children(id) {
            self.collect_post_order(child, order);
        }
        order.push(id);
    }

    /// Install the host router.
    pub fn insert_root(&mut self, id: NodeId, value: T) -> Result<()> {
        if self.root.is_some() {
            return Err(TbError::AlreadyExists);
        }
        self.nodes.insert(
            id,
            TreeNode {
                value,
                route: Route::ROOT,
                parent: None,
                adapters: None,
            },
        );
        self.root = Some(id);
        Ok(())
    }

    /// Link a child under `parent` at the adapter named by the route's last
    /// hop. Never overwrites an occupied slot.
    pub fn insert(&mut self, parent: NodeId, id: NodeId, route: Route, value: T) -> Result<()> {
        route.validate()?;
        let parent_node = self.nodes.get_mut(&parent).ok_or(TbError::NotFound)?;

        if route.depth() != parent_node.route.depth() + 1
            || route.parent() != Some(parent_node.route)
        {
            return Err(TbError::InvalidRoute(format!(
                "route {} is not one hop below {}",
                route, parent_node.route
            )));
        }

        let adapters = parent_node.adapters.as_mut().ok_or(TbError::NotFound)?;
        let hop = route.last_hop().unwrap_or(0) as usize;
        let slot = match adapters.get_mut(hop) {
            Some(slot) if hop != 0 => slot,
            _ => {
                return Err(TbError::InvalidRoute(format!(
                    "adapter {} out of range for {}",
                    hop, parent_node.route
                )))
            }
        };
        if slot.is_some() {
            return Err(TbError::AlreadyExists);
        }
        *slot = Some(id);

        self.nodes.insert(
            id,
            TreeNode {
                value,
                route,
                parent: Some(parent),
                adapters: None,
            },
        );
        Ok(())
    }

    /// Allocate the adapter table of `id` for adapters `1..=max_adapter`.
    pub fn set_adapter_count(&mut self, id: NodeId, max_adapter: u8) -> Result<()> {
        let node = self.nodes.get_mut(&id).ok_or(TbError::NotFound)?;
        if node.adapters.is_some() {
            return Err(TbError::AlreadyExists);
        }
        node.adapters = Some(vec![None; max_adapter as usize + 1]);
        Ok(())
    }

    /// Resolve a route to the router inserted with it.
    ///
    /// Descends one hop at a time from the root, lowest-order hop first.
    pub fn lookup(&self, route: Route) -> Result<NodeId> {
        let mut current = self.root.ok_or(TbError::NotFound)?;
        if route.is_root() {
            return Ok(current);
        }

        for level in 0..route.depth() {
            let hop = route.hop(level);
            if hop == 0 {
                return Err(TbError::NotFound);
            }
            let node = self.nodes.get(&current).ok_or(TbError::NotFound)?;
            let adapters = node.adapters.as_ref().ok_or(TbError::NotFound)?;
            let slot = adapters.get(hop as usize).ok_or_else(|| {
                TbError::InvalidRoute(format!(
                    "adapter {} exceeds the {} adapters of {}",
                    hop,
                    adapters.len().saturating_sub(1),
                    node.route
                ))
            })?;
            current = slot.ok_or(TbError::NotFound)?;

            let reached = self.nodes.get(&current).ok_or(TbError::NotFound)?;
            if reached.route == route {
                return Ok(current);
            }
        }
        Err(TbError::NotFound)
    }

    /// Remove a router that has no children, unlinking it from its parent.
    pub fn remove(&mut self, id: NodeId) -> Result<T> {
        let node = self.nodes.get(&id).ok_or(TbError::NotFound)?;
        if node
            .adapters
            .as_ref()
            .is_some_and(|adapters| adapters.iter().any(Option::is_some))
        {
            return Err(TbError::Busy);
        }

        let parent = node.parent;
        let hop = node.route.last_hop();
        if let (Some(parent), Some(hop)) = (parent, hop) {
            if let Some(slot) = self
                .nodes
                .get_mut(&parent)
                .and_then(|p| p.adapters.as_mut())
                .and_then(|adapters| adapters.get_mut(hop as usize))
            {
                if *slot == Some(id) {
                    *slot = None;
                }
            }
        }
        if self.root == Some(id) {
            self.root = None;
        }

        self.nodes
            .remove(&id)
            .map(|node| node.value)
            .ok_or(TbError::NotFound)
    }
}

impl<T> Default for RouterTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Root with 8 adapters, a child at adapter 1 with 4 adapters.
    fn small_tree() -> (RouterTree<&'static str>, NodeId, NodeId) {
        let mut tree = RouterTree::new();
        let root = tree.allocate_id();
        tree.insert_root(root, "root").unwrap();
        tree.set_adapter_count(root, 8).unwrap();

        let child = tree.allocate_id();
        tree.insert(root, child, Route::new(0x01), "child").unwrap();
        tree.set_adapter_count(child, 4).unwrap();
        (tree, root, child)
    }

    #[test]
    fn test_lookup_finds_inserted_routers() {
        let (mut tree, root, child) = small_tree();
        let grandchild = tree.allocate_id();
        tree.insert(child, grandchild, Route::new(0x0301), "grandchild")
            .unwrap();

        assert_eq!(tree.lookup(Route::ROOT).unwrap(), root);
        assert_eq!(tree.lookup(Route::new(0x01)).unwrap(), child);
        assert_eq!(tree.lookup(Route::new(0x0301)).unwrap(), grandchild);
        assert_eq!(tree.get(grandchild), Some(&"grandchild"));
        assert_eq!(tree.parent(grandchild), Some(child));
    }

    #[test]
    fn test_lookup_failures() {
        let (tree, _, _) = small_tree();

        // empty slot
        assert!(matches!(tree.lookup(Route::new(0x02)), Err(TbError::NotFound)));
        // zero hop before the target
        assert!(matches!(tree.lookup(Route::new(0x0100)), Err(TbError::NotFound)));
        // hop beyond the root's adapter count
        assert!(matches!(
            tree.lookup(Route::new(0x09)),
            Err(TbError::InvalidRoute(_))
        ));
        // child has an adapter table but nothing at adapter 2
        assert!(matches!(tree.lookup(Route::new(0x0201)), Err(TbError::NotFound)));
    }

    #[test]
    fn test_lookup_without_adapter_table() {
        let mut tree = RouterTree::new();
        let root = tree.allocate_id();
        tree.insert_root(root, ()).unwrap();
        assert!(matches!(tree.lookup(Route::new(0x01)), Err(TbError::NotFound)));
        assert!(matches!(
            RouterTree::<()>::new().lookup(Route::ROOT),
            Err(TbError::NotFound)
        ));
    }

    #[test]
    fn test_insert_never_overwrites() {
        let (mut tree, root, child) = small_tree();
        let dup = tree.allocate_id();
        assert!(matches!(
            tree.insert(root, dup, Route::new(0x01), "dup"),
            Err(TbError::AlreadyExists)
        ));
        assert_eq!(tree.lookup(Route::new(0x01)).unwrap(), child);
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn test_insert_rejects_bad_routes() {
        let (mut tree, root, child) = small_tree();
        let id = tree.allocate_id();

        // two hops below the root
        assert!(matches!(
            tree.insert(root, id, Route::new(0x0201), "x"),
            Err(TbError::InvalidRoute(_))
        ));
        // one hop below, but under a different parent
        assert!(matches!(
            tree.insert(child, id, Route::new(0x02), "x"),
            Err(TbError::InvalidRoute(_))
        ));
        // adapter beyond the parent's table
        assert!(matches!(
            tree.insert(root, id, Route::new(0x09), "x"),
            Err(TbError::InvalidRoute(_))
        ));
        // zero hop inside the route
        assert!(matches!(
            tree.insert(child, id, Route::new(0x01_0001), "x"),
            Err(TbError::InvalidRoute(_))
        ));
    }

    #[test]
    fn test_insert_requires_adapter_table() {
        let mut tree = RouterTree::new();
        let root = tree.allocate_id();
        tree.insert_root(root, ()).unwrap();
        let id = tree.allocate_id();
        assert!(matches!(
            tree.insert(root, id, Route::new(0x01), ()),
            Err(TbError::NotFound)
        ));
    }

    #[test]
    fn test_subtree_and_remove() {
        let (mut tree, root, child) = small_tree();
        let leaf = tree.allocate_id();
        tree.insert(child, leaf, Route::new(0x0401), "leaf").unwrap();

        assert_eq!(tree.subtree(child), vec![leaf, child]);
        assert_eq!(tree.children(root), vec![(1, child)]);

        assert!(matches!(tree.remove(child), Err(TbError::Busy)));
        for id in tree.subtree(child) {
            tree.remove(id).unwrap();
        }
        assert!(matches!(tree.lookup(Route::new(0x01)), Err(TbError::NotFound)));
        assert!(tree.children(root).is_empty());
        assert_eq!(tree.len(), 1);

        // the freed slot can be reused
        let again = tree.allocate_id();
        tree.insert(root, again, Route::new(0x01), "again").unwrap();
        assert_eq!(tree.lookup(Route::new(0x01)).unwrap(), again);
    }
}
