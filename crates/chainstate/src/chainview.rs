//! A flat, height-indexed view of one branch of the block tree.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use btcnode_consensus::Hash256;

use crate::blocknode::{NodeAncestry, NodeRef};

/// Locator entries are dense for this many blocks below the tip, then sparse.
const LOCATOR_DENSE_ENTRIES: usize = 10;

#[derive(Default)]
pub struct ChainView {
    nodes: RwLock<Vec<NodeRef>>,
}

impl ChainView {
    pub fn new(tip: Option<&NodeRef>) -> Self {
        let view = Self::default();
        view.set_tip(tip);
        view
    }

    pub fn genesis(&self) -> Option<NodeRef> {
        self.read().first().cloned()
    }

    pub fn tip(&self) -> Option<NodeRef> {
        self.read().last().cloned()
    }

    /// Height of the tip, or -1 for an empty view.
    pub fn height(&self) -> i32 {
        self.read().len() as i32 - 1
    }

    /// Replaces the view with the branch ending at `tip`, reusing the shared prefix.
    pub fn set_tip(&self, tip: Option<&NodeRef>) {
        let mut nodes = self.write();
        let Some(tip) = tip else {
            nodes.clear();
            return;
        };

        let needed = tip.height as usize + 1;
        nodes.truncate(needed);

        // Collect the part of the new branch that the view does not share yet.
        let mut pending: Vec<NodeRef> = Vec::new();
        let mut cursor = Some(Arc::clone(tip));
        while let Some(node) = cursor {
            let height = node.height as usize;
            if nodes
                .get(height)
                .is_some_and(|existing| Arc::ptr_eq(existing, &node))
            {
                break;
            }
            cursor = node.parent.clone();
            pending.push(node);
        }

        if let Some(oldest) = pending.last() {
            nodes.truncate(oldest.height as usize);
        }
        nodes.extend(pending.into_iter().rev());
    }

    pub fn node_by_height(&self, height: i32) -> Option<NodeRef> {
        if height < 0 {
            return None;
        }
        self.read().get(height as usize).cloned()
    }

    pub fn contains(&self, node: &NodeRef) -> bool {
        Self::contains_in(&self.read(), node)
    }

    /// The successor of `node` in this view, when `node` is part of it.
    pub fn next(&self, node: &NodeRef) -> Option<NodeRef> {
        let nodes = self.read();
        if !Self::contains_in(&nodes, node) {
            return None;
        }
        nodes.get(node.height as usize + 1).cloned()
    }

    /// The newest block that is both in this view and an ancestor of `node`.
    pub fn find_fork(&self, node: Option<&NodeRef>) -> Option<NodeRef> {
        let node = node?;
        let nodes = self.read();
        let tip_height = nodes.len() as i32 - 1;
        let mut cursor = if node.height > tip_height {
            node.ancestor(tip_height)
        } else {
            Some(Arc::clone(node))
        };
        while let Some(candidate) = cursor {
            if Self::contains_in(&nodes, &candidate) {
                return Some(candidate);
            }
            cursor = candidate.parent.clone();
        }
        None
    }

    /// Hashes leading back from `node` (or the tip) to genesis: ten dense steps,
    /// then doubling gaps, always ending with genesis.
    pub fn block_locator(&self, node: Option<&NodeRef>) -> Vec<Hash256> {
        let nodes = self.read();
        let start = match node {
            Some(node) => Arc::clone(node),
            None => match nodes.last() {
                Some(tip) => Arc::clone(tip),
                None => return Vec::new(),
            },
        };

        let mut locator = Vec::with_capacity(Self::locator_capacity(start.height));
        let mut step: i32 = 1;
        let mut cursor = Some(start);
        while let Some(current) = cursor {
            locator.push(current.hash);
            if current.height == 0 {
                break;
            }
            let height = (current.height - step).max(0);
            // Heights on this branch come straight from the view; anything else
            // walks the node's own ancestry.
            cursor = if Self::contains_in(&nodes, &current) {
                nodes.get(height as usize).cloned()
            } else {
                current.ancestor(height)
            };
            if locator.len() > LOCATOR_DENSE_ENTRIES {
                step *= 2;
            }
        }
        locator
    }

    fn locator_capacity(height: i32) -> usize {
        if height <= LOCATOR_DENSE_ENTRIES as i32 {
            return height.max(0) as usize + 1;
        }
        let sparse = (height - LOCATOR_DENSE_ENTRIES as i32) as u32;
        LOCATOR_DENSE_ENTRIES + 2 + (u32::BITS - sparse.leading_zeros()) as usize
    }

    fn contains_in(nodes: &[NodeRef], node: &NodeRef) -> bool {
        node.height >= 0
            && nodes
                .get(node.height as usize)
                .is_some_and(|existing| Arc::ptr_eq(existing, node))
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<NodeRef>> {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<NodeRef>> {
        self.nodes.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocknode::tests::chain;

    #[test]
    fn set_tip_tracks_branches() {
        let main = chain(None, 10, 0);
        let side = chain(Some(&main[5]), 6, 1);

        let view = ChainView::new(Some(&main[9]));
        assert_eq!(view.height(), 9);
        assert!(view.contains(&main[7]));
        assert!(!view.contains(&side[0]));

        view.set_tip(Some(&side[5]));
        assert_eq!(view.height(), 11);
        assert!(view.contains(&main[5]));
        assert!(!view.contains(&main[6]));
        assert!(Arc::ptr_eq(&view.node_by_height(6).expect("fork child"), &side[0]));

        view.set_tip(Some(&main[3]));
        assert_eq!(view.height(), 3);
        assert!(Arc::ptr_eq(&view.tip().expect("tip"), &main[3]));

        view.set_tip(None);
        assert_eq!(view.height(), -1);
        assert!(view.tip().is_none());
        assert!(view.genesis().is_none());
    }

    #[test]
    fn next_and_fork_points() {
        let main = chain(None, 10, 0);
        let side = chain(Some(&main[4]), 3, 1);
        let view = ChainView::new(Some(&main[9]));

        assert!(Arc::ptr_eq(&view.next(&main[2]).expect("next"), &main[3]));
        assert!(view.next(&main[9]).is_none());
        assert!(view.next(&side[0]).is_none());

        let fork = view.find_fork(Some(&side[2])).expect("fork");
        assert!(Arc::ptr_eq(&fork, &main[4]));
        let fork = view.find_fork(Some(&main[6])).expect("own block");
        assert!(Arc::ptr_eq(&fork, &main[6]));
        assert!(view.find_fork(None).is_none());

        let longer = chain(Some(&main[9]), 5, 2);
        let fork = view.find_fork(Some(&longer[4])).expect("extension");
        assert!(Arc::ptr_eq(&fork, &main[9]));

        let unrelated = chain(None, 2, 3);
        assert!(view.find_fork(Some(&unrelated[1])).is_none());
        assert!(ChainView::new(Some(&unrelated[1]))
            .find_fork(Some(&main[9]))
            .is_none());
    }

    #[test]
    fn locator_thins_out() {
        let main = chain(None, 50, 0);
        let view = ChainView::new(Some(&main[49]));
        let locator = view.block_locator(None);
        let heights: Vec<i32> = locator
            .iter()
            .map(|hash| {
                main.iter()
                    .find(|node| node.hash == *hash)
                    .expect("known node")
                    .height
            })
            .collect();
        assert_eq!(
            heights,
            vec![49, 48, 47, 46, 45, 44, 43, 42, 41, 40, 39, 38, 36, 32, 24, 8, 0]
        );
    }

    #[test]
    fn locator_for_side_branch_uses_its_ancestors() {
        let main = chain(None, 20, 0);
        let side = chain(Some(&main[10]), 4, 1);
        let view = ChainView::new(Some(&main[19]));
        let locator = view.block_locator(Some(&side[3]));
        assert_eq!(locator[0], side[3].hash);
        assert_eq!(locator[4], main[10].hash);
        assert_eq!(*locator.last().expect("genesis"), main[0].hash);
        assert!(view.block_locator(Some(&main[0])) == vec![main[0].hash]);
    }

    #[test]
    fn empty_view_has_empty_locator() {
        let view = ChainView::new(None);
        assert!(view.block_locator(None).is_empty());
    }
}
