use std::{cmp::Ordering, mem, ops::ControlFlow};

use smallvec::SmallVec;
use triomphe::Arc;

use crate::{
    error::Error,
    link::{Link, SharedNode, TreeCtx},
    node::Node,
    order::{KeyOrder, KeyOrderExt},
    store::BlobId,
};

/// A reversible position inside one tree, advanced in descending key order.
///
/// Descending order makes the cursor comparison O(1): a node position is
/// keyed by its cached max-key, so two cursors can be ordered without looking
/// inside either subtree, and subtrees that are identical by reference (or by
/// content id) are reached simultaneously and skipped whole.
struct Cursor<'a, K, V> {
    root: &'a Link<K, V>,
    /// Height of the root, resolved lazily the first time two node positions
    /// with equal keys must be depth-ordered.
    root_height: Option<usize>,
    /// Branch nodes descended through, with the child index at each level.
    spine: SmallVec<[(SharedNode<K, V>, usize); 8]>,
    at: At<K, V>,
}

enum At<K, V> {
    /// At a node boundary, not yet descended into it.
    Node {
        node: SharedNode<K, V>,
        id: Option<BlobId>,
    },
    /// At one entry of a leaf.
    Entry { leaf: SharedNode<K, V>, idx: usize },
    Done,
}

impl<'a, K, V> Cursor<'a, K, V> {
    fn start<C: KeyOrder<K>>(
        root: &'a Link<K, V>,
        ctx: &TreeCtx<'_, K, V, C>,
    ) -> Result<Self, Error> {
        let node = root.node(ctx)?;
        let at = if node.is_empty() {
            At::Done
        } else {
            At::Node {
                node,
                id: root.saved_id(),
            }
        };
        Ok(Cursor {
            root,
            root_height: None,
            spine: SmallVec::new(),
            at,
        })
    }

    /// Height of the current node above the leaves.
    fn level<C: KeyOrder<K>>(&mut self, ctx: &TreeCtx<'_, K, V, C>) -> Result<usize, Error> {
        let height = match self.root_height {
            Some(height) => height,
            None => {
                let mut height = 0;
                let mut node = self.root.node(ctx)?;
                while let Node::Branch(branch) = &*node {
                    height += 1;
                    let next = branch.children[0].node(ctx)?;
                    node = next;
                }
                self.root_height = Some(height);
                height
            }
        };
        Ok(height - self.spine.len())
    }

    #[inline]
    fn done(&self) -> bool {
        matches!(self.at, At::Done)
    }

    #[inline]
    fn at_entry(&self) -> bool {
        matches!(self.at, At::Entry { .. })
    }

    /// Largest key still reachable at the current position.
    fn key(&self) -> &K {
        match &self.at {
            At::Node { node, .. } => node.max_key().unwrap(),
            At::Entry { leaf, idx } => &leaf.as_leaf().keys[*idx],
            At::Done => unreachable!(),
        }
    }

    fn value(&self) -> Option<&V> {
        match &self.at {
            At::Entry { leaf, idx } => leaf.as_leaf().value_at(*idx),
            _ => unreachable!(),
        }
    }

    /// One level down toward the current max-key; entering a leaf lands on
    /// its last entry.
    fn descend<C: KeyOrder<K>>(&mut self, ctx: &TreeCtx<'_, K, V, C>) -> Result<(), Error> {
        let At::Node { node, .. } = mem::replace(&mut self.at, At::Done) else {
            unreachable!()
        };
        match &*node {
            Node::Leaf(leaf) => {
                let idx = leaf.keys.len() - 1;
                self.at = At::Entry {
                    leaf: node.clone(),
                    idx,
                };
            }
            Node::Branch(branch) => {
                let last = branch.children.len() - 1;
                let child = &branch.children[last];
                let at = At::Node {
                    node: child.node(ctx)?,
                    id: child.saved_id(),
                };
                self.spine.push((node.clone(), last));
                self.at = at;
            }
        }
        Ok(())
    }

    /// Moves to the next position in descending order once the current leaf
    /// entry or node is consumed: up the spine to the nearest level with a
    /// left sibling, which becomes the current (undescended) node.
    fn retreat<C: KeyOrder<K>>(&mut self, ctx: &TreeCtx<'_, K, V, C>) -> Result<(), Error> {
        while let Some((node, idx)) = self.spine.last_mut() {
            if *idx > 0 {
                *idx -= 1;
                let i = *idx;
                let parent = node.clone();
                let child = &parent.as_branch().children[i];
                self.at = At::Node {
                    node: child.node(ctx)?,
                    id: child.saved_id(),
                };
                return Ok(());
            }
            self.spine.pop();
        }
        self.at = At::Done;
        Ok(())
    }

    /// Step off a leaf entry.
    fn step<C: KeyOrder<K>>(&mut self, ctx: &TreeCtx<'_, K, V, C>) -> Result<(), Error> {
        match &mut self.at {
            At::Entry { idx, .. } if *idx > 0 => {
                *idx -= 1;
                Ok(())
            }
            At::Entry { .. } => self.retreat(ctx),
            _ => unreachable!(),
        }
    }

    /// Skip the whole subtree at the current node position.
    fn step_over<C: KeyOrder<K>>(&mut self, ctx: &TreeCtx<'_, K, V, C>) -> Result<(), Error> {
        debug_assert!(matches!(self.at, At::Node { .. }));
        self.retreat(ctx)
    }

    /// Whether both cursors stand at the same node, by pointer or content id.
    fn same_node(&self, other: &Self) -> bool {
        match (&self.at, &other.at) {
            (At::Node { node: a, id: ia }, At::Node { node: b, id: ib }) => {
                Arc::ptr_eq(a, b) || matches!((ia, ib), (Some(x), Some(y)) if x == y)
            }
            _ => false,
        }
    }
}

/// Two-cursor descending walk emitting the pairwise difference of two trees.
///
/// On equal current keys the cursor still at a node boundary descends
/// ("behind" normalization); when both stand at node boundaries referring to
/// the same node, both skip the subtree without entering it. Emission happens
/// only at leaf entries, so nothing is reported twice.
#[allow(clippy::too_many_arguments)]
pub(crate) fn diff_walk<K, V, C, R>(
    a_root: &Link<K, V>,
    b_root: &Link<K, V>,
    ctx_a: &TreeCtx<'_, K, V, C>,
    ctx_b: &TreeCtx<'_, K, V, C>,
    mut only_a: impl FnMut(&K, Option<&V>) -> ControlFlow<R>,
    mut only_b: impl FnMut(&K, Option<&V>) -> ControlFlow<R>,
    mut different: impl FnMut(&K, Option<&V>, Option<&V>) -> ControlFlow<R>,
) -> Result<Option<R>, Error>
where
    C: KeyOrder<K>,
    V: PartialEq,
{
    let order = ctx_a.order;
    let mut a = Cursor::start(a_root, ctx_a)?;
    let mut b = Cursor::start(b_root, ctx_b)?;
    loop {
        match (a.done(), b.done()) {
            (true, true) => return Ok(None),
            (false, true) => {
                if a.at_entry() {
                    if let ControlFlow::Break(r) = only_a(a.key(), a.value()) {
                        return Ok(Some(r));
                    }
                    a.step(ctx_a)?;
                } else {
                    a.descend(ctx_a)?;
                }
            }
            (true, false) => {
                if b.at_entry() {
                    if let ControlFlow::Break(r) = only_b(b.key(), b.value()) {
                        return Ok(Some(r));
                    }
                    b.step(ctx_b)?;
                } else {
                    b.descend(ctx_b)?;
                }
            }
            (false, false) => match order.cmp_or_err(a.key(), b.key())? {
                // a's key sorts above everything b still holds
                Ordering::Greater => {
                    if a.at_entry() {
                        if let ControlFlow::Break(r) = only_a(a.key(), a.value()) {
                            return Ok(Some(r));
                        }
                        a.step(ctx_a)?;
                    } else {
                        a.descend(ctx_a)?;
                    }
                }
                Ordering::Less => {
                    if b.at_entry() {
                        if let ControlFlow::Break(r) = only_b(b.key(), b.value()) {
                            return Ok(Some(r));
                        }
                        b.step(ctx_b)?;
                    } else {
                        b.descend(ctx_b)?;
                    }
                }
                Ordering::Equal => {
                    if !a.at_entry() && !b.at_entry() {
                        if a.same_node(&b) {
                            a.step_over(ctx_a)?;
                            b.step_over(ctx_b)?;
                        } else {
                            // normalize depths so nodes shared between the
                            // trees are reached simultaneously and skipped
                            let level_a = a.level(ctx_a)?;
                            let level_b = b.level(ctx_b)?;
                            if level_a > level_b {
                                a.descend(ctx_a)?;
                            } else if level_b > level_a {
                                b.descend(ctx_b)?;
                            } else {
                                a.descend(ctx_a)?;
                                b.descend(ctx_b)?;
                            }
                        }
                    } else if !a.at_entry() {
                        a.descend(ctx_a)?;
                    } else if !b.at_entry() {
                        b.descend(ctx_b)?;
                    } else {
                        if a.value() != b.value() {
                            if let ControlFlow::Break(r) = different(a.key(), a.value(), b.value())
                            {
                                return Ok(Some(r));
                            }
                        }
                        a.step(ctx_a)?;
                        b.step(ctx_b)?;
                    }
                }
            },
        }
    }
}
