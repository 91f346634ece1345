use std::{
    cmp::Ordering,
    ops::{Bound, ControlFlow},
};

use crate::{
    error::Error,
    link::{Link, TreeCtx},
    node::{Branch, Node},
    order::{search, KeyOrder, KeyOrderExt},
    tree::try_merge,
};

/// Directive returned by an [edit_range](crate::Tree::edit_range) visitor for
/// the pair at hand.
#[derive(Debug)]
pub enum EditOp<V, R = ()> {
    /// Leave the pair as is.
    NoOp,
    /// Bind the key to the given value (or to no value).
    Replace(Option<V>),
    /// Remove the pair.
    Delete,
    /// Stop the scan, returning `R`.
    Break(R),
    /// Replace, then stop.
    ReplaceBreak(Option<V>, R),
    /// Remove, then stop.
    DeleteBreak(R),
}

fn past_hi<K, C: KeyOrder<K>>(order: &C, hi: Bound<&K>, key: &K) -> Result<bool, Error> {
    Ok(match hi {
        Bound::Unbounded => false,
        Bound::Included(h) => order.cmp_or_err(key, h)? == Ordering::Greater,
        Bound::Excluded(h) => order.cmp_or_err(key, h)? != Ordering::Less,
    })
}

/// First in-bounds index of a leaf.
fn leaf_start<K, C: KeyOrder<K>>(
    keys: &[K],
    lo: Bound<&K>,
    order: &C,
) -> Result<usize, Error> {
    Ok(match lo {
        Bound::Unbounded => 0,
        Bound::Included(l) => match search(keys, l, order)? {
            Ok(i) | Err(i) => i,
        },
        Bound::Excluded(l) => match search(keys, l, order)? {
            Ok(i) => i + 1,
            Err(i) => i,
        },
    })
}

/// Inclusive child index span of a branch that can intersect the bounds.
/// Over-approximation is fine (the leaf checks are exact); children outside
/// the span cannot hold in-bounds keys.
fn child_span<K, V, C: KeyOrder<K>>(
    branch: &Branch<K, V>,
    lo: Bound<&K>,
    hi: Bound<&K>,
    order: &C,
) -> Result<Option<(usize, usize)>, Error> {
    let n = branch.children.len();
    if n == 0 {
        return Ok(None);
    }
    let i_lo = match lo {
        Bound::Unbounded => 0,
        Bound::Included(l) => match search(&branch.keys, l, order)? {
            Ok(i) | Err(i) => i,
        },
        // a child whose max equals the bound holds nothing above it
        Bound::Excluded(l) => match search(&branch.keys, l, order)? {
            Ok(i) => i + 1,
            Err(i) => i,
        },
    };
    if i_lo >= n {
        return Ok(None);
    }
    let i_hi = match hi {
        Bound::Unbounded => n - 1,
        Bound::Included(h) | Bound::Excluded(h) => match search(&branch.keys, h, order)? {
            Ok(i) | Err(i) => i.min(n - 1),
        },
    };
    Ok((i_lo <= i_hi).then_some((i_lo, i_hi)))
}

pub(crate) fn read_scan<K, V, C, R>(
    link: &Link<K, V>,
    ctx: &TreeCtx<'_, K, V, C>,
    lo: Bound<&K>,
    hi: Bound<&K>,
    count: &mut u64,
    visit: &mut dyn FnMut(&K, Option<&V>) -> ControlFlow<R>,
) -> Result<ControlFlow<R>, Error>
where
    C: KeyOrder<K>,
{
    let node = link.node(ctx)?;
    match &*node {
        Node::Leaf(leaf) => {
            let mut i = leaf_start(&leaf.keys, lo, ctx.order)?;
            while i < leaf.keys.len() {
                let key = &leaf.keys[i];
                if past_hi(ctx.order, hi, key)? {
                    break;
                }
                *count += 1;
                if let ControlFlow::Break(r) = visit(key, leaf.value_at(i)) {
                    return Ok(ControlFlow::Break(r));
                }
                i += 1;
            }
            Ok(ControlFlow::Continue(()))
        }
        Node::Branch(branch) => {
            let Some((i_lo, i_hi)) = child_span(branch, lo, hi, ctx.order)? else {
                return Ok(ControlFlow::Continue(()));
            };
            for i in i_lo..=i_hi {
                if let ControlFlow::Break(r) =
                    read_scan(&branch.children[i], ctx, lo, hi, count, visit)?
                {
                    return Ok(ControlFlow::Break(r));
                }
            }
            Ok(ControlFlow::Continue(()))
        }
    }
}

/// The edit-mode traversal behind `edit_range` and `delete_range`. Visited
/// children are cloned-on-write on descent; parent max-key caches refresh as
/// each child returns; afterwards a downward sweep over the touched span
/// (plus one child below it) drops emptied children and merges under-full
/// neighbors. The sweep runs on early break too, so the tree is valid at
/// every exit.
#[allow(clippy::too_many_arguments)]
pub(crate) fn edit_scan<K, V, C, R>(
    link: &mut Link<K, V>,
    ctx: &TreeCtx<'_, K, V, C>,
    fanout: usize,
    lo: Bound<&K>,
    hi: Bound<&K>,
    count: &mut u64,
    removed: &mut u64,
    edit: &mut dyn FnMut(&K, Option<&V>) -> EditOp<V, R>,
) -> Result<ControlFlow<R>, Error>
where
    K: Clone,
    V: Clone,
    C: KeyOrder<K>,
{
    match link.node_mut(ctx)? {
        Node::Leaf(leaf) => {
            let mut i = leaf_start(&leaf.keys, lo, ctx.order)?;
            while i < leaf.keys.len() {
                if past_hi(ctx.order, hi, &leaf.keys[i])? {
                    break;
                }
                *count += 1;
                match edit(&leaf.keys[i], leaf.value_at(i)) {
                    EditOp::NoOp => i += 1,
                    EditOp::Replace(value) => {
                        leaf.set_value_at(i, value);
                        i += 1;
                    }
                    // deletion shifts the next pair into this index
                    EditOp::Delete => {
                        leaf.remove_at(i);
                        *removed += 1;
                    }
                    EditOp::Break(r) => return Ok(ControlFlow::Break(r)),
                    EditOp::ReplaceBreak(value, r) => {
                        leaf.set_value_at(i, value);
                        return Ok(ControlFlow::Break(r));
                    }
                    EditOp::DeleteBreak(r) => {
                        leaf.remove_at(i);
                        *removed += 1;
                        return Ok(ControlFlow::Break(r));
                    }
                }
            }
            Ok(ControlFlow::Continue(()))
        }
        Node::Branch(branch) => {
            let Some((i_lo, i_hi)) = child_span(branch, lo, hi, ctx.order)? else {
                return Ok(ControlFlow::Continue(()));
            };
            let mut flow = ControlFlow::Continue(());
            for i in i_lo..=i_hi {
                flow = edit_scan(
                    &mut branch.children[i],
                    ctx,
                    fanout,
                    lo,
                    hi,
                    count,
                    removed,
                    edit,
                )?;
                if let Some(max) = branch.children[i].node(ctx)?.max_key() {
                    branch.keys[i] = max.clone();
                }
                if flow.is_break() {
                    break;
                }
            }
            let stop = i_lo.saturating_sub(1);
            let mut i = i_hi;
            loop {
                let len = branch.children[i].node(ctx)?.len();
                if len == 0 {
                    branch.remove_child_at(i);
                } else if len <= fanout / 2 {
                    try_merge(branch, i, ctx, fanout)?;
                }
                if i == stop {
                    break;
                }
                i -= 1;
            }
            Ok(flow)
        }
    }
}
