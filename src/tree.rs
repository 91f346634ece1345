use std::{
    cell::Cell,
    cmp::Ordering,
    convert::Infallible,
    fmt, mem,
    ops::{Bound, ControlFlow, RangeBounds},
    sync::Arc,
};

use serde::{de::DeserializeOwned, Serialize};

use crate::{
    diff,
    error::{error_validation, Error},
    link::{Codec, Link, TreeCtx},
    node::{Branch, Leaf, LeafValues, Node},
    options::TreeOptions,
    order::{search, KeyOrder, KeyOrderExt, NaturalOrder},
    scan::{self, EditOp},
    store::{BlobId, BlobStore},
};

/// Builds a [TreeCtx] from disjoint field borrows, leaving `root` free for
/// mutable access in the same scope.
macro_rules! tree_ctx {
    ($tree:expr) => {
        TreeCtx {
            store: $tree.store.as_deref(),
            codec: $tree.codec.as_ref(),
            order: &$tree.order,
        }
    };
}

/// Ordered key-value map backed by an in-memory B+Tree.
///
/// Two capabilities distinguish it from `std::collections::BTreeMap`:
///
/// * **O(1) clones.** [Clone] shares the node graph between the two trees;
///   subsequent edits copy-on-write only the touched root-to-leaf paths, so
///   clones are cheap regardless of tree size and the copies never observe
///   each other's edits.
/// * **Content-addressed persistence.** With a [BlobStore] attached, [commit]
///   serializes every changed node, names it by the blake3 hash of its bytes
///   and returns the root id. [open] re-attaches such a root without fetching
///   anything; nodes rehydrate lazily as operations first touch them.
///
/// Keys are ordered by a pluggable [KeyOrder]; the same order value must be
/// used for every operation on a given tree. Keys the order cannot place
/// (NaN under [NaturalOrder]) are rejected with [Error::UnorderableKey]
/// before any structural change.
///
/// A tree is owned by one logical task at a time; it is not internally
/// synchronized.
///
/// [commit]: Tree::commit
/// [open]: Tree::open
pub struct Tree<K, V, C = NaturalOrder> {
    root: Link<K, V>,
    /// `None` after [Tree::load] until the first [Tree::len] rescan (pair
    /// counts are not persisted in node blobs).
    len: Cell<Option<u64>>,
    fanout: usize,
    order: C,
    frozen: bool,
    store: Option<Arc<dyn BlobStore>>,
    codec: Option<Codec<K, V>>,
}

enum SetOutcome {
    Added,
    Replaced,
    Skipped,
}

impl<K, V, C: fmt::Debug> fmt::Debug for Tree<K, V, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tree")
            .field("len", &self.len.get())
            .field("fanout", &self.fanout)
            .field("order", &self.order)
            .field("frozen", &self.frozen)
            .field("root", &self.root)
            .finish()
    }
}

impl<K, V, C: Clone> Clone for Tree<K, V, C> {
    /// O(1) structural clone.
    ///
    /// Both trees remain mutable and independent: the shared nodes are cloned
    /// on first write along whichever paths either tree touches. The frozen
    /// bit is carried over.
    fn clone(&self) -> Self {
        Tree {
            root: self.root.clone(),
            len: self.len.clone(),
            fanout: self.fanout,
            order: self.order.clone(),
            frozen: self.frozen,
            store: self.store.clone(),
            codec: self.codec,
        }
    }
}

impl<K, V> Tree<K, V> {
    /// An empty tree with default options.
    pub fn new() -> Self {
        Self::with_options(TreeOptions::default())
    }
}

impl<K, V> Default for Tree<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, C> Tree<K, V, C> {
    /// An empty tree with the given options.
    pub fn with_options(options: TreeOptions<C>) -> Self {
        Tree {
            root: Link::from_node(Node::empty_leaf()),
            len: Cell::new(Some(0)),
            fanout: options.clamped_fanout(),
            order: options.order,
            frozen: false,
            store: None,
            codec: None,
        }
    }

    /// Freezes the tree: every mutating call fails with [Error::Frozen] until
    /// [Tree::unfreeze].
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Restores mutability after [Tree::freeze].
    pub fn unfreeze(&mut self) {
        self.frozen = false;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Content id of the root as of the last [Tree::commit] or [Tree::load],
    /// `None` if the tree changed since (or was never committed).
    pub fn root_id(&self) -> Option<BlobId> {
        self.root.saved_id()
    }

    #[inline]
    fn check_mutable(&self) -> Result<(), Error> {
        if self.frozen {
            Err(Error::Frozen)
        } else {
            Ok(())
        }
    }

    #[inline]
    fn add_len(&self, delta: i64) {
        if let Some(len) = self.len.get() {
            self.len.set(Some(len.wrapping_add_signed(delta)));
        }
    }
}

impl<K, V, C> Tree<K, V, C>
where
    K: Clone + Serialize + DeserializeOwned,
    V: Clone + Serialize + DeserializeOwned,
{
    /// An empty tree that can [commit](Tree::commit) to (and lazily load
    /// from) `store`.
    pub fn attached(store: Arc<dyn BlobStore>, options: TreeOptions<C>) -> Self {
        let mut tree = Self::with_options(options);
        tree.store = Some(store);
        tree.codec = Some(Codec::json());
        tree
    }

    /// A tree rooted at a previously committed `root_id`.
    ///
    /// Nothing is fetched up front; nodes materialize from `store` as
    /// operations first touch them. The pair count is unknown until the first
    /// [Tree::len] call rescans it.
    pub fn open(store: Arc<dyn BlobStore>, root_id: BlobId, options: TreeOptions<C>) -> Self {
        let mut tree = Self::attached(store, options);
        tree.root = Link::from_id(root_id);
        tree.len.set(None);
        tree
    }
}

impl<K, V, C> Tree<K, V, C>
where
    K: Clone,
    V: Clone,
    C: KeyOrder<K>,
{
    /// A tree initialized from `pairs` (later duplicates overwrite earlier
    /// ones).
    pub fn from_pairs(
        pairs: impl IntoIterator<Item = (K, V)>,
        options: TreeOptions<C>,
    ) -> Result<Self, Error> {
        let mut tree = Self::with_options(options);
        tree.set_pairs(pairs, true)?;
        Ok(tree)
    }

    /// Number of key-value pairs.
    ///
    /// O(1) except on a freshly [open](Tree::open)ed tree, where the count is
    /// recomputed by one full scan and cached.
    pub fn len(&self) -> Result<u64, Error> {
        if let Some(len) = self.len.get() {
            return Ok(len);
        }
        let ctx = tree_ctx!(self);
        let mut count = 0;
        let mut visit = |_: &K, _: Option<&V>| ControlFlow::<Infallible>::Continue(());
        let _ = scan::read_scan(
            &self.root,
            &ctx,
            Bound::Unbounded,
            Bound::Unbounded,
            &mut count,
            &mut visit,
        )?;
        self.len.set(Some(count));
        Ok(count)
    }

    pub fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.len()? == 0)
    }

    /// Number of branch levels above the leaves (0 for a leaf-only tree).
    pub fn height(&self) -> Result<usize, Error> {
        let ctx = tree_ctx!(self);
        let mut height = 0;
        let mut node = self.root.node(&ctx)?;
        loop {
            let next = match &*node {
                Node::Leaf(_) => return Ok(height),
                Node::Branch(branch) => branch.children[0].node(&ctx)?,
            };
            height += 1;
            node = next;
        }
    }

    /// Returns the value bound to `key`, `None` when the key is absent or
    /// bound to no value.
    pub fn get(&self, key: &K) -> Result<Option<V>, Error> {
        let ctx = tree_ctx!(self);
        let mut node = self.root.node(&ctx)?;
        loop {
            let next = match &*node {
                Node::Leaf(leaf) => {
                    return Ok(match search(&leaf.keys, key, ctx.order)? {
                        Ok(i) => leaf.value_at(i).cloned(),
                        Err(_) => None,
                    })
                }
                Node::Branch(branch) => {
                    let i = branch.route(key, ctx.order)?;
                    branch.children[i].node(&ctx)?
                }
            };
            node = next;
        }
    }

    /// Whether `key` is present (even if bound to no value).
    pub fn has(&self, key: &K) -> Result<bool, Error> {
        let ctx = tree_ctx!(self);
        let mut node = self.root.node(&ctx)?;
        loop {
            let next = match &*node {
                Node::Leaf(leaf) => return Ok(search(&leaf.keys, key, ctx.order)?.is_ok()),
                Node::Branch(branch) => {
                    let i = branch.route(key, ctx.order)?;
                    branch.children[i].node(&ctx)?
                }
            };
            node = next;
        }
    }

    /// Smallest key, O(log n).
    pub fn min_key(&self) -> Result<Option<K>, Error> {
        let ctx = tree_ctx!(self);
        let mut node = self.root.node(&ctx)?;
        loop {
            let next = match &*node {
                Node::Leaf(leaf) => return Ok(leaf.keys.first().cloned()),
                Node::Branch(branch) => branch.children[0].node(&ctx)?,
            };
            node = next;
        }
    }

    /// Largest key, O(1) via the root's cached max (no descent, no child
    /// loads).
    pub fn max_key(&self) -> Result<Option<K>, Error> {
        let ctx = tree_ctx!(self);
        Ok(self.root.node(&ctx)?.max_key().cloned())
    }

    /// The pair at `Included(key)`, or the nearest pair below it; the pair
    /// strictly below `Excluded(key)`; the max pair for `Unbounded`.
    pub fn pair_or_next_lower(&self, key: Bound<&K>) -> Result<Option<(K, Option<V>)>, Error> {
        let ctx = tree_ctx!(self);
        seek_floor(&self.root, key, &ctx)
    }

    /// The pair at `Included(key)`, or the nearest pair above it; the pair
    /// strictly above `Excluded(key)`; the min pair for `Unbounded`.
    pub fn pair_or_next_higher(&self, key: Bound<&K>) -> Result<Option<(K, Option<V>)>, Error> {
        let ctx = tree_ctx!(self);
        seek_ceil(&self.root, key, &ctx)
    }

    /// The pair strictly below `key`.
    pub fn next_lower_pair(&self, key: &K) -> Result<Option<(K, Option<V>)>, Error> {
        self.pair_or_next_lower(Bound::Excluded(key))
    }

    /// The pair strictly above `key`.
    pub fn next_higher_pair(&self, key: &K) -> Result<Option<(K, Option<V>)>, Error> {
        self.pair_or_next_higher(Bound::Excluded(key))
    }

    pub fn first_pair(&self) -> Result<Option<(K, Option<V>)>, Error> {
        self.pair_or_next_higher(Bound::Unbounded)
    }

    pub fn last_pair(&self) -> Result<Option<(K, Option<V>)>, Error> {
        self.pair_or_next_lower(Bound::Unbounded)
    }

    /// Inserts or overwrites, returning whether a new pair was added. On
    /// overwrite both the stored key and the value are replaced (permitting
    /// key edits that preserve sort order).
    pub fn set(&mut self, key: K, value: V) -> Result<bool, Error> {
        self.set_opt(key, Some(value), true)
    }

    /// Inserts unless the key already exists (then a no-op returning false).
    pub fn set_if_absent(&mut self, key: K, value: V) -> Result<bool, Error> {
        self.set_opt(key, Some(value), false)
    }

    pub(crate) fn set_opt(
        &mut self,
        key: K,
        value: Option<V>,
        overwrite: bool,
    ) -> Result<bool, Error> {
        self.check_mutable()?;
        let ctx = tree_ctx!(self);
        let (outcome, split) = set_node(&mut self.root, key, value, overwrite, &ctx, self.fanout)?;
        if let Some(sibling) = split {
            // grow upward: the old root and the new sibling become the two
            // children of a fresh root
            let left_max = self.root.node(&ctx)?.max_key().cloned().unwrap();
            let right_max = sibling.max_key().cloned().unwrap();
            let left = mem::replace(&mut self.root, Link::from_node(Node::empty_leaf()));
            self.root = Link::from_node(Node::Branch(Branch {
                keys: vec![left_max, right_max],
                children: vec![left, Link::from_node(sibling)],
            }));
            trace!("root split, tree grew a level");
        }
        match outcome {
            SetOutcome::Added => {
                self.add_len(1);
                Ok(true)
            }
            SetOutcome::Replaced | SetOutcome::Skipped => Ok(false),
        }
    }

    /// Inserts every pair, returning how many were newly added.
    pub fn set_pairs(
        &mut self,
        pairs: impl IntoIterator<Item = (K, V)>,
        overwrite: bool,
    ) -> Result<u64, Error> {
        let mut added = 0;
        for (key, value) in pairs {
            if self.set_opt(key, Some(value), overwrite)? {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Removes `key`, returning whether a pair was removed.
    pub fn delete(&mut self, key: &K) -> Result<bool, Error> {
        self.check_mutable()?;
        // read-only probe first so a miss never clones the path
        if !self.has(key)? {
            return Ok(false);
        }
        let ctx = tree_ctx!(self);
        remove_node(&mut self.root, key, &ctx, self.fanout)?;
        self.collapse_root()?;
        self.add_len(-1);
        Ok(true)
    }

    /// Ascending visit of every pair in `range`. The visitor may stop early
    /// by returning `ControlFlow::Break`; otherwise the visited pair count is
    /// returned.
    pub fn for_range<R>(
        &self,
        range: impl RangeBounds<K>,
        mut visit: impl FnMut(&K, Option<&V>) -> ControlFlow<R>,
    ) -> Result<ControlFlow<R, u64>, Error> {
        let ctx = tree_ctx!(self);
        let mut count = 0;
        let flow = scan::read_scan(
            &self.root,
            &ctx,
            range.start_bound(),
            range.end_bound(),
            &mut count,
            &mut visit,
        )?;
        Ok(match flow {
            ControlFlow::Break(r) => ControlFlow::Break(r),
            ControlFlow::Continue(()) => ControlFlow::Continue(count),
        })
    }

    /// Ascending list of the pairs in `range`, at most `max_len` of them.
    pub fn get_range(
        &self,
        range: impl RangeBounds<K>,
        max_len: usize,
    ) -> Result<Vec<(K, Option<V>)>, Error> {
        let mut out = Vec::new();
        if max_len == 0 {
            return Ok(out);
        }
        let _ = self.for_range(range, |key, value| {
            out.push((key.clone(), value.cloned()));
            if out.len() >= max_len {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })?;
        Ok(out)
    }

    /// Every pair in ascending order.
    pub fn pairs(&self) -> Result<Vec<(K, Option<V>)>, Error> {
        self.get_range(.., usize::MAX)
    }

    /// Ascending visit of `range` where each directive may replace the
    /// current value, delete the pair, stop early, or combinations thereof
    /// (see [EditOp]).
    ///
    /// The visited children are cloned-on-write up front, so a break leaves
    /// the edits made so far in place and the tree valid. The visitor runs
    /// while the tree is exclusively borrowed and therefore cannot touch it
    /// out of band.
    pub fn edit_range<R>(
        &mut self,
        range: impl RangeBounds<K>,
        mut edit: impl FnMut(&K, Option<&V>) -> EditOp<V, R>,
    ) -> Result<ControlFlow<R, u64>, Error> {
        self.check_mutable()?;
        let mut count = 0;
        let mut removed = 0;
        let flow = {
            let ctx = tree_ctx!(self);
            scan::edit_scan(
                &mut self.root,
                &ctx,
                self.fanout,
                range.start_bound(),
                range.end_bound(),
                &mut count,
                &mut removed,
                &mut edit,
            )?
        };
        self.add_len(-(removed as i64));
        self.collapse_root()?;
        Ok(match flow {
            ControlFlow::Break(r) => ControlFlow::Break(r),
            ControlFlow::Continue(()) => ControlFlow::Continue(count),
        })
    }

    /// Deletes every pair in `range`, returning how many were removed.
    pub fn delete_range(&mut self, range: impl RangeBounds<K>) -> Result<u64, Error> {
        let edit = |_: &K, _: Option<&V>| -> EditOp<V, Infallible> { EditOp::Delete };
        match self.edit_range(range, edit)? {
            ControlFlow::Continue(count) => Ok(count),
            ControlFlow::Break(never) => match never {},
        }
    }

    /// Removes all pairs.
    pub fn clear(&mut self) -> Result<(), Error> {
        self.delete_range(..)?;
        Ok(())
    }

    /// Eager clone: duplicates every node this tree owns exclusively (all of
    /// them with `force`), so the source tree keeps sole ownership of its
    /// nodes and later edits on either side skip the copy-on-write cloning
    /// that [Clone] would cause. Unloaded nodes are copied by id without
    /// fetching.
    pub fn greedy_clone(&self, force: bool) -> Self
    where
        C: Clone,
    {
        Tree {
            root: self.root.deep_clone(force),
            len: self.len.clone(),
            fanout: self.fanout,
            order: self.order.clone(),
            frozen: self.frozen,
            store: self.store.clone(),
            codec: self.codec,
        }
    }

    /// Reports the pairwise difference against `other` without descending
    /// into shared subtrees.
    ///
    /// `only_self` fires for keys present only here, `only_other` for keys
    /// present only in `other`, and `different` for keys present in both with
    /// unequal values. Any callback may stop the walk by returning
    /// `ControlFlow::Break`, which becomes the return value.
    ///
    /// Both trees must carry equal orders ([Error::ComparatorMismatch]
    /// otherwise) and must not be mutated during the walk.
    pub fn diff<R>(
        &self,
        other: &Self,
        only_self: impl FnMut(&K, Option<&V>) -> ControlFlow<R>,
        only_other: impl FnMut(&K, Option<&V>) -> ControlFlow<R>,
        different: impl FnMut(&K, Option<&V>, Option<&V>) -> ControlFlow<R>,
    ) -> Result<Option<R>, Error>
    where
        C: PartialEq,
        V: PartialEq,
    {
        if self.order != other.order {
            return Err(Error::ComparatorMismatch);
        }
        let ctx_a = tree_ctx!(self);
        let ctx_b = tree_ctx!(other);
        diff::diff_walk(
            &self.root,
            &other.root,
            &ctx_a,
            &ctx_b,
            only_self,
            only_other,
            different,
        )
    }

    /// Verifies per-node invariants over the whole tree: key order, fanout
    /// bound, max-key caches, sibling variant consistency, root collapse, and
    /// the cached pair count when known.
    pub fn check_valid(&self) -> Result<(), Error> {
        let ctx = tree_ctx!(self);
        if let Node::Branch(branch) = &*self.root.node(&ctx)? {
            if branch.children.len() < 2 {
                return Err(error_validation!(
                    "root branch with {} children not collapsed",
                    branch.children.len()
                ));
            }
        }
        let count = check_node(&self.root, &ctx, self.fanout, true)?;
        if let Some(len) = self.len.get() {
            if len != count {
                return Err(error_validation!("tree len {len} != enumerated {count}"));
            }
        }
        Ok(())
    }

    /// Walks the tree depth-first writing every node whose content changed
    /// since its last load or commit, and returns the root's content id.
    /// Already-written blobs are never rewritten, so re-committing an
    /// unchanged tree writes nothing.
    pub fn commit(&self) -> Result<BlobId, Error> {
        let (store, codec) = match (&self.store, &self.codec) {
            (Some(store), Some(codec)) => (store, codec),
            _ => return Err(Error::NoStore),
        };
        let id = self.root.commit(store.as_ref(), codec)?;
        debug!("committed tree, root {id}");
        Ok(id)
    }

    /// Points the tree at a previously committed root. Nothing is fetched;
    /// the pair count becomes unknown until the next [Tree::len].
    pub fn load(&mut self, root_id: BlobId) -> Result<(), Error> {
        self.check_mutable()?;
        if self.store.is_none() || self.codec.is_none() {
            return Err(Error::NoStore);
        }
        debug!("loading tree from root {root_id}");
        self.root = Link::from_id(root_id);
        self.len.set(None);
        Ok(())
    }

    fn thawed_clone(&self) -> Self
    where
        C: Clone,
    {
        let mut tree = self.clone();
        tree.frozen = false;
        tree
    }

    /// Unwinds single-child branch roots after deletions. Taking the sole
    /// child out of a shared root shares it, keeping clones isolated.
    fn collapse_root(&mut self) -> Result<(), Error> {
        loop {
            let ctx = tree_ctx!(self);
            let child_count = match &*self.root.node(&ctx)? {
                Node::Branch(branch) if branch.children.len() <= 1 => branch.children.len(),
                _ => return Ok(()),
            };
            if child_count == 0 {
                self.root = Link::from_node(Node::empty_leaf());
                trace!("root collapsed to the empty leaf");
                return Ok(());
            }
            let old = mem::replace(&mut self.root, Link::from_node(Node::empty_leaf()));
            let Node::Branch(mut branch) = old.take_node(&ctx)? else {
                unreachable!()
            };
            self.root = branch.children.pop().unwrap();
            trace!("root collapsed one level");
        }
    }
}

/// Persistent (non-mutating) variants, all built on [Clone] + mutation. They
/// work on frozen trees too; the returned tree is unfrozen.
impl<K, V, C> Tree<K, V, C>
where
    K: Clone,
    V: Clone,
    C: KeyOrder<K> + Clone,
{
    /// This tree plus `(key, value)`.
    pub fn with(&self, key: K, value: V) -> Result<Self, Error> {
        let mut tree = self.thawed_clone();
        tree.set(key, value)?;
        Ok(tree)
    }

    /// This tree minus `key`.
    pub fn without(&self, key: &K) -> Result<Self, Error> {
        let mut tree = self.thawed_clone();
        tree.delete(key)?;
        Ok(tree)
    }

    /// This tree plus `keys`, each bound to no value; existing pairs keep
    /// their values.
    pub fn with_keys(&self, keys: impl IntoIterator<Item = K>) -> Result<Self, Error> {
        let mut tree = self.thawed_clone();
        for key in keys {
            tree.set_opt(key, None, false)?;
        }
        Ok(tree)
    }

    /// This tree minus `keys`.
    pub fn without_keys(&self, keys: impl IntoIterator<Item = K>) -> Result<Self, Error> {
        let mut tree = self.thawed_clone();
        for key in keys {
            tree.delete(&key)?;
        }
        Ok(tree)
    }

    /// This tree minus every pair in `range`.
    pub fn without_range(&self, range: impl RangeBounds<K>) -> Result<Self, Error> {
        let mut tree = self.thawed_clone();
        tree.delete_range(range)?;
        Ok(tree)
    }

    /// This tree plus `pairs`.
    pub fn with_pairs(
        &self,
        pairs: impl IntoIterator<Item = (K, V)>,
        overwrite: bool,
    ) -> Result<Self, Error> {
        let mut tree = self.thawed_clone();
        tree.set_pairs(pairs, overwrite)?;
        Ok(tree)
    }

    /// The pairs for which `pred` returns true.
    pub fn filter(&self, mut pred: impl FnMut(&K, Option<&V>) -> bool) -> Result<Self, Error> {
        let mut tree = self.thawed_clone();
        let edit = |key: &K, value: Option<&V>| -> EditOp<V, Infallible> {
            if pred(key, value) {
                EditOp::NoOp
            } else {
                EditOp::Delete
            }
        };
        let _ = tree.edit_range(.., edit)?;
        Ok(tree)
    }

    /// This tree with every value replaced by `f`'s result.
    pub fn map_values(
        &self,
        mut f: impl FnMut(&K, Option<&V>) -> Option<V>,
    ) -> Result<Self, Error> {
        let mut tree = self.thawed_clone();
        let edit =
            |key: &K, value: Option<&V>| -> EditOp<V, Infallible> { EditOp::Replace(f(key, value)) };
        let _ = tree.edit_range(.., edit)?;
        Ok(tree)
    }
}

impl<K, V> FromIterator<(K, V)> for Tree<K, V>
where
    K: Clone + PartialOrd,
    V: Clone,
{
    /// Panics on an unorderable key.
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut tree = Tree::new();
        tree.set_pairs(iter, true).expect("unorderable key");
        tree
    }
}

impl<K, V, C> Extend<(K, V)> for Tree<K, V, C>
where
    K: Clone,
    V: Clone,
    C: KeyOrder<K>,
{
    /// Panics on an unorderable key or a frozen tree.
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        self.set_pairs(iter, true).expect("extend failed");
    }
}

fn set_node<K, V, C>(
    link: &mut Link<K, V>,
    key: K,
    value: Option<V>,
    overwrite: bool,
    ctx: &TreeCtx<'_, K, V, C>,
    fanout: usize,
) -> Result<(SetOutcome, Option<Node<K, V>>), Error>
where
    K: Clone,
    V: Clone,
    C: KeyOrder<K>,
{
    match link.node_mut(ctx)? {
        Node::Leaf(leaf) => match search(&leaf.keys, &key, ctx.order)? {
            Ok(i) => {
                if overwrite {
                    leaf.keys[i] = key;
                    leaf.set_value_at(i, value);
                    Ok((SetOutcome::Replaced, None))
                } else {
                    Ok((SetOutcome::Skipped, None))
                }
            }
            Err(i) => {
                if leaf.keys.len() < fanout {
                    leaf.insert_at(i, key, value);
                    return Ok((SetOutcome::Added, None));
                }
                let at = leaf.keys.len() / 2;
                let mut right = leaf.split_off_half();
                if i <= at {
                    leaf.insert_at(i, key, value);
                } else {
                    right.insert_at(i - at, key, value);
                }
                trace!("leaf split at {at}");
                Ok((SetOutcome::Added, Some(Node::Leaf(right))))
            }
        },
        Node::Branch(branch) => {
            let idx = branch.route(&key, ctx.order)?;
            maybe_shift(branch, idx, &key, ctx, fanout)?;
            let (outcome, split) =
                set_node(&mut branch.children[idx], key, value, overwrite, ctx, fanout)?;
            if let Some(max) = branch.children[idx].node(ctx)?.max_key() {
                branch.keys[idx] = max.clone();
            }
            if let Some(sibling) = split {
                let max = sibling.max_key().cloned().unwrap();
                branch.insert_child_at(idx + 1, max, Link::from_node(sibling));
                if branch.children.len() > fanout {
                    let right = branch.split_off_half();
                    trace!("branch split");
                    return Ok((outcome, Some(Node::Branch(right))));
                }
            }
            Ok((outcome, None))
        }
    }
}

/// When the routed child is full, shifts one boundary entry into a non-full
/// neighbor to dodge a split. The strict key guards keep `key` routed to the
/// same child afterwards (and never move an entry equal to it).
fn maybe_shift<K, V, C>(
    branch: &mut Branch<K, V>,
    idx: usize,
    key: &K,
    ctx: &TreeCtx<'_, K, V, C>,
    fanout: usize,
) -> Result<(), Error>
where
    K: Clone,
    V: Clone,
    C: KeyOrder<K>,
{
    if branch.children[idx].node(ctx)?.len() < fanout {
        return Ok(());
    }
    if idx > 0 && branch.children[idx - 1].node(ctx)?.len() < fanout {
        let child = branch.children[idx].node(ctx)?;
        let child_min = child.first_key().unwrap();
        if ctx.order.cmp_or_err(key, child_min)? == Ordering::Greater {
            let (left_half, right_half) = branch.children.split_at_mut(idx);
            let left = left_half.last_mut().unwrap().node_mut(ctx)?;
            left.take_from_right(right_half[0].node_mut(ctx)?);
            let left_max = left.max_key().cloned().unwrap();
            branch.keys[idx - 1] = left_max;
            trace!("shifted one entry left at {idx}");
            return Ok(());
        }
    }
    if idx + 1 < branch.children.len() && branch.children[idx + 1].node(ctx)?.len() < fanout {
        let child = branch.children[idx].node(ctx)?;
        // For a leaf the departing entry covers only its own key, so any
        // strictly smaller key stays put. For a branch the departing entry is
        // a whole subtree spanning up from the second-highest max, so the key
        // must sort at or below that max to keep routing here.
        let fits = match &*child {
            Node::Leaf(leaf) => {
                ctx.order.cmp_or_err(key, leaf.keys.last().unwrap())? == Ordering::Less
            }
            Node::Branch(b) => {
                ctx.order.cmp_or_err(key, &b.keys[b.keys.len() - 2])? != Ordering::Greater
            }
        };
        if fits {
            let (left_half, right_half) = branch.children.split_at_mut(idx + 1);
            let target = left_half.last_mut().unwrap().node_mut(ctx)?;
            right_half[0].node_mut(ctx)?.take_from_left(target);
            let target_max = target.max_key().cloned().unwrap();
            branch.keys[idx] = target_max;
            trace!("shifted one entry right at {idx}");
        }
    }
    Ok(())
}

fn remove_node<K, V, C>(
    link: &mut Link<K, V>,
    key: &K,
    ctx: &TreeCtx<'_, K, V, C>,
    fanout: usize,
) -> Result<(), Error>
where
    K: Clone,
    V: Clone,
    C: KeyOrder<K>,
{
    match link.node_mut(ctx)? {
        Node::Leaf(leaf) => {
            // the caller verified presence
            if let Ok(i) = search(&leaf.keys, key, ctx.order)? {
                leaf.remove_at(i);
            } else {
                debug_assert!(false, "delete probe missed the key");
            }
        }
        Node::Branch(branch) => {
            let idx = branch.route(key, ctx.order)?;
            remove_node(&mut branch.children[idx], key, ctx, fanout)?;
            let child_len = branch.children[idx].node(ctx)?.len();
            if child_len == 0 {
                branch.remove_child_at(idx);
            } else {
                branch.keys[idx] = branch.children[idx].node(ctx)?.max_key().cloned().unwrap();
                if child_len <= fanout / 2 {
                    try_merge(branch, idx, ctx, fanout)?;
                }
            }
        }
    }
    Ok(())
}

/// Merges children `i` and `i + 1` (falling back to `i - 1` and `i` for the
/// last child) when they fit in one node together.
pub(crate) fn try_merge<K, V, C>(
    branch: &mut Branch<K, V>,
    i: usize,
    ctx: &TreeCtx<'_, K, V, C>,
    fanout: usize,
) -> Result<(), Error>
where
    K: Clone,
    V: Clone,
    C: KeyOrder<K>,
{
    let i = if i + 1 < branch.children.len() {
        i
    } else if i > 0 {
        i - 1
    } else {
        return Ok(());
    };
    let left_len = branch.children[i].node(ctx)?.len();
    let right_len = branch.children[i + 1].node(ctx)?.len();
    if left_len + right_len > fanout {
        return Ok(());
    }
    // Taking the node out of a shared right link clones it, which shares its
    // children with the other referents as they migrate under this parent.
    let (right_max, right_link) = branch.remove_child_at(i + 1);
    let right_node = right_link.take_node(ctx)?;
    let left = branch.children[i].node_mut(ctx)?;
    left.merge_right(right_node);
    debug_assert_eq!(left.len(), left_len + right_len);
    branch.keys[i] = right_max;
    trace!("merged children {i} and {}", i + 1);
    Ok(())
}

fn pair_at<K: Clone, V: Clone>(leaf: &Leaf<K, V>, i: usize) -> (K, Option<V>) {
    (leaf.keys[i].clone(), leaf.value_at(i).cloned())
}

fn seek_floor<K, V, C>(
    link: &Link<K, V>,
    bound: Bound<&K>,
    ctx: &TreeCtx<'_, K, V, C>,
) -> Result<Option<(K, Option<V>)>, Error>
where
    K: Clone,
    V: Clone,
    C: KeyOrder<K>,
{
    let node = link.node(ctx)?;
    match &*node {
        Node::Leaf(leaf) => {
            let i = match bound {
                Bound::Unbounded => leaf.keys.len(),
                Bound::Included(key) => match search(&leaf.keys, key, ctx.order)? {
                    Ok(i) => return Ok(Some(pair_at(leaf, i))),
                    Err(i) => i,
                },
                Bound::Excluded(key) => match search(&leaf.keys, key, ctx.order)? {
                    Ok(i) | Err(i) => i,
                },
            };
            Ok(i.checked_sub(1).map(|i| pair_at(leaf, i)))
        }
        Node::Branch(branch) => {
            let idx = match bound {
                Bound::Unbounded => branch.children.len() - 1,
                Bound::Included(key) | Bound::Excluded(key) => branch.route(key, ctx.order)?,
            };
            if let Some(pair) = seek_floor(&branch.children[idx], bound, ctx)? {
                return Ok(Some(pair));
            }
            // whole subtree sorts above the bound; the floor is the previous
            // sibling's max pair
            match idx.checked_sub(1) {
                Some(prev) => seek_floor(&branch.children[prev], Bound::Unbounded, ctx),
                None => Ok(None),
            }
        }
    }
}

fn seek_ceil<K, V, C>(
    link: &Link<K, V>,
    bound: Bound<&K>,
    ctx: &TreeCtx<'_, K, V, C>,
) -> Result<Option<(K, Option<V>)>, Error>
where
    K: Clone,
    V: Clone,
    C: KeyOrder<K>,
{
    let node = link.node(ctx)?;
    match &*node {
        Node::Leaf(leaf) => {
            let i = match bound {
                Bound::Unbounded => 0,
                Bound::Included(key) => match search(&leaf.keys, key, ctx.order)? {
                    Ok(i) | Err(i) => i,
                },
                Bound::Excluded(key) => match search(&leaf.keys, key, ctx.order)? {
                    Ok(i) => i + 1,
                    Err(i) => i,
                },
            };
            Ok((i < leaf.keys.len()).then(|| pair_at(leaf, i)))
        }
        Node::Branch(branch) => {
            let idx = match bound {
                Bound::Unbounded => 0,
                Bound::Included(key) => match search(&branch.keys, key, ctx.order)? {
                    Ok(i) | Err(i) => i,
                },
                // a child whose max equals the bound has nothing above it
                Bound::Excluded(key) => match search(&branch.keys, key, ctx.order)? {
                    Ok(i) => i + 1,
                    Err(i) => i,
                },
            };
            if idx >= branch.children.len() {
                return Ok(None);
            }
            if let Some(pair) = seek_ceil(&branch.children[idx], bound, ctx)? {
                return Ok(Some(pair));
            }
            if idx + 1 < branch.children.len() {
                seek_ceil(&branch.children[idx + 1], Bound::Unbounded, ctx)
            } else {
                Ok(None)
            }
        }
    }
}

fn check_node<K, V, C>(
    link: &Link<K, V>,
    ctx: &TreeCtx<'_, K, V, C>,
    fanout: usize,
    is_root: bool,
) -> Result<u64, Error>
where
    K: Clone,
    V: Clone,
    C: KeyOrder<K>,
{
    let node = link.node(ctx)?;
    let keys = node.keys();
    for i in 1..keys.len() {
        if ctx.order.cmp_or_err(&keys[i - 1], &keys[i])? != Ordering::Less {
            return Err(error_validation!("node keys out of order at {i}"));
        }
    }
    if node.len() > fanout {
        return Err(error_validation!(
            "node holds {} entries, over fanout {fanout}",
            node.len()
        ));
    }
    if !is_root && node.is_empty() {
        return Err(error_validation!("empty non-root node"));
    }
    match &*node {
        Node::Leaf(leaf) => {
            if let LeafValues::Filled(values) = &leaf.values {
                if values.len() != leaf.keys.len() {
                    return Err(error_validation!(
                        "leaf with {} keys but {} value slots",
                        leaf.keys.len(),
                        values.len()
                    ));
                }
            }
            Ok(leaf.keys.len() as u64)
        }
        Node::Branch(branch) => {
            if branch.keys.len() != branch.children.len() {
                return Err(error_validation!(
                    "branch with {} keys but {} children",
                    branch.keys.len(),
                    branch.children.len()
                ));
            }
            let mut total = 0;
            let mut leaf_children = None;
            for (i, child) in branch.children.iter().enumerate() {
                let child_node = child.node(ctx)?;
                match leaf_children {
                    None => leaf_children = Some(child_node.is_leaf()),
                    Some(leaf) if leaf != child_node.is_leaf() => {
                        return Err(error_validation!("mixed child variants under one branch"))
                    }
                    Some(_) => {}
                }
                let max = child_node
                    .max_key()
                    .ok_or_else(|| error_validation!("empty child at {i}"))?;
                if ctx.order.cmp_or_err(max, &branch.keys[i])? != Ordering::Equal {
                    return Err(error_validation!("stale max-key cache at {i}"));
                }
                total += check_node(child, ctx, fanout, false)?;
            }
            Ok(total)
        }
    }
}
