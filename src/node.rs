use std::cmp::Ordering;

use crate::{
    error::{error_corrupt, Error},
    link::Link,
    order::{search, KeyOrder},
};

/// Tree node, either a leaf holding the key/value pairs or a branch holding
/// child links plus the cached max-key of each child.
///
/// The two variants are closed; shared behavior dispatches on the tag.
#[derive(Clone, Debug)]
pub(crate) enum Node<K, V> {
    Leaf(Leaf<K, V>),
    Branch(Branch<K, V>),
}

#[derive(Clone, Debug)]
pub(crate) struct Leaf<K, V> {
    pub keys: Vec<K>,
    pub values: LeafValues<V>,
}

/// Value slots of a leaf.
///
/// `Vacant` is the all-absent sentinel carried by keys-only leaves; the vector
/// materializes on the first concrete value write. Purely a storage
/// optimization, indistinguishable from a filled all-`None` vector through the
/// public API.
#[derive(Clone, Debug)]
pub(crate) enum LeafValues<V> {
    Vacant,
    Filled(Vec<Option<V>>),
}

#[derive(Clone, Debug)]
pub(crate) struct Branch<K, V> {
    /// `keys[i]` caches `children[i].max_key()`.
    pub keys: Vec<K>,
    pub children: Vec<Link<K, V>>,
}

impl<V> LeafValues<V> {
    #[inline]
    pub fn is_vacant(&self) -> bool {
        matches!(self, LeafValues::Vacant)
    }

    /// Materializes the slot vector ("reify"), `len` being the current key
    /// count.
    fn filled_mut(&mut self, len: usize) -> &mut Vec<Option<V>> {
        if self.is_vacant() {
            *self = LeafValues::Filled(std::iter::repeat_with(|| None).take(len).collect());
        }
        match self {
            LeafValues::Filled(v) => v,
            LeafValues::Vacant => unreachable!(),
        }
    }
}

impl<K, V> Leaf<K, V> {
    pub fn empty() -> Self {
        Leaf {
            keys: Vec::new(),
            values: LeafValues::Vacant,
        }
    }

    #[inline]
    pub fn value_at(&self, i: usize) -> Option<&V> {
        match &self.values {
            LeafValues::Vacant => None,
            LeafValues::Filled(v) => v[i].as_ref(),
        }
    }

    pub fn set_value_at(&mut self, i: usize, value: Option<V>) {
        if value.is_none() && self.values.is_vacant() {
            return;
        }
        let len = self.keys.len();
        self.values.filled_mut(len)[i] = value;
    }

    pub fn insert_at(&mut self, i: usize, key: K, value: Option<V>) {
        if value.is_some() || !self.values.is_vacant() {
            let len = self.keys.len();
            self.values.filled_mut(len).insert(i, value);
        }
        self.keys.insert(i, key);
    }

    pub fn remove_at(&mut self, i: usize) -> (K, Option<V>) {
        let key = self.keys.remove(i);
        let value = match &mut self.values {
            LeafValues::Vacant => None,
            LeafValues::Filled(v) => v.remove(i),
        };
        (key, value)
    }

    /// Splits off the upper half, `⌊len/2⌋` keys staying, `⌈len/2⌉` leaving.
    pub fn split_off_half(&mut self) -> Self {
        let at = self.keys.len() / 2;
        let keys = self.keys.split_off(at);
        let values = match &mut self.values {
            LeafValues::Vacant => LeafValues::Vacant,
            LeafValues::Filled(v) => LeafValues::Filled(v.split_off(at)),
        };
        Leaf { keys, values }
    }

    fn take_from_right(&mut self, right: &mut Self) {
        let (key, value) = right.remove_at(0);
        let i = self.keys.len();
        self.insert_at(i, key, value);
    }

    fn take_from_left(&mut self, left: &mut Self) {
        let (key, value) = left.remove_at(left.keys.len() - 1);
        self.insert_at(0, key, value);
    }

    fn merge_right(&mut self, mut right: Self) {
        if !(self.values.is_vacant() && right.values.is_vacant()) {
            let len = self.keys.len();
            let values = self.values.filled_mut(len);
            match right.values {
                LeafValues::Vacant => {
                    values.extend(std::iter::repeat_with(|| None).take(right.keys.len()))
                }
                LeafValues::Filled(v) => values.extend(v),
            }
        }
        self.keys.append(&mut right.keys);
    }
}

impl<K, V> Branch<K, V> {
    /// Index of the child that may contain `key`: the first child whose cached
    /// max-key is `>= key`, clamped to the last child when `key` exceeds every
    /// cached max (so next-higher style lookups land somewhere).
    pub fn route<C: KeyOrder<K>>(&self, key: &K, order: &C) -> Result<usize, Error> {
        debug_assert!(!self.children.is_empty());
        let i = match search(&self.keys, key, order)? {
            Ok(i) | Err(i) => i,
        };
        Ok(i.min(self.children.len() - 1))
    }

    pub fn insert_child_at(&mut self, i: usize, max_key: K, child: Link<K, V>) {
        self.keys.insert(i, max_key);
        self.children.insert(i, child);
    }

    pub fn remove_child_at(&mut self, i: usize) -> (K, Link<K, V>) {
        (self.keys.remove(i), self.children.remove(i))
    }

    pub fn split_off_half(&mut self) -> Self {
        let at = self.children.len() / 2;
        Branch {
            keys: self.keys.split_off(at),
            children: self.children.split_off(at),
        }
    }

    fn take_from_right(&mut self, right: &mut Self) {
        self.keys.push(right.keys.remove(0));
        self.children.push(right.children.remove(0));
    }

    fn take_from_left(&mut self, left: &mut Self) {
        self.keys.insert(0, left.keys.pop().unwrap());
        self.children.insert(0, left.children.pop().unwrap());
    }

    fn merge_right(&mut self, mut right: Self) {
        self.keys.append(&mut right.keys);
        self.children.append(&mut right.children);
    }
}

impl<K, V> Node<K, V> {
    pub fn empty_leaf() -> Self {
        Node::Leaf(Leaf::empty())
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    /// Number of keys (leaf) or children (branch).
    #[inline]
    pub fn len(&self) -> usize {
        match self {
            Node::Leaf(leaf) => leaf.keys.len(),
            Node::Branch(branch) => branch.children.len(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn keys(&self) -> &[K] {
        match self {
            Node::Leaf(leaf) => &leaf.keys,
            Node::Branch(branch) => &branch.keys,
        }
    }

    /// Largest key in the subtree, cached for branches.
    #[inline]
    pub fn max_key(&self) -> Option<&K> {
        self.keys().last()
    }

    /// Smallest key visible at this node (for branches, the max-key of the
    /// first subtree; sufficient for routing guards).
    #[inline]
    pub fn first_key(&self) -> Option<&K> {
        self.keys().first()
    }

    pub fn as_leaf(&self) -> &Leaf<K, V> {
        match self {
            Node::Leaf(leaf) => leaf,
            Node::Branch(_) => unreachable!(),
        }
    }

    pub fn as_branch(&self) -> &Branch<K, V> {
        match self {
            Node::Branch(branch) => branch,
            Node::Leaf(_) => unreachable!(),
        }
    }

    /// Moves the right sibling's first entry into `self`. Both nodes must be
    /// the same variant and `self` must sort entirely below `right`.
    pub fn take_from_right(&mut self, right: &mut Self) {
        match (self, right) {
            (Node::Leaf(l), Node::Leaf(r)) => l.take_from_right(r),
            (Node::Branch(l), Node::Branch(r)) => l.take_from_right(r),
            _ => unreachable!(),
        }
    }

    /// Moves the left sibling's last entry into `self`.
    pub fn take_from_left(&mut self, left: &mut Self) {
        match (self, left) {
            (Node::Leaf(r), Node::Leaf(l)) => r.take_from_left(l),
            (Node::Branch(r), Node::Branch(l)) => r.take_from_left(l),
            _ => unreachable!(),
        }
    }

    /// Appends the entries of the right sibling.
    pub fn merge_right(&mut self, right: Self) {
        match (self, right) {
            (Node::Leaf(l), Node::Leaf(r)) => l.merge_right(r),
            (Node::Branch(l), Node::Branch(r)) => l.merge_right(r),
            _ => unreachable!(),
        }
    }

    /// Structural checks on a freshly deserialized node: strictly increasing
    /// keys and parallel arrays of matching length.
    pub fn check_decoded<C: KeyOrder<K>>(&self, order: &C) -> Result<(), Error> {
        let keys = self.keys();
        for i in 1..keys.len() {
            match order.try_cmp(&keys[i - 1], &keys[i]) {
                Some(Ordering::Less) => {}
                _ => return Err(error_corrupt!("node keys out of order at index {i}")),
            }
        }
        match self {
            Node::Leaf(leaf) => {
                if let LeafValues::Filled(values) = &leaf.values {
                    if values.len() != leaf.keys.len() {
                        return Err(error_corrupt!(
                            "leaf with {} keys but {} value slots",
                            leaf.keys.len(),
                            values.len()
                        ));
                    }
                }
            }
            Node::Branch(branch) => {
                if branch.children.is_empty() || branch.children.len() != branch.keys.len() {
                    return Err(error_corrupt!(
                        "branch with {} keys but {} children",
                        branch.keys.len(),
                        branch.children.len()
                    ));
                }
            }
        }
        Ok(())
    }
}
