use std::cmp::Ordering;

use crate::error::Error;

/// Total order over tree keys.
///
/// The same order value must be used for every operation on a given tree, and
/// [Tree::diff](crate::Tree::diff) requires both trees to carry equal orders
/// (orders implement `PartialEq` so this can be checked up front).
///
/// Returning `None` from [KeyOrder::try_cmp] signals a key the order cannot
/// place (e.g. NaN under a numeric order); the engine aborts the operation
/// with [Error::UnorderableKey] before making any structural change.
pub trait KeyOrder<K: ?Sized> {
    /// Compares two keys, `None` when the pair cannot be ordered.
    fn try_cmp(&self, a: &K, b: &K) -> Option<Ordering>;
}

pub(crate) trait KeyOrderExt<K: ?Sized>: KeyOrder<K> {
    #[inline]
    fn cmp_or_err(&self, a: &K, b: &K) -> Result<Ordering, Error> {
        self.try_cmp(a, b).ok_or(Error::UnorderableKey)
    }
}

impl<K: ?Sized, O: KeyOrder<K> + ?Sized> KeyOrderExt<K> for O {}

/// The default order, delegating to [PartialOrd].
///
/// Incomparable pairs (NaN floats) surface as [Error::UnorderableKey].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NaturalOrder;

impl<K: PartialOrd + ?Sized> KeyOrder<K> for NaturalOrder {
    #[inline]
    fn try_cmp(&self, a: &K, b: &K) -> Option<Ordering> {
        a.partial_cmp(b)
    }
}

/// Reverses an inner order (default [NaturalOrder]).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReverseOrder<O = NaturalOrder>(pub O);

impl<K: ?Sized, O: KeyOrder<K>> KeyOrder<K> for ReverseOrder<O> {
    #[inline]
    fn try_cmp(&self, a: &K, b: &K) -> Option<Ordering> {
        self.0.try_cmp(a, b).map(Ordering::reverse)
    }
}

/// Binary search over a sorted key slice.
///
/// `Ok(i)` is an exact hit, `Err(i)` the insertion index, following the
/// `slice::binary_search` convention.
pub(crate) fn search<K, C: KeyOrder<K>>(
    keys: &[K],
    key: &K,
    order: &C,
) -> Result<Result<usize, usize>, Error> {
    let mut lo = 0;
    let mut hi = keys.len();
    while lo < hi {
        let mid = (lo + hi) / 2;
        match order.cmp_or_err(key, &keys[mid])? {
            Ordering::Greater => lo = mid + 1,
            Ordering::Equal => return Ok(Ok(mid)),
            Ordering::Less => hi = mid,
        }
    }
    Ok(Err(lo))
}
