use crate::*;
use rand::prelude::*;
use std::{
    cmp::Ordering,
    collections::BTreeMap,
    ops::{Bound, ControlFlow},
    sync::{
        atomic::{AtomicUsize, Ordering::Relaxed},
        Arc,
    },
};

fn get_rng() -> impl Rng + Clone {
    let seed: u64 = std::env::var("SEED")
        .map_or_else(|_| thread_rng().gen(), |seed_str| seed_str.parse().unwrap());
    println!("SEED {}", seed);
    SmallRng::seed_from_u64(seed)
}

fn opts(fanout: usize) -> TreeOptions {
    TreeOptions::default().fanout(fanout)
}

fn keys_of<K: Clone, V: Clone, C: KeyOrder<K>>(tree: &Tree<K, V, C>) -> Vec<K> {
    tree.pairs().unwrap().into_iter().map(|(k, _)| k).collect()
}

fn no_emit<K: std::fmt::Debug, V>(key: &K, _: Option<&V>) -> ControlFlow<()> {
    panic!("unexpected diff emission for {key:?}")
}

fn no_diff<K: std::fmt::Debug, V>(key: &K, _: Option<&V>, _: Option<&V>) -> ControlFlow<()> {
    panic!("unexpected value difference for {key:?}")
}

/// Blob store wrapper counting operations, for laziness and idempotence
/// assertions.
struct CountingStore {
    inner: MemoryBlobStore,
    gets: AtomicUsize,
    puts: AtomicUsize,
}

impl CountingStore {
    fn new() -> Self {
        Self {
            inner: MemoryBlobStore::new(),
            gets: AtomicUsize::new(0),
            puts: AtomicUsize::new(0),
        }
    }
}

impl BlobStore for CountingStore {
    fn get(&self, id: &BlobId) -> Result<Option<Vec<u8>>, Error> {
        self.gets.fetch_add(1, Relaxed);
        self.inner.get(id)
    }

    fn put(&self, id: &BlobId, bytes: &[u8]) -> Result<(), Error> {
        self.puts.fetch_add(1, Relaxed);
        self.inner.put(id, bytes)
    }

    fn contains(&self, id: &BlobId) -> Result<bool, Error> {
        self.inner.contains(id)
    }
}

#[test]
fn insert_and_read_back() {
    let _ = env_logger::try_init();
    use serde_json::{json, Value};
    let mut tree: Tree<i32, Value> = Tree::with_options(opts(4));
    for (k, v) in [
        (6, json!("six")),
        (7, json!(7)),
        (5, json!(5)),
        (2, json!("two")),
        (4, json!(4)),
        (1, json!("one")),
        (3, json!(3)),
        (8, json!(8)),
    ] {
        assert!(tree.set(k, v).unwrap());
    }
    assert_eq!(keys_of(&tree), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    assert_eq!(tree.len().unwrap(), 8);
    assert_eq!(tree.get(&6).unwrap(), Some(json!("six")));
    assert_eq!(tree.get(&7).unwrap(), Some(json!(7)));
    assert_eq!(tree.get(&9).unwrap(), None);
    tree.check_valid().unwrap();

    // overwriting replaces both value and stored key
    assert!(!tree.set(3, json!("three")).unwrap());
    assert_eq!(tree.get(&3).unwrap(), Some(json!("three")));
    assert_eq!(tree.len().unwrap(), 8);
}

#[test]
fn clone_isolation_under_deletes() {
    let _ = env_logger::try_init();
    let mut tree: Tree<i32, i32> = Tree::with_options(opts(4));
    for k in 0..64 {
        tree.set(k, 0).unwrap();
    }
    assert_eq!(tree.height().unwrap(), 2);
    let snapshot = tree.clone();

    for k in 0..64 {
        if k % 16 != 0 {
            assert!(tree.delete(&k).unwrap(), "failed to delete {k}");
        }
    }
    assert_eq!(keys_of(&tree), vec![0, 16, 32, 48]);
    tree.check_valid().unwrap();

    // the clone still sees every pair
    assert_eq!(snapshot.len().unwrap(), 64);
    for k in 0..64 {
        assert_eq!(snapshot.get(&k).unwrap(), Some(0), "clone lost key {k}");
    }
    snapshot.check_valid().unwrap();
}

#[test]
fn string_ranges_and_deletes() {
    let mut tree: Tree<&str, i32> = Tree::with_options(opts(4));
    for (i, k) in ["A", "B", "C", "D", "E", "F", "G", "H"].iter().enumerate() {
        tree.set(k, i as i32 + 1).unwrap();
    }
    assert_eq!(
        tree.get_range("#"..="B", usize::MAX).unwrap(),
        vec![("A", Some(1)), ("B", Some(2))]
    );
    assert_eq!(
        tree.get_range("G"..="S", usize::MAX).unwrap(),
        vec![("G", Some(7)), ("H", Some(8))]
    );
    assert!(tree.delete(&"C").unwrap());
    assert!(tree.delete(&"H").unwrap());
    assert_eq!(tree.delete_range(" "..="A").unwrap(), 1);
    assert_eq!(
        tree.pairs().unwrap(),
        vec![
            ("B", Some(2)),
            ("D", Some(4)),
            ("E", Some(5)),
            ("F", Some(6)),
            ("G", Some(7)),
        ]
    );
    tree.check_valid().unwrap();
}

#[test]
fn reverse_order_delete_range() {
    let _ = env_logger::try_init();
    let options = TreeOptions::with_order(ReverseOrder::default()).fanout(4);
    let mut tree: Tree<i32, String, ReverseOrder> = Tree::with_options(options);
    for k in 0..=35 {
        tree.set(k, k.to_string()).unwrap();
    }
    assert_eq!(tree.len().unwrap(), 36);
    assert_eq!(tree.min_key().unwrap(), Some(35));
    assert_eq!(tree.max_key().unwrap(), Some(0));

    // from 33 down to 5 inclusive, in the reversed order
    assert_eq!(tree.delete_range(33..=5).unwrap(), 29);
    let expect: Vec<_> = [35, 34, 4, 3, 2, 1, 0]
        .into_iter()
        .map(|k| (k, Some(k.to_string())))
        .collect();
    assert_eq!(tree.pairs().unwrap(), expect);
    tree.check_valid().unwrap();
}

#[test]
fn floor_and_ceil_lookups() {
    let mut tree: Tree<i64, i64> = Tree::with_options(opts(4));
    for (k, v) in [(-2, 123), (0, 1234), (2, 12345)] {
        tree.set(k, v).unwrap();
    }
    assert_eq!(tree.next_lower_pair(&-2).unwrap(), None);
    assert_eq!(tree.next_lower_pair(&-1).unwrap(), Some((-2, Some(123))));
    assert_eq!(tree.next_higher_pair(&-1).unwrap(), Some((0, Some(1234))));
    assert_eq!(tree.next_higher_pair(&2).unwrap(), None);
    assert_eq!(tree.last_pair().unwrap(), Some((2, Some(12345))));
    assert_eq!(tree.first_pair().unwrap(), Some((-2, Some(123))));
    assert_eq!(
        tree.pair_or_next_lower(Bound::Included(&0)).unwrap(),
        Some((0, Some(1234)))
    );
    assert_eq!(
        tree.pair_or_next_higher(Bound::Included(&1)).unwrap(),
        Some((2, Some(12345)))
    );
    assert_eq!(tree.pair_or_next_lower(Bound::Included(&-3)).unwrap(), None);
}

#[test]
fn lazy_range_read_after_reopen() {
    let _ = env_logger::try_init();
    let store = Arc::new(CountingStore::new());
    let mut tree: Tree<String, String> =
        Tree::attached(store.clone(), TreeOptions::default());
    for i in 0..10_000 {
        tree.set(format!("miso{i:010}"), format!("kura{i:010}")).unwrap();
    }
    let root = tree.commit().unwrap();
    let total_blobs = store.inner.len();
    assert!(total_blobs > 100, "expected a deep tree, got {total_blobs} blobs");

    store.gets.store(0, Relaxed);
    let reopened: Tree<String, String> =
        Tree::open(store.clone(), root, TreeOptions::default());
    let got = reopened
        .get_range("miso0000000001".to_string()..="miso0000000012".to_string(), usize::MAX)
        .unwrap();
    let expect: Vec<_> = (1..=12)
        .map(|i| (format!("miso{i:010}"), Some(format!("kura{i:010}"))))
        .collect();
    assert_eq!(got, expect);
    // only a root-to-leaf sliver was fetched
    let gets = store.gets.load(Relaxed);
    assert!(gets < 20, "range read fetched {gets} of {total_blobs} blobs");
}

#[test]
fn commit_round_trip() {
    let store = Arc::new(MemoryBlobStore::new());
    let mut tree: Tree<String, i64> = Tree::attached(store.clone(), opts(4));
    let mut oracle = BTreeMap::new();
    let mut rng = get_rng();
    for _ in 0..1000 {
        let k = format!("key{:06}", rng.gen_range(0..3000));
        let v = rng.gen_range(0..1_000_000);
        tree.set(k.clone(), v).unwrap();
        oracle.insert(k, v);
    }
    let root = tree.commit().unwrap();

    let reopened: Tree<String, i64> = Tree::open(store, root.clone(), opts(4));
    assert_eq!(reopened.len().unwrap(), oracle.len() as u64);
    let expect: Vec<_> = oracle.iter().map(|(k, v)| (k.clone(), Some(*v))).collect();
    assert_eq!(reopened.pairs().unwrap(), expect);
    reopened.check_valid().unwrap();
    // unchanged reopened tree re-commits to the same root
    assert_eq!(reopened.commit().unwrap(), root);
}

#[test]
fn commit_is_deterministic_and_idempotent() {
    let build = |store: Arc<dyn BlobStore>| -> Tree<String, String> {
        let mut tree = Tree::attached(store, opts(4));
        for i in 0..500 {
            tree.set(format!("k{i:04}"), format!("v{i}")).unwrap();
        }
        for i in (0..500).step_by(3) {
            tree.delete(&format!("k{i:04}")).unwrap();
        }
        tree
    };
    let store_a = Arc::new(CountingStore::new());
    let store_b = Arc::new(CountingStore::new());
    let tree_a = build(store_a.clone());
    let tree_b = build(store_b.clone());

    // same operation sequence, same root id
    let root_a = tree_a.commit().unwrap();
    let root_b = tree_b.commit().unwrap();
    assert_eq!(root_a, root_b);

    // a second commit with no intervening mutation writes nothing
    let puts = store_a.puts.load(Relaxed);
    assert_eq!(tree_a.commit().unwrap(), root_a);
    assert_eq!(store_a.puts.load(Relaxed), puts);

    // a mutation moves the root but rewrites only the touched path
    let mut tree_a = tree_a;
    tree_a.set("k0001".to_string(), "changed".to_string()).unwrap();
    let root_c = tree_a.commit().unwrap();
    assert_ne!(root_c, root_a);
    let delta = store_a.puts.load(Relaxed) - puts;
    assert!(delta <= 1 + tree_a.height().unwrap(), "rewrote {delta} nodes");
}

#[test]
fn diff_of_untouched_clone_is_free() {
    let mut tree: Tree<i32, i32> = Tree::with_options(opts(4));
    for k in 0..500 {
        tree.set(k, k * 2).unwrap();
    }
    let clone = tree.clone();
    let out = tree.diff(&clone, no_emit, no_emit, no_diff).unwrap();
    assert_eq!(out, None);
}

#[test]
fn diff_of_reopened_trees_skips_by_content_id() {
    let store = Arc::new(CountingStore::new());
    let mut tree: Tree<String, i64> = Tree::attached(store.clone(), opts(4));
    for i in 0..2000 {
        tree.set(format!("k{i:05}"), i).unwrap();
    }
    let root = tree.commit().unwrap();

    let a: Tree<String, i64> = Tree::open(store.clone(), root.clone(), opts(4));
    let b: Tree<String, i64> = Tree::open(store.clone(), root, opts(4));
    store.gets.store(0, Relaxed);
    let out = a.diff(&b, no_emit, no_emit, no_diff).unwrap();
    assert_eq!(out, None);
    // both cursors load their root, see equal ids and stop
    assert!(store.gets.load(Relaxed) <= 2);
}

#[test]
fn diff_partitions_key_space() {
    let _ = env_logger::try_init();
    let mut rng = get_rng();
    let mut tree: Tree<i32, i32> = Tree::with_options(opts(4));
    let mut base = BTreeMap::new();
    for _ in 0..600 {
        let k = rng.gen_range(0..2000);
        let v = rng.gen_range(0..100);
        tree.set(k, v).unwrap();
        base.insert(k, v);
    }
    let mut edited = tree.clone();
    let mut edited_oracle = base.clone();
    for _ in 0..300 {
        match rng.gen_range(0..3) {
            0 => {
                let k = rng.gen_range(0..2500);
                let v = rng.gen_range(100..200);
                edited.set(k, v).unwrap();
                edited_oracle.insert(k, v);
            }
            1 => {
                let k = rng.gen_range(0..2000);
                edited.delete(&k).unwrap();
                edited_oracle.remove(&k);
            }
            _ => {
                let first = edited_oracle.keys().next().copied();
                if let Some(k) = first {
                    edited.set(k, -1).unwrap();
                    edited_oracle.insert(k, -1);
                }
            }
        }
    }

    let mut only_self = Vec::new();
    let mut only_other = Vec::new();
    let mut different = Vec::new();
    let out = tree
        .diff(
            &edited,
            |k: &i32, v: Option<&i32>| -> ControlFlow<()> {
                only_self.push((*k, v.copied()));
                ControlFlow::Continue(())
            },
            |k, v| {
                only_other.push((*k, v.copied()));
                ControlFlow::Continue(())
            },
            |k, a, b| {
                different.push((*k, a.copied(), b.copied()));
                ControlFlow::Continue(())
            },
        )
        .unwrap();
    assert_eq!(out, None);

    let mut expect_only_self = Vec::new();
    let mut expect_only_other = Vec::new();
    let mut expect_different = Vec::new();
    for (k, v) in &base {
        match edited_oracle.get(k) {
            None => expect_only_self.push((*k, Some(*v))),
            Some(w) if w != v => expect_different.push((*k, Some(*v), Some(*w))),
            Some(_) => {}
        }
    }
    for (k, w) in &edited_oracle {
        if !base.contains_key(k) {
            expect_only_other.push((*k, Some(*w)));
        }
    }
    // the walk emits in descending key order
    only_self.sort();
    only_other.sort();
    different.sort();
    assert_eq!(only_self, expect_only_self);
    assert_eq!(only_other, expect_only_other);
    assert_eq!(different, expect_different);
}

#[test]
fn diff_early_break() {
    let mut a: Tree<i32, i32> = Tree::with_options(opts(4));
    let b: Tree<i32, i32> = Tree::with_options(opts(4));
    for k in 0..50 {
        a.set(k, k).unwrap();
    }
    let out = a
        .diff(
            &b,
            |k, _| ControlFlow::Break(*k),
            |_, _| ControlFlow::Continue(()),
            |_, _, _| ControlFlow::Continue(()),
        )
        .unwrap();
    // descending walk reaches the largest key first
    assert_eq!(out, Some(49));
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct TaggedOrder(u8);

impl KeyOrder<i32> for TaggedOrder {
    fn try_cmp(&self, a: &i32, b: &i32) -> Option<Ordering> {
        a.partial_cmp(b)
    }
}

#[test]
fn diff_rejects_comparator_mismatch() {
    let a: Tree<i32, i32, TaggedOrder> =
        Tree::with_options(TreeOptions::with_order(TaggedOrder(1)));
    let b: Tree<i32, i32, TaggedOrder> =
        Tree::with_options(TreeOptions::with_order(TaggedOrder(2)));
    let err = a.diff(&b, no_emit, no_emit, no_diff).unwrap_err();
    assert!(matches!(err, Error::ComparatorMismatch));
}

#[test]
fn unorderable_keys_are_rejected() {
    let mut tree: Tree<f64, i32> = Tree::new();
    tree.set(1.0, 1).unwrap();
    tree.set(2.0, 2).unwrap();
    assert!(matches!(tree.set(f64::NAN, 3), Err(Error::UnorderableKey)));
    assert_eq!(tree.len().unwrap(), 2);
    assert!(matches!(tree.get(&f64::NAN), Err(Error::UnorderableKey)));
    tree.check_valid().unwrap();
}

#[test]
fn frozen_tree_rejects_mutation() {
    let mut tree: Tree<i32, i32> = Tree::new();
    tree.set(1, 1).unwrap();
    tree.freeze();
    assert!(tree.is_frozen());
    assert!(matches!(tree.set(2, 2), Err(Error::Frozen)));
    assert!(matches!(tree.delete(&1), Err(Error::Frozen)));
    assert!(matches!(tree.delete_range(..), Err(Error::Frozen)));
    let edit = |_: &i32, _: Option<&i32>| -> EditOp<i32, ()> { EditOp::Delete };
    assert!(matches!(tree.edit_range(.., edit), Err(Error::Frozen)));
    // reads still work
    assert_eq!(tree.get(&1).unwrap(), Some(1));

    // persistent variants work on a frozen tree and return an unfrozen one
    let with = tree.with(2, 2).unwrap();
    assert!(!with.is_frozen());
    assert_eq!(with.len().unwrap(), 2);
    assert_eq!(tree.len().unwrap(), 1);

    // the frozen bit travels with clones but thaws independently
    let mut clone = tree.clone();
    assert!(clone.is_frozen());
    clone.unfreeze();
    clone.set(3, 3).unwrap();
    assert!(tree.is_frozen());
    assert_eq!(tree.len().unwrap(), 1);
}

#[test]
fn edit_range_directives() {
    let mut tree: Tree<i32, i32> = Tree::with_options(opts(4));
    for k in 1..=10 {
        tree.set(k, k * 10).unwrap();
    }
    let flow = tree
        .edit_range(3..=9, |k, _| match *k {
            4 => EditOp::Replace(Some(400)),
            5 | 6 => EditOp::Delete,
            7 => EditOp::Break(42),
            _ => EditOp::NoOp,
        })
        .unwrap();
    assert_eq!(flow, ControlFlow::Break(42));
    assert_eq!(tree.len().unwrap(), 8);
    assert_eq!(tree.get(&4).unwrap(), Some(400));
    assert_eq!(tree.get(&5).unwrap(), None);
    assert_eq!(tree.get(&6).unwrap(), None);
    assert_eq!(tree.get(&7).unwrap(), Some(70));
    tree.check_valid().unwrap();

    let flow = tree
        .edit_range(.., |k, _| match *k {
            1 => EditOp::ReplaceBreak(Some(-1), "stop"),
            _ => EditOp::NoOp,
        })
        .unwrap();
    assert_eq!(flow, ControlFlow::Break("stop"));
    assert_eq!(tree.get(&1).unwrap(), Some(-1));

    let flow = tree
        .edit_range(.., |k, _| match *k {
            2 => EditOp::DeleteBreak("gone"),
            _ => EditOp::NoOp,
        })
        .unwrap();
    assert_eq!(flow, ControlFlow::Break("gone"));
    assert!(!tree.has(&2).unwrap());
    tree.check_valid().unwrap();

    // completing scans report the visited count
    let noop = |_: &i32, _: Option<&i32>| -> EditOp<i32, ()> { EditOp::NoOp };
    let len = tree.len().unwrap();
    let flow = tree.edit_range(.., noop).unwrap();
    assert_eq!(flow, ControlFlow::Continue(len));
}

#[test]
fn absent_values() {
    let tree: Tree<String, i64> = Tree::new();
    let mut tree = tree
        .with_keys(["a".to_string(), "b".to_string(), "c".to_string()])
        .unwrap();
    assert!(tree.has(&"a".to_string()).unwrap());
    assert_eq!(tree.get(&"a".to_string()).unwrap(), None);
    assert_eq!(
        tree.pairs().unwrap(),
        vec![
            ("a".to_string(), None),
            ("b".to_string(), None),
            ("c".to_string(), None),
        ]
    );
    // materializing one value leaves the others absent
    tree.set("b".to_string(), 2).unwrap();
    assert_eq!(
        tree.pairs().unwrap(),
        vec![
            ("a".to_string(), None),
            ("b".to_string(), Some(2)),
            ("c".to_string(), None),
        ]
    );
    // with_keys never clobbers existing values
    let tree = tree.with_keys(["b".to_string()]).unwrap();
    assert_eq!(tree.get(&"b".to_string()).unwrap(), Some(2));
    assert_eq!(tree.len().unwrap(), 3);
}

#[test]
fn absent_values_survive_commit() {
    let store = Arc::new(MemoryBlobStore::new());
    let mut tree: Tree<String, i64> = Tree::attached(store.clone(), opts(4));
    for i in 0..50 {
        tree.set_opt(format!("k{i:02}"), (i % 2 == 0).then_some(i), true)
            .unwrap();
    }
    let root = tree.commit().unwrap();
    let reopened: Tree<String, i64> = Tree::open(store, root, opts(4));
    for i in 0..50 {
        let key = format!("k{i:02}");
        assert!(reopened.has(&key).unwrap());
        assert_eq!(reopened.get(&key).unwrap(), (i % 2 == 0).then_some(i));
    }
}

#[test]
fn persistent_variants() {
    let base: Tree<i32, i32> = Tree::from_pairs((0..20).map(|k| (k, k)), opts(4)).unwrap();

    let added = base.with(20, 20).unwrap();
    assert_eq!(added.len().unwrap(), 21);
    assert_eq!(base.len().unwrap(), 20);

    let removed = base.without(&0).unwrap();
    assert!(!removed.has(&0).unwrap());
    assert!(base.has(&0).unwrap());

    let trimmed = base.without_range(5..15).unwrap();
    assert_eq!(trimmed.len().unwrap(), 10);

    let without = base.without_keys([1, 3, 5]).unwrap();
    assert_eq!(without.len().unwrap(), 17);

    let merged = base.with_pairs([(100, 100), (0, -1)], false).unwrap();
    assert_eq!(merged.get(&0).unwrap(), Some(0));
    assert_eq!(merged.get(&100).unwrap(), Some(100));

    let evens = base.filter(|k, _| k % 2 == 0).unwrap();
    assert_eq!(evens.len().unwrap(), 10);
    assert_eq!(base.len().unwrap(), 20);

    let doubled = base.map_values(|_, v| v.map(|v| v * 2)).unwrap();
    assert_eq!(doubled.get(&7).unwrap(), Some(14));
    assert_eq!(base.get(&7).unwrap(), Some(7));
}

#[test]
fn greedy_clone_isolation() {
    let mut tree: Tree<i32, i32> = Tree::with_options(opts(4));
    for k in 0..100 {
        tree.set(k, k).unwrap();
    }
    let eager = tree.greedy_clone(false);
    assert_eq!(eager.pairs().unwrap(), tree.pairs().unwrap());
    tree.delete_range(10..90).unwrap();
    assert_eq!(eager.len().unwrap(), 100);
    eager.check_valid().unwrap();
    tree.check_valid().unwrap();

    // force-copying an already shared tree also yields an isolated copy
    let shared = eager.clone();
    let forced = shared.greedy_clone(true);
    let mut eager = eager;
    eager.clear().unwrap();
    assert_eq!(forced.len().unwrap(), 100);
    assert_eq!(shared.len().unwrap(), 100);
}

#[test]
fn set_if_absent_and_set_pairs() {
    let mut tree: Tree<i32, i32> = Tree::new();
    assert!(tree.set_if_absent(1, 10).unwrap());
    assert!(!tree.set_if_absent(1, 99).unwrap());
    assert_eq!(tree.get(&1).unwrap(), Some(10));

    let added = tree.set_pairs([(1, 0), (2, 20), (3, 30)], false).unwrap();
    assert_eq!(added, 2);
    assert_eq!(tree.get(&1).unwrap(), Some(10));

    let added = tree.set_pairs([(1, 0), (4, 40)], true).unwrap();
    assert_eq!(added, 1);
    assert_eq!(tree.get(&1).unwrap(), Some(0));
}

#[test]
fn empty_tree_operations() {
    let mut tree: Tree<i32, i32> = Tree::new();
    assert!(tree.is_empty().unwrap());
    assert_eq!(tree.get(&1).unwrap(), None);
    assert!(!tree.delete(&1).unwrap());
    assert_eq!(tree.delete_range(..).unwrap(), 0);
    assert_eq!(tree.min_key().unwrap(), None);
    assert_eq!(tree.max_key().unwrap(), None);
    assert_eq!(tree.first_pair().unwrap(), None);
    assert_eq!(tree.last_pair().unwrap(), None);
    assert_eq!(tree.height().unwrap(), 0);
    assert_eq!(tree.pairs().unwrap(), vec![]);
    tree.check_valid().unwrap();

    let other: Tree<i32, i32> = Tree::new();
    let out = tree.diff(&other, no_emit, no_emit, no_diff).unwrap();
    assert_eq!(out, None);
}

#[test]
fn empty_tree_commit_round_trip() {
    let store = Arc::new(MemoryBlobStore::new());
    let tree: Tree<i32, i32> = Tree::attached(store.clone(), opts(4));
    let root = tree.commit().unwrap();
    let reopened: Tree<i32, i32> = Tree::open(store, root, opts(4));
    assert_eq!(reopened.len().unwrap(), 0);
    assert_eq!(reopened.pairs().unwrap(), vec![]);
}

#[test]
fn store_errors() {
    let tree: Tree<i32, i32> = Tree::new();
    assert!(matches!(tree.commit(), Err(Error::NoStore)));

    let store = Arc::new(MemoryBlobStore::new());
    let missing: BlobId = BlobId::for_bytes(b"never written");
    let reopened: Tree<i32, i32> = Tree::open(store.clone(), missing, opts(4));
    assert!(matches!(reopened.get(&1), Err(Error::BlobNotFound(_))));

    let garbage = BlobId::for_bytes(b"garbage");
    store.put(&garbage, b"not a node").unwrap();
    let corrupt: Tree<i32, i32> = Tree::open(store, garbage, opts(4));
    assert!(matches!(corrupt.len(), Err(Error::CorruptNode(_))));
}

#[test]
fn load_points_tree_at_new_root() {
    let store = Arc::new(MemoryBlobStore::new());
    let mut tree: Tree<i32, i32> = Tree::attached(store.clone(), opts(4));
    for k in 0..100 {
        tree.set(k, k).unwrap();
    }
    let first = tree.commit().unwrap();
    tree.delete_range(50..).unwrap();
    let second = tree.commit().unwrap();
    assert_ne!(first, second);
    assert_eq!(tree.root_id(), Some(second.clone()));

    tree.load(first).unwrap();
    assert_eq!(tree.len().unwrap(), 100);
    tree.load(second).unwrap();
    assert_eq!(tree.len().unwrap(), 50);
}

#[test]
fn randomized_churn_against_btreemap() {
    let _ = env_logger::try_init();
    let mut rng = get_rng();
    for fanout in [4, 7, 32] {
        let mut tree: Tree<i64, i64> = Tree::with_options(opts(fanout));
        let mut oracle: BTreeMap<i64, i64> = BTreeMap::new();
        let mut snapshots: Vec<(Tree<i64, i64>, BTreeMap<i64, i64>)> = Vec::new();

        for batch in 0..40 {
            for _ in 0..50 {
                match rng.gen_range(0..100) {
                    0..=59 => {
                        let k = rng.gen_range(0..1500);
                        let v = rng.gen();
                        tree.set(k, v).unwrap();
                        oracle.insert(k, v);
                    }
                    60..=84 => {
                        let k = rng.gen_range(0..1500);
                        assert_eq!(tree.delete(&k).unwrap(), oracle.remove(&k).is_some());
                    }
                    85..=94 => {
                        let lo = rng.gen_range(0..1500);
                        let hi = lo + rng.gen_range(0..50);
                        let removed = tree.delete_range(lo..=hi).unwrap();
                        let before = oracle.len();
                        oracle.retain(|k, _| *k < lo || *k > hi);
                        assert_eq!(removed, (before - oracle.len()) as u64);
                    }
                    _ => {
                        snapshots.push((tree.clone(), oracle.clone()));
                        if snapshots.len() > 4 {
                            snapshots.remove(0);
                        }
                    }
                }
            }
            tree.check_valid()
                .unwrap_or_else(|e| panic!("fanout {fanout} batch {batch}: {e}"));
            assert_eq!(tree.len().unwrap(), oracle.len() as u64);
            let expect: Vec<_> = oracle.iter().map(|(k, v)| (*k, Some(*v))).collect();
            assert_eq!(tree.pairs().unwrap(), expect);
            for _ in 0..20 {
                let k = rng.gen_range(0..1500);
                assert_eq!(tree.get(&k).unwrap(), oracle.get(&k).copied());
                assert_eq!(
                    tree.next_lower_pair(&k).unwrap(),
                    oracle.range(..k).next_back().map(|(k, v)| (*k, Some(*v)))
                );
                assert_eq!(
                    tree.next_higher_pair(&k).unwrap(),
                    oracle
                        .range((Bound::Excluded(k), Bound::Unbounded))
                        .next()
                        .map(|(k, v)| (*k, Some(*v)))
                );
            }
        }

        // clones taken mid-churn never observed later edits
        for (snapshot, snapshot_oracle) in &snapshots {
            snapshot.check_valid().unwrap();
            let expect: Vec<_> = snapshot_oracle
                .iter()
                .map(|(k, v)| (*k, Some(*v)))
                .collect();
            assert_eq!(snapshot.pairs().unwrap(), expect);
        }
    }
}

#[test]
fn for_range_counts_and_breaks() {
    let tree: Tree<i32, i32> = Tree::from_pairs((0..100).map(|k| (k, k)), opts(4)).unwrap();
    let flow = tree
        .for_range(10..20, |_, _| ControlFlow::<()>::Continue(()))
        .unwrap();
    assert_eq!(flow, ControlFlow::Continue(10));

    let flow = tree
        .for_range(.., |k, _| {
            if *k == 42 {
                ControlFlow::Break(*k)
            } else {
                ControlFlow::Continue(())
            }
        })
        .unwrap();
    assert_eq!(flow, ControlFlow::Break(42));

    // exclusive and unbounded range forms
    assert_eq!(tree.get_range(95.., usize::MAX).unwrap().len(), 5);
    assert_eq!(tree.get_range(..5, usize::MAX).unwrap().len(), 5);
    assert_eq!(
        tree.get_range((Bound::Excluded(10), Bound::Included(20)), usize::MAX)
            .unwrap()
            .len(),
        10
    );
    assert_eq!(tree.get_range(.., 7).unwrap().len(), 7);
}

#[test]
fn file_store_persistence() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let root_id;
    {
        let store = Arc::new(FileBlobStore::new(dir.path()).unwrap());
        let mut tree: Tree<String, String> = Tree::attached(store, opts(4));
        for i in 0..200 {
            tree.set(format!("key{i:04}"), format!("value{i}")).unwrap();
        }
        root_id = tree.commit().unwrap();
    }
    // a fresh store over the same directory serves the committed tree
    let store = Arc::new(FileBlobStore::new(dir.path()).unwrap());
    let tree: Tree<String, String> = Tree::open(store, root_id, opts(4));
    assert_eq!(tree.len().unwrap(), 200);
    assert_eq!(
        tree.get(&"key0123".to_string()).unwrap(),
        Some("value123".to_string())
    );
    tree.check_valid().unwrap();
}

#[test]
fn from_iterator_and_extend() {
    let mut tree: Tree<i32, i32> = (0..10).map(|k| (k, k)).collect();
    assert_eq!(tree.len().unwrap(), 10);
    tree.extend((10..20).map(|k| (k, k)));
    assert_eq!(tree.len().unwrap(), 20);
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    fn oracle_tree(keys: &[i64], fanout: usize) -> (Tree<i64, i64>, BTreeMap<i64, i64>) {
        let mut tree = Tree::with_options(opts(fanout));
        let mut oracle = BTreeMap::new();
        for &k in keys {
            tree.set(k, k * 2).unwrap();
            oracle.insert(k, k * 2);
        }
        (tree, oracle)
    }

    proptest! {
        #[test]
        fn floor_ceil_match_btreemap(
            keys in proptest::collection::vec(0i64..1000, 0..150),
            probes in proptest::collection::vec(0i64..1000, 1..50),
        ) {
            let (tree, oracle) = oracle_tree(&keys, 4);
            for p in probes {
                prop_assert_eq!(
                    tree.pair_or_next_lower(Bound::Included(&p)).unwrap(),
                    oracle.range(..=p).next_back().map(|(k, v)| (*k, Some(*v)))
                );
                prop_assert_eq!(
                    tree.next_lower_pair(&p).unwrap(),
                    oracle.range(..p).next_back().map(|(k, v)| (*k, Some(*v)))
                );
                prop_assert_eq!(
                    tree.pair_or_next_higher(Bound::Included(&p)).unwrap(),
                    oracle.range(p..).next().map(|(k, v)| (*k, Some(*v)))
                );
                prop_assert_eq!(
                    tree.next_higher_pair(&p).unwrap(),
                    oracle
                        .range((Bound::Excluded(p), Bound::Unbounded))
                        .next()
                        .map(|(k, v)| (*k, Some(*v)))
                );
            }
        }

        #[test]
        fn ranges_match_btreemap(
            keys in proptest::collection::vec(0i64..500, 0..120),
            lo in 0i64..500,
            len in 0i64..100,
        ) {
            let (tree, oracle) = oracle_tree(&keys, 4);
            let hi = lo + len;
            let got = tree.get_range(lo..=hi, usize::MAX).unwrap();
            let expect: Vec<_> = oracle
                .range(lo..=hi)
                .map(|(k, v)| (*k, Some(*v)))
                .collect();
            prop_assert_eq!(got, expect);
        }

        #[test]
        fn delete_range_matches_btreemap(
            keys in proptest::collection::vec(0i64..500, 0..120),
            lo in 0i64..500,
            len in 0i64..100,
        ) {
            let (mut tree, mut oracle) = oracle_tree(&keys, 4);
            let hi = lo + len;
            let removed = tree.delete_range(lo..hi).unwrap();
            let before = oracle.len();
            oracle.retain(|k, _| *k < lo || *k >= hi);
            prop_assert_eq!(removed, (before - oracle.len()) as u64);
            tree.check_valid().unwrap();
            let expect: Vec<_> = oracle.iter().map(|(k, v)| (*k, Some(*v))).collect();
            prop_assert_eq!(tree.pairs().unwrap(), expect);
        }
    }
}
