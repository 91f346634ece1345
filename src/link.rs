use std::{cell::RefCell, fmt};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use triomphe::Arc;

use crate::{
    error::{error_corrupt, Error},
    node::{Branch, Leaf, LeafValues, Node},
    order::KeyOrder,
    store::{BlobId, BlobStore},
};

pub(crate) type SharedNode<K, V> = Arc<Node<K, V>>;

/// Everything a node operation needs from its owning tree: the key order,
/// plus the store and codec when persistence is attached.
pub(crate) struct TreeCtx<'a, K, V, C> {
    pub store: Option<&'a dyn BlobStore>,
    pub codec: Option<&'a Codec<K, V>>,
    pub order: &'a C,
}

/// Handle to a node: either materialized in memory or known only by content
/// id, in which case the node is fetched and parsed on first access.
///
/// `saved` tracks the content id as of the last load or commit; any structural
/// mutation clears it. Lazy loads and commit bookkeeping go through the
/// `RefCell` so they work on shared (`&`) paths, benefiting every tree that
/// shares the node; structural mutation requires `&mut` and copies-on-write
/// through the node's `Arc`.
pub(crate) struct Link<K, V> {
    state: RefCell<LinkState<K, V>>,
}

enum LinkState<K, V> {
    Loaded {
        node: SharedNode<K, V>,
        saved: Option<BlobId>,
    },
    Unloaded {
        id: BlobId,
    },
}

impl<K, V> Link<K, V> {
    /// Wraps a freshly constructed node (loaded, unsaved).
    pub fn from_node(node: Node<K, V>) -> Self {
        Self::from_parts(Arc::new(node), None)
    }

    /// Wraps a content id (unloaded).
    pub fn from_id(id: BlobId) -> Self {
        Link {
            state: RefCell::new(LinkState::Unloaded { id }),
        }
    }

    fn from_parts(node: SharedNode<K, V>, saved: Option<BlobId>) -> Self {
        Link {
            state: RefCell::new(LinkState::Loaded { node, saved }),
        }
    }

    /// Content id under which this node is known to be saved, if unchanged
    /// since its last load or commit.
    pub fn saved_id(&self) -> Option<BlobId> {
        match &*self.state.borrow() {
            LinkState::Loaded { saved, .. } => saved.clone(),
            LinkState::Unloaded { id } => Some(id.clone()),
        }
    }

    /// The node behind this link, loading it first if necessary. The returned
    /// `Arc` is a cheap handout; no structural borrow is held.
    pub fn node<C: KeyOrder<K>>(
        &self,
        ctx: &TreeCtx<'_, K, V, C>,
    ) -> Result<SharedNode<K, V>, Error> {
        {
            let state = self.state.borrow();
            if let LinkState::Loaded { node, .. } = &*state {
                return Ok(node.clone());
            }
        }
        let mut state = self.state.borrow_mut();
        match &mut *state {
            LinkState::Loaded { node, .. } => Ok(node.clone()),
            LinkState::Unloaded { id } => {
                let (node, id) = fetch_node(ctx, id)?;
                let node = Arc::new(node);
                let out = node.clone();
                *state = LinkState::Loaded {
                    node,
                    saved: Some(id),
                };
                Ok(out)
            }
        }
    }

    /// Mutable access for the structural edit path: loads if necessary,
    /// clones-on-write when the node is shared, and marks the link dirty.
    pub fn node_mut<C: KeyOrder<K>>(
        &mut self,
        ctx: &TreeCtx<'_, K, V, C>,
    ) -> Result<&mut Node<K, V>, Error>
    where
        K: Clone,
        V: Clone,
    {
        let state = self.state.get_mut();
        if let LinkState::Unloaded { id } = &*state {
            let (node, id) = fetch_node(ctx, id)?;
            *state = LinkState::Loaded {
                node: Arc::new(node),
                saved: Some(id),
            };
        }
        match state {
            LinkState::Loaded { node, saved } => {
                *saved = None;
                Ok(make_mut(node))
            }
            LinkState::Unloaded { .. } => unreachable!(),
        }
    }

    /// Takes the node out of the link, cloning when it is shared (which in
    /// turn shares its children, keeping the copy-on-write discipline intact
    /// for entries migrating between parents).
    pub fn take_node<C: KeyOrder<K>>(self, ctx: &TreeCtx<'_, K, V, C>) -> Result<Node<K, V>, Error>
    where
        K: Clone,
        V: Clone,
    {
        match self.state.into_inner() {
            LinkState::Loaded { node, .. } => Ok(match Arc::try_unwrap(node) {
                Ok(node) => node,
                Err(node) => (*node).clone(),
            }),
            LinkState::Unloaded { id } => Ok(fetch_node(ctx, &id)?.0),
        }
    }

    /// Eager copy for `greedy_clone`: duplicates every node this tree owns
    /// exclusively (all of them with `force`), shares the rest, and copies
    /// unloaded links by id without fetching anything.
    pub fn deep_clone(&self, force: bool) -> Self
    where
        K: Clone,
        V: Clone,
    {
        match &*self.state.borrow() {
            LinkState::Unloaded { id } => Link::from_id(id.clone()),
            LinkState::Loaded { node, saved } => {
                if !force && !node.is_unique() {
                    return Link::from_parts(node.clone(), saved.clone());
                }
                let copy = match &**node {
                    Node::Leaf(leaf) => Node::Leaf(leaf.clone()),
                    Node::Branch(branch) => Node::Branch(Branch {
                        keys: branch.keys.clone(),
                        children: branch
                            .children
                            .iter()
                            .map(|child| child.deep_clone(force))
                            .collect(),
                    }),
                };
                Link::from_parts(Arc::new(copy), saved.clone())
            }
        }
    }

    /// Depth-first commit. Already-saved and unloaded nodes short-circuit to
    /// their id; dirty nodes commit their children first, serialize with the
    /// child ids, hash, and write the blob unless the store already holds it.
    pub fn commit(&self, store: &dyn BlobStore, codec: &Codec<K, V>) -> Result<BlobId, Error> {
        let node = {
            let state = self.state.borrow();
            match &*state {
                LinkState::Unloaded { id } => return Ok(id.clone()),
                LinkState::Loaded {
                    saved: Some(id), ..
                } => return Ok(id.clone()),
                LinkState::Loaded { node, .. } => node.clone(),
            }
        };
        let child_ids = match &*node {
            Node::Branch(branch) => branch
                .children
                .iter()
                .map(|child| child.commit(store, codec))
                .collect::<Result<Vec<_>, _>>()?,
            Node::Leaf(_) => Vec::new(),
        };
        let bytes = (codec.encode)(&node, &child_ids)?;
        let id = BlobId::for_bytes(&bytes);
        if !store.contains(&id)? {
            store.put(&id, &bytes)?;
            trace!("committed node {id} ({} bytes)", bytes.len());
        }
        match &mut *self.state.borrow_mut() {
            LinkState::Loaded { saved, .. } => *saved = Some(id.clone()),
            LinkState::Unloaded { .. } => unreachable!(),
        }
        Ok(id)
    }
}

impl<K, V> Clone for Link<K, V> {
    fn clone(&self) -> Self {
        match &*self.state.borrow() {
            LinkState::Loaded { node, saved } => Self::from_parts(node.clone(), saved.clone()),
            LinkState::Unloaded { id } => Self::from_id(id.clone()),
        }
    }
}

impl<K, V> fmt::Debug for Link<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.state.borrow() {
            LinkState::Loaded { node, saved } => write!(
                f,
                "Link(loaded, len {}, {})",
                node.len(),
                if saved.is_some() { "clean" } else { "dirty" }
            ),
            LinkState::Unloaded { id } => write!(f, "Link(unloaded, {id})"),
        }
    }
}

/// Clone-on-write access to a possibly shared node.
fn make_mut<K: Clone, V: Clone>(node: &mut SharedNode<K, V>) -> &mut Node<K, V> {
    if !node.is_unique() {
        // Cloning a branch clones its child links, so the children become
        // shared with whatever still references the old node.
        *node = Arc::new((**node).clone());
    }
    Arc::get_mut(node).unwrap()
}

fn fetch_node<K, V, C: KeyOrder<K>>(
    ctx: &TreeCtx<'_, K, V, C>,
    id: &BlobId,
) -> Result<(Node<K, V>, BlobId), Error> {
    let store = ctx.store.ok_or(Error::NoStore)?;
    let codec = ctx.codec.ok_or(Error::NoStore)?;
    let bytes = store
        .get(id)?
        .ok_or_else(|| Error::blob_not_found(id.as_str()))?;
    let node = (codec.decode)(&bytes)?;
    node.check_decoded(ctx.order)?;
    trace!("loaded node {id}");
    Ok((node, id.clone()))
}

/// Encode/decode function pair for node blobs.
///
/// Captured as plain function pointers when persistence is attached, so the
/// serde bounds live only on the persistence constructors instead of leaking
/// onto every tree operation.
pub(crate) struct Codec<K, V> {
    pub encode: fn(&Node<K, V>, &[BlobId]) -> Result<Vec<u8>, Error>,
    pub decode: fn(&[u8]) -> Result<Node<K, V>, Error>,
}

impl<K, V> Clone for Codec<K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, V> Copy for Codec<K, V> {}

impl<K, V> Codec<K, V>
where
    K: Serialize + DeserializeOwned,
    V: Serialize + DeserializeOwned,
{
    pub fn json() -> Self {
        Codec {
            encode: encode_json::<K, V>,
            decode: decode_json::<K, V>,
        }
    }
}

/// Canonical blob form of a node. Field order is fixed; equal logical content
/// yields identical bytes and therefore identical ids. Branch `keys` are the
/// cached max-keys, parallel to `children`.
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum NodeRecordRef<'a, K, V> {
    Leaf {
        keys: &'a [K],
        #[serde(skip_serializing_if = "Option::is_none")]
        values: Option<&'a [Option<V>]>,
    },
    Branch {
        keys: &'a [K],
        children: Vec<&'a str>,
    },
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
#[serde(bound(deserialize = "K: DeserializeOwned, V: DeserializeOwned"))]
enum NodeRecord<K, V> {
    Leaf {
        keys: Vec<K>,
        #[serde(default)]
        values: Option<Vec<Option<V>>>,
    },
    Branch {
        keys: Vec<K>,
        children: Vec<String>,
    },
}

fn encode_json<K: Serialize, V: Serialize>(
    node: &Node<K, V>,
    child_ids: &[BlobId],
) -> Result<Vec<u8>, Error> {
    let record = match node {
        Node::Leaf(leaf) => NodeRecordRef::Leaf {
            keys: &leaf.keys,
            values: match &leaf.values {
                LeafValues::Vacant => None,
                // All-absent slot vectors normalize to the vacant form so
                // logically equal leaves hash identically.
                LeafValues::Filled(v) if v.iter().all(Option::is_none) => None,
                LeafValues::Filled(v) => Some(v),
            },
        },
        Node::Branch(branch) => NodeRecordRef::Branch {
            keys: &branch.keys,
            children: child_ids.iter().map(BlobId::as_str).collect(),
        },
    };
    Ok(serde_json::to_vec(&record)?)
}

fn decode_json<K: DeserializeOwned, V: DeserializeOwned>(
    bytes: &[u8],
) -> Result<Node<K, V>, Error> {
    let record: NodeRecord<K, V> = serde_json::from_slice(bytes)?;
    Ok(match record {
        NodeRecord::Leaf { keys, values } => {
            let values = match values {
                None => LeafValues::Vacant,
                Some(v) => {
                    if v.len() != keys.len() {
                        return Err(error_corrupt!(
                            "leaf blob with {} keys but {} value slots",
                            keys.len(),
                            v.len()
                        ));
                    }
                    LeafValues::Filled(v)
                }
            };
            Node::Leaf(Leaf { keys, values })
        }
        NodeRecord::Branch { keys, children } => {
            if children.is_empty() || children.len() != keys.len() {
                return Err(error_corrupt!(
                    "branch blob with {} keys but {} children",
                    keys.len(),
                    children.len()
                ));
            }
            let children = children
                .iter()
                .map(|id| {
                    id.parse::<BlobId>()
                        .map(Link::from_id)
                        .map_err(|_| error_corrupt!("malformed child id {id:?}"))
                })
                .collect::<Result<_, _>>()?;
            Node::Branch(Branch { keys, children })
        }
    })
}
