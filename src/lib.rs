//! Bosk is an ordered key-value container backed by an in-memory B+Tree with
//! two capabilities ordinary maps lack:
//!
//! * **O(1) copy-on-write clones.** Cloning a [Tree] shares its node graph;
//!   later edits copy only the touched root-to-leaf paths, so clones are
//!   cheap at any size and never observe each other's changes. A
//!   sharing-aware [diff](Tree::diff) compares two trees without entering
//!   subtrees they still share.
//! * **Content-addressed persistence.** With a [BlobStore] attached,
//!   [commit](Tree::commit) writes every changed node under the blake3 hash
//!   of its canonical serialized form and returns a single root id.
//!   [open](Tree::open)ing that id later costs nothing up front: nodes
//!   rehydrate lazily from the store as operations first touch them, so a
//!   small range read of a huge committed tree fetches only a root-to-leaf
//!   sliver of blobs.
//!
//! # Example
//!
//! ```
//! use bosk::Tree;
//!
//! # fn main() -> Result<(), bosk::Error> {
//! let mut tree = Tree::new();
//! tree.set("b", 2)?;
//! tree.set("a", 1)?;
//!
//! let snapshot = tree.clone(); // O(1)
//! tree.set("c", 3)?;
//!
//! assert_eq!(tree.len()?, 3);
//! assert_eq!(snapshot.len()?, 2);
//! assert_eq!(snapshot.get(&"c")?, None);
//! # Ok(())
//! # }
//! ```
//!
//! # Keys, values and ordering
//!
//! Keys and values are opaque to the engine; keys are placed by a pluggable
//! [KeyOrder] supplied at construction (default [NaturalOrder], which uses
//! `PartialOrd` and rejects unorderable keys such as NaN). Persistence
//! additionally requires keys and values to be serde-serializable.
//!
//! # Concurrency
//!
//! A tree is owned by one logical task at a time and is not internally
//! synchronized. Distinct trees (including clones) are independent; the blob
//! store is the only shared collaborator and must be safe for the host's
//! concurrency, which both provided stores are.

#[macro_use]
extern crate derive_more;
#[macro_use]
extern crate log;

mod diff;
mod error;
mod link;
mod node;
mod options;
mod order;
mod scan;
mod store;
mod tree;

#[cfg(test)]
mod tests;

pub use error::Error;
pub use options::{TreeOptions, DEFAULT_FANOUT, MAX_FANOUT, MIN_FANOUT};
pub use order::{KeyOrder, NaturalOrder, ReverseOrder};
pub use scan::EditOp;
pub use store::{BlobId, BlobStore, FileBlobStore, MemoryBlobStore};
pub use tree::Tree;
