//! Content-addressed blob storage.
//!
//! Committed nodes are keyed by [BlobId], the blake3-256 of their canonical
//! serialized form, so `put` is idempotent and identical subtrees dedup for
//! free. Two backends are provided: an in-memory store for ephemeral use and
//! tests, and a sharded filesystem store.

use std::{
    fmt,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    str::FromStr,
};

use dashmap::DashMap;

use crate::error::Error;

/// Content identifier of a committed node: lowercase hex of the blake3-256
/// hash of its canonical byte form.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobId(Box<str>);

impl BlobId {
    pub(crate) fn for_bytes(bytes: &[u8]) -> Self {
        BlobId(blake3::hash(bytes).to_hex().as_str().into())
    }

    /// The id as lowercase hex.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobId({})", &self.0)
    }
}

impl FromStr for BlobId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if s.len() != 64 || !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(Error::validation(format!("malformed blob id {s:?}")));
        }
        Ok(BlobId(s.into()))
    }
}

impl AsRef<str> for BlobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Byte-addressed content store.
///
/// `put` must be idempotent for a given id and `get` must return exactly the
/// bytes previously written. Stores are shared across trees and must be safe
/// for whatever concurrency the host uses; the engine itself serializes all
/// access within one tree.
pub trait BlobStore {
    /// Fetches the blob for `id`, `None` when absent.
    fn get(&self, id: &BlobId) -> Result<Option<Vec<u8>>, Error>;

    /// Writes a blob under `id`. Writing the same id again is a no-op.
    fn put(&self, id: &BlobId, bytes: &[u8]) -> Result<(), Error>;

    /// Whether a blob exists for `id`.
    fn contains(&self, id: &BlobId) -> Result<bool, Error>;
}

/// In-memory [BlobStore].
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<BlobId, Vec<u8>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blobs held.
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

impl BlobStore for MemoryBlobStore {
    fn get(&self, id: &BlobId) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.blobs.get(id).map(|b| b.clone()))
    }

    fn put(&self, id: &BlobId, bytes: &[u8]) -> Result<(), Error> {
        self.blobs.entry(id.clone()).or_insert_with(|| bytes.to_vec());
        Ok(())
    }

    fn contains(&self, id: &BlobId) -> Result<bool, Error> {
        Ok(self.blobs.contains_key(id))
    }
}

/// Filesystem [BlobStore].
///
/// Blobs shard over three directory levels derived from the first four hex
/// nibbles of the id (interpreted as a 16 bit integer, split into mod-256
/// components), yielding `<root>/<d1>/<d2>/<d3>/<id>.json`.
#[derive(Debug)]
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// The store's root directory.
    pub fn path(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, id: &BlobId) -> PathBuf {
        let n = u32::from_str_radix(&id.as_str()[..4], 16).unwrap_or(0);
        let (d1, d2, d3) = (n & 0xff, (n >> 8) & 0xff, (n >> 16) & 0xff);
        self.root
            .join(d1.to_string())
            .join(d2.to_string())
            .join(d3.to_string())
            .join(format!("{id}.json"))
    }
}

impl BlobStore for FileBlobStore {
    fn get(&self, id: &BlobId) -> Result<Option<Vec<u8>>, Error> {
        match fs::read(self.blob_path(id)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, id: &BlobId, bytes: &[u8]) -> Result<(), Error> {
        let path = self.blob_path(id);
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, bytes)?;
        trace!("wrote blob {} ({} bytes)", id, bytes.len());
        Ok(())
    }

    fn contains(&self, id: &BlobId) -> Result<bool, Error> {
        Ok(self.blob_path(id).exists())
    }
}
