//! Append-only Merkle tree with domain separated hashing.
//!
//! Leaves are hashed as `SHA256(0x00 || data)` and interior nodes as
//! `SHA256(0x01 || left || right)`. A node without a right sibling is carried
//! up to the next level unchanged, so the tree over `n` leaves splits at the
//! largest power of two strictly smaller than `n`. Inclusion paths list the
//! sibling hashes from the leaf upwards, omitting levels where the node was
//! carried up.
use derive_more::{From, Into};
use sha2::{Digest, Sha256};
use std::{fmt, str::FromStr};

/// Size of a Merkle hash in bytes.
pub const HASH_SIZE: usize = 32;

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From, Into)]
/// A leaf, node or root hash.
pub struct MerkleHash([u8; HASH_SIZE]);

impl MerkleHash {
    pub fn bytes(&self) -> &[u8; HASH_SIZE] { &self.0 }

    pub fn to_hex(&self) -> String { hex::encode(self.0) }
}

impl AsRef<[u8]> for MerkleHash {
    fn as_ref(&self) -> &[u8] { &self.0 }
}

impl fmt::Display for MerkleHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.to_hex()) }
}

impl fmt::Debug for MerkleHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "MerkleHash({})", self) }
}

#[derive(Debug, thiserror::Error)]
pub enum HashFromStrError {
    #[error("Not a valid hex string: {0}")]
    HexDecodeError(#[from] hex::FromHexError),
    #[error("Incorrect length, found {found}, expected 32.")]
    IncorrectLength { found: usize },
}

impl TryFrom<&[u8]> for MerkleHash {
    type Error = HashFromStrError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; HASH_SIZE] =
            value.try_into().map_err(|_| HashFromStrError::IncorrectLength {
                found: value.len(),
            })?;
        Ok(Self(bytes))
    }
}

impl FromStr for MerkleHash {
    type Err = HashFromStrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        Self::try_from(bytes.as_slice())
    }
}

impl serde::Serialize for MerkleHash {
    fn serialize<S: serde::Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&self.to_hex())
    }
}

impl<'de> serde::Deserialize<'de> for MerkleHash {
    fn deserialize<D: serde::Deserializer<'de>>(des: D) -> Result<Self, D::Error> {
        let s = String::deserialize(des)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Hash of a leaf's data.
pub fn leaf_hash(data: &[u8]) -> MerkleHash {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(data);
    MerkleHash(hasher.finalize().into())
}

/// Hash of an interior node given its two children.
pub fn node_hash(left: &MerkleHash, right: &MerkleHash) -> MerkleHash {
    let mut hasher = Sha256::new();
    hasher.update([NODE_PREFIX]);
    hasher.update(left.0);
    hasher.update(right.0);
    MerkleHash(hasher.finalize().into())
}

/// Root of the tree with no leaves, the hash of the empty string.
pub fn empty_root() -> MerkleHash { MerkleHash(Sha256::digest(b"").into()) }

/// An in-memory Merkle tree that only grows by appending leaves.
///
/// All levels are retained, so that roots and inclusion paths for the current
/// size are available without recomputation.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    /// `levels[0]` are the leaf hashes, the last level holds the root once
    /// the tree is non-empty.
    levels: Vec<Vec<MerkleHash>>,
}

impl Default for MerkleTree {
    fn default() -> Self { Self::new() }
}

impl MerkleTree {
    pub fn new() -> Self {
        Self {
            levels: vec![Vec::new()],
        }
    }

    /// Build a tree over the given leaves, in order.
    pub fn build<I, L>(leaves: I) -> Self
    where
        I: IntoIterator<Item = L>,
        L: AsRef<[u8]>, {
        let mut tree = Self::new();
        for leaf in leaves {
            tree.push(leaf.as_ref());
        }
        tree
    }

    /// Append a leaf, returning its index.
    pub fn push(&mut self, data: &[u8]) -> u64 {
        self.levels[0].push(leaf_hash(data));
        let index = self.levels[0].len() - 1;
        // Only the rightmost node of every level changes on append.
        let mut level = 0;
        loop {
            let len = self.levels[level].len();
            if len == 1 {
                break;
            }
            let last = len - 1;
            let parent = if last % 2 == 1 {
                node_hash(&self.levels[level][last - 1], &self.levels[level][last])
            } else {
                self.levels[level][last]
            };
            if self.levels.len() == level + 1 {
                self.levels.push(Vec::new());
            }
            let up = &mut self.levels[level + 1];
            if last / 2 < up.len() {
                up[last / 2] = parent;
            } else {
                up.push(parent);
            }
            level += 1;
        }
        index as u64
    }

    pub fn leaf_count(&self) -> u64 { self.levels[0].len() as u64 }

    pub fn is_empty(&self) -> bool { self.levels[0].is_empty() }

    pub fn root(&self) -> MerkleHash {
        match self.levels.last().and_then(|top| top.first()) {
            Some(root) if !self.is_empty() => *root,
            _ => empty_root(),
        }
    }

    /// Inclusion path of the leaf at `index`, or [`None`] if the index is out
    /// of range.
    pub fn prove(&self, index: u64) -> Option<Vec<MerkleHash>> {
        if index >= self.leaf_count() {
            return None;
        }
        let mut idx = index as usize;
        let mut path = Vec::new();
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling = idx ^ 1;
            if sibling < level.len() {
                path.push(level[sibling]);
            }
            idx /= 2;
        }
        Some(path)
    }
}

/// Check that `data` is the leaf at `index` in the tree of `tree_size` leaves
/// with the given `root`. Any malformed input yields `false`.
pub fn verify(
    index: u64,
    tree_size: u64,
    root: &MerkleHash,
    data: &[u8],
    path: &[MerkleHash],
) -> bool {
    if index >= tree_size {
        return false;
    }
    let mut fnode = index;
    let mut snode = tree_size - 1;
    let mut hash = leaf_hash(data);
    for sibling in path {
        if snode == 0 {
            return false;
        }
        if fnode & 1 == 1 || fnode == snode {
            hash = node_hash(sibling, &hash);
            if fnode & 1 == 0 {
                while fnode & 1 == 0 && fnode != 0 {
                    fnode >>= 1;
                    snode >>= 1;
                }
            }
        } else {
            hash = node_hash(&hash, sibling);
        }
        fnode >>= 1;
        snode >>= 1;
    }
    snode == 0 && &hash == root
}
