//! Relay blocks and the hash chain they form.
use super::{
    bloom::{BloomFilterState, BloomParameters},
    RelayError,
};
use crate::{
    constants::ROOT_CERTS_KEY,
    ledger::Block,
    merkle::{MerkleHash, MerkleTree},
    types::Fingerprint,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
/// Summary of one ledger block, linked to its predecessor by hash.
pub struct RelayBlock {
    pub index:    u32,
    /// Root of the tree over the batch roots committed by the ledger block.
    pub root:     MerkleHash,
    /// Hash of the serialized revocation filter, empty for the first block.
    #[serde(with = "crate::internal::byte_array_hex")]
    pub bloom:    Vec<u8>,
    /// Hash of the previous relay block, empty for the first block.
    #[serde(with = "crate::internal::byte_array_hex")]
    pub previous: Vec<u8>,
}

impl RelayBlock {
    /// `index` as four big endian bytes, followed by the root, the bloom
    /// filter hash and the previous block hash.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 32 + self.bloom.len() + self.previous.len());
        out.extend_from_slice(&self.index.to_be_bytes());
        out.extend_from_slice(self.root.as_ref());
        out.extend_from_slice(&self.bloom);
        out.extend_from_slice(&self.previous);
        out
    }

    pub fn hash(&self) -> MerkleHash {
        let digest: [u8; 32] = Sha256::digest(self.to_bytes()).into();
        MerkleHash::from(digest)
    }

    /// Whether `self` directly follows `previous` in the chain.
    pub fn follows(&self, previous: &RelayBlock) -> bool {
        u64::from(self.index) == u64::from(previous.index) + 1 && self.previous == previous.hash().as_ref()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
/// A signed relay block as published on the block topic.
pub struct RelayBlockMessage {
    pub block:     RelayBlock,
    #[serde(with = "crate::internal::hex_list")]
    pub siglist:   Vec<Vec<u8>>,
    pub blockhash: MerkleHash,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
/// The revocation filter committed to by relay block `index`.
pub struct BloomMessage {
    pub index:  u32,
    #[serde(with = "crate::internal::byte_array_hex")]
    pub filter: Vec<u8>,
}

/// Derives relay blocks from consecutive ledger blocks, starting at the
/// contract instantiation block. Used both for the live chain and to replay
/// it from scratch.
#[derive(Debug, Clone)]
pub struct ChainBuilder {
    genesis_block: u64,
    filter:        BloomFilterState,
    tail:          Option<RelayBlock>,
}

impl ChainBuilder {
    pub fn new(genesis_block: u64, bloom: &BloomParameters) -> Result<Self, RelayError> {
        Ok(Self {
            genesis_block,
            filter: BloomFilterState::new(bloom)?,
            tail: None,
        })
    }

    pub fn genesis_block(&self) -> u64 { self.genesis_block }

    /// Index of the next relay block.
    pub fn next_index(&self) -> u64 { self.tail.as_ref().map_or(0, |b| u64::from(b.index) + 1) }

    /// Ledger block the next relay block is derived from.
    pub fn next_block(&self) -> u64 { self.genesis_block + self.next_index() }

    pub fn tail(&self) -> Option<&RelayBlock> { self.tail.as_ref() }

    pub fn filter(&self) -> &BloomFilterState { &self.filter }

    /// Derive the relay block for `block`, which must be
    /// [`next_block`](Self::next_block), and make it the new tail. Fails once
    /// the relay index no longer fits in 32 bits.
    pub fn apply(&mut self, block: &Block) -> Result<RelayBlock, RelayError> {
        let expected = self.next_block();
        if block.number != expected {
            return Err(RelayError::OutOfOrder {
                expected,
                found: block.number,
            });
        }
        let index = u32::try_from(self.next_index()).map_err(|_| RelayError::IndexOverflow {
            block: block.number,
        })?;
        let relay_block = match &self.tail {
            None => RelayBlock {
                index,
                root:     genesis_tree(block)?.root(),
                bloom:    Vec::new(),
                previous: Vec::new(),
            },
            Some(tail) => {
                for key in revoked_fingerprints(block) {
                    self.filter.insert(&key);
                }
                RelayBlock {
                    index,
                    root:     block.root_tree().root(),
                    bloom:    self.filter.hash().to_vec(),
                    previous: tail.hash().as_ref().to_vec(),
                }
            }
        };
        self.tail = Some(relay_block.clone());
        Ok(relay_block)
    }
}

/// Tree over the trust anchors written by the contract instantiation.
fn genesis_tree(block: &Block) -> Result<MerkleTree, RelayError> {
    let mut tree = MerkleTree::new();
    let mut found = false;
    for write in block.accepted_writes() {
        if write.key != ROOT_CERTS_KEY {
            return Err(RelayError::MalformedGenesis(format!(
                "block {} writes key {}",
                block.number, write.key
            )));
        }
        let certs: Vec<String> = serde_json::from_slice(&write.value)
            .map_err(|e| RelayError::MalformedGenesis(format!("unreadable trust anchors: {e}")))?;
        for cert in certs {
            let der = hex::decode(&cert)
                .map_err(|e| RelayError::MalformedGenesis(format!("trust anchor is not hex: {e}")))?;
            tree.push(&der);
        }
        found = true;
    }
    if !found {
        return Err(RelayError::MalformedGenesis(format!(
            "block {} has no {ROOT_CERTS_KEY} entry",
            block.number
        )));
    }
    Ok(tree)
}

/// Fingerprints of the certificates revoked by the block, in block order.
/// Revocations whose certificate cannot be read are skipped.
fn revoked_fingerprints(block: &Block) -> Vec<Fingerprint> {
    let mut out = Vec::new();
    for published in block.published_roots() {
        for pcn in &published.revocations {
            let Some(instruction) = pcn.revocation() else {
                continue;
            };
            match instruction
                .revoked_certificate()
                .and_then(|cert| Fingerprint::of_certificate(&cert))
            {
                Ok(key) => out.push(key),
                Err(e) => tracing::warn!(
                    target: "gpchain_relay",
                    "Skipping unreadable revocation in block {}: {e}",
                    block.number
                ),
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{KvWrite, Transaction};

    fn genesis(number: u64) -> Block {
        Block {
            number,
            transactions: vec![Transaction {
                valid:  true,
                writes: vec![KvWrite {
                    key:   ROOT_CERTS_KEY.into(),
                    value: serde_json::to_vec(&["0a0b", "0c"]).expect("JSON"),
                }],
            }],
        }
    }

    fn batch(number: u64, roots: &[MerkleHash]) -> Block {
        Block {
            number,
            transactions: roots
                .iter()
                .map(|r| Transaction {
                    valid:  true,
                    writes: vec![KvWrite {
                        key:   r.to_hex(),
                        value: b"[]".to_vec(),
                    }],
                })
                .collect(),
        }
    }

    #[test]
    fn chain_is_linked() {
        let mut builder = ChainBuilder::new(1, &BloomParameters::default()).expect("Valid parameters.");
        let first = builder.apply(&genesis(1)).expect("Genesis.");
        assert_eq!(first.index, 0);
        assert!(first.bloom.is_empty() && first.previous.is_empty());
        assert_eq!(first.root, MerkleTree::build([vec![0x0a, 0x0b], vec![0x0c]]).root());

        let root = MerkleTree::build([b"x"]).root();
        let second = builder.apply(&batch(2, &[root])).expect("Next block.");
        assert!(second.follows(&first));
        assert_eq!(second.root, MerkleTree::build([root]).root());
        assert_eq!(second.bloom, builder.filter().hash().to_vec());
        let third = builder.apply(&batch(3, &[])).expect("Empty block.");
        assert!(third.follows(&second));
        assert_eq!(third.root, crate::merkle::empty_root());
        assert_eq!(builder.next_block(), 4);

        assert!(matches!(
            builder.apply(&batch(5, &[])),
            Err(RelayError::OutOfOrder {
                expected: 4,
                found:    5,
            })
        ));
    }

    #[test]
    fn hash_covers_every_field() {
        let block = RelayBlock {
            index:    1,
            root:     MerkleTree::build([b"x"]).root(),
            bloom:    vec![1; 32],
            previous: vec![2; 32],
        };
        let bytes = block.to_bytes();
        assert_eq!(&bytes[..4], &[0, 0, 0, 1]);
        assert_eq!(bytes.len(), 4 + 32 * 3);
        let hash = block.hash();
        let mut changed = block.clone();
        changed.previous[0] ^= 1;
        assert_ne!(changed.hash(), hash);
        let mut changed = block.clone();
        changed.index = 2;
        assert_ne!(changed.hash(), hash);
        // Swapping two fields changes the hash.
        let mut swapped = block.clone();
        std::mem::swap(&mut swapped.bloom, &mut swapped.previous);
        assert_ne!(swapped.hash(), hash);
    }

    #[test]
    fn index_must_fit_in_four_bytes() {
        let mut builder = ChainBuilder::new(1, &BloomParameters::default()).expect("Valid parameters.");
        let last = RelayBlock {
            index:    u32::MAX,
            root:     crate::merkle::empty_root(),
            bloom:    vec![1; 32],
            previous: vec![2; 32],
        };
        builder.tail = Some(last.clone());
        let number = builder.next_block();
        assert_eq!(number, 1 + u64::from(u32::MAX) + 1);
        assert!(matches!(
            builder.apply(&batch(number, &[])),
            Err(RelayError::IndexOverflow { block }) if block == number
        ));
        // The chain is left untouched.
        assert_eq!(builder.tail(), Some(&last));
        assert_eq!(&last.to_bytes()[..4], &[0xff; 4]);
    }

    #[test]
    fn genesis_must_carry_trust_anchors() {
        let mut builder = ChainBuilder::new(1, &BloomParameters::default()).expect("Valid parameters.");
        let root = MerkleTree::build([b"x"]).root();
        assert!(matches!(
            builder.apply(&batch(1, &[root])),
            Err(RelayError::MalformedGenesis(_))
        ));
        assert!(matches!(
            builder.apply(&batch(1, &[])),
            Err(RelayError::MalformedGenesis(_))
        ));
        assert_eq!(builder.next_index(), 0);
    }

    #[test]
    fn messages_serialize_as_hex() {
        let message = BloomMessage {
            index:  4,
            filter: vec![0xab, 0x01],
        };
        let json = serde_json::to_string(&message).expect("JSON");
        assert_eq!(json, r#"{"index":4,"filter":"ab01"}"#);
        assert_eq!(serde_json::from_str::<BloomMessage>(&json).expect("JSON"), message);
    }
}
