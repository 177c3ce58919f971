//! Interface to the append-only ledger and its publication contract.
//!
//! The ledger is an external collaborator. The [`Ledger`] trait captures the
//! calls this crate makes, [`LedgerSession`] serializes them over a single
//! connection, and [`memory::MemoryLedger`] is an in-process implementation
//! with the contract's validation rules, used in tests and local deployments.
use crate::{
    constants::{CONTRACT_ID, GET_FUNCTION, PUBLISH_FUNCTION, ROOT_CERTS_KEY},
    merkle::{MerkleHash, MerkleTree},
    pcn::ProofChainNotarization,
    types::ValidationInfo,
};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};
use thiserror::Error;
pub use tonic::async_trait;

pub mod memory;

#[derive(Error, Debug)]
/// Connection, registration or contract failure.
pub enum LedgerError {
    #[error("Call failed: {0}")]
    CallError(#[from] tonic::Status),
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),
    #[error("Transaction rejected: {0}")]
    Rejected(String),
    #[error("Requested object not found.")]
    NotFound,
    #[error("Error parsing ledger data: {0}")]
    ParseError(#[from] anyhow::Error),
}

impl From<serde_json::Error> for LedgerError {
    fn from(x: serde_json::Error) -> Self { Self::ParseError(x.into()) }
}

impl LedgerError {
    /// Whether the error indicates the submitted transaction is invalid.
    /// Retrying the same submission will likely not succeed.
    pub fn is_rejected(&self) -> bool {
        match self {
            LedgerError::CallError(e) => matches!(
                e.code(),
                tonic::Code::InvalidArgument | tonic::Code::FailedPrecondition
            ),
            LedgerError::Rejected(_) => true,
            _ => false,
        }
    }

    /// Whether this error indicates an object was not found.
    pub fn is_not_found(&self) -> bool {
        match self {
            LedgerError::CallError(e) => e.code() == tonic::Code::NotFound,
            LedgerError::NotFound => true,
            _ => false,
        }
    }

    /// Whether the error is a connectivity problem worth retrying.
    pub fn is_unavailable(&self) -> bool {
        match self {
            LedgerError::CallError(e) => e.code() == tonic::Code::Unavailable,
            LedgerError::Unavailable(_) => true,
            _ => false,
        }
    }
}

/// Result of a ledger call. This is a simple alias for [std::Result](https://doc.rust-lang.org/std/result/enum.Result.html)
/// that fixes the error type to be [`LedgerError`].
pub type LedgerResult<A> = Result<A, LedgerError>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
/// A single state write of a transaction.
pub struct KvWrite {
    pub key:   String,
    #[serde(with = "crate::internal::byte_array_hex")]
    pub value: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Whether the transaction passed validation. Only valid transactions
    /// change state.
    pub valid:  bool,
    pub writes: Vec<KvWrite>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub number:       u64,
    pub transactions: Vec<Transaction>,
}

/// A batch root committed by a block, with the revocations submitted in the
/// same transaction.
#[derive(Debug, Clone)]
pub struct PublishedRoot {
    pub root:        MerkleHash,
    /// Revocation notarizations that could be parsed. Malformed entries are
    /// dropped, identically on every reader.
    pub revocations: Vec<ProofChainNotarization>,
}

impl Block {
    /// Writes of the valid transactions, in block order.
    pub fn accepted_writes(&self) -> impl Iterator<Item = &KvWrite> {
        self.transactions
            .iter()
            .filter(|tx| tx.valid)
            .flat_map(|tx| tx.writes.iter())
    }

    /// Whether the block instantiated the contract with its trust anchors.
    pub fn is_instantiation(&self) -> bool {
        self.accepted_writes().any(|w| w.key == ROOT_CERTS_KEY)
    }

    /// Batch roots committed by the block, in block order. Writes whose key
    /// is not a hex encoded hash are skipped.
    pub fn published_roots(&self) -> Vec<PublishedRoot> {
        let mut out = Vec::new();
        for write in self.accepted_writes() {
            if write.key == ROOT_CERTS_KEY {
                continue;
            }
            let root = match write.key.parse::<MerkleHash>() {
                Ok(root) => root,
                Err(e) => {
                    tracing::warn!(
                        target: "gpchain_ledger",
                        "Block {} has a write to non-root key {}: {e}",
                        self.number,
                        write.key
                    );
                    continue;
                }
            };
            let revocations = match serde_json::from_slice::<RevocationList>(&write.value) {
                Ok(list) => list.parse(self.number),
                Err(e) => {
                    tracing::warn!(
                        target: "gpchain_ledger",
                        "Block {} carries a malformed revocation list for {root}: {e}",
                        self.number
                    );
                    Vec::new()
                }
            };
            out.push(PublishedRoot { root, revocations });
        }
        out
    }

    /// Tree over the batch roots committed by the block.
    pub fn root_tree(&self) -> MerkleTree {
        MerkleTree::build(self.published_roots().iter().map(|p| p.root))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(transparent)]
/// Value the contract stores under a batch root: the PCN text of every
/// revocation submitted with the batch.
pub struct RevocationList(pub Vec<String>);

impl RevocationList {
    fn parse(&self, block: u64) -> Vec<ProofChainNotarization> {
        self.0
            .iter()
            .filter_map(|text| match ProofChainNotarization::parse(text.as_bytes()) {
                Ok(pcn) if pcn.revocation().is_some() => Some(pcn),
                Ok(_) => {
                    tracing::warn!(target: "gpchain_ledger", "Revocation in block {block} has no instruction.");
                    None
                }
                Err(e) => {
                    tracing::warn!(target: "gpchain_ledger", "Unparsable revocation in block {block}: {e}");
                    None
                }
            })
            .collect()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
/// One revocation of a batch submission.
pub struct RevocationEntry {
    /// DER encoding of the revoked certificate.
    #[serde(rename = "certData", with = "crate::internal::byte_array_hex")]
    pub cert_data:         Vec<u8>,
    /// Proof of the certificate inside the batch that published it.
    #[serde(rename = "pubValidationInfo")]
    pub publication_proof: ValidationInfo,
    /// PCN of the revoker, including the revocation instruction.
    pub pcn:               String,
}

/// Freshness leaf appended to every batch tree: the Unix time, right aligned
/// in a field of width eight.
pub fn timestamp_leaf(timestamp: i64) -> Vec<u8> { format!("{:8}", timestamp).into_bytes() }

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEvent {
    pub block_number: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RegistrationHandle(pub u64);

/// Registration for block events, valid until passed to
/// [`Ledger::unsubscribe`].
pub struct Subscription {
    pub handle: RegistrationHandle,
    pub events: BoxStream<'static, BlockEvent>,
}

#[async_trait]
/// Calls made against the ledger.
pub trait Ledger: Send + Sync {
    /// Submit a contract invocation and wait for it to be ordered. Returns
    /// the contract's response payload.
    async fn submit_transaction(
        &self,
        contract: &str,
        function: &str,
        args: Vec<Vec<u8>>,
    ) -> LedgerResult<Vec<u8>>;

    /// Evaluate a read-only contract invocation.
    async fn evaluate(&self, contract: &str, function: &str, args: Vec<Vec<u8>>) -> LedgerResult<Vec<u8>>;

    async fn query_block(&self, number: u64) -> LedgerResult<Block>;

    /// Number of blocks in the chain, including the genesis block.
    async fn query_chain_height(&self) -> LedgerResult<u64>;

    async fn subscribe(&self) -> LedgerResult<Subscription>;

    async fn unsubscribe(&self, handle: RegistrationHandle) -> LedgerResult<()>;

    async fn close(&self) -> LedgerResult<()> { Ok(()) }
}

/// A connection to the ledger shared by the components of a process. All
/// calls go through one lock so that at most one is in flight.
pub struct LedgerSession {
    ledger: Arc<dyn Ledger>,
    lock:   tokio::sync::Mutex<()>,
}

impl LedgerSession {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self {
            ledger,
            lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Commit a batch root with its revocations.
    pub async fn publish(
        &self,
        root: &MerkleHash,
        revocations: &[RevocationEntry],
        timestamp: i64,
    ) -> LedgerResult<Vec<u8>> {
        let args = vec![
            root.to_hex().into_bytes(),
            serde_json::to_vec(revocations)?,
            timestamp.to_string().into_bytes(),
        ];
        let _guard = self.lock.lock().await;
        self.ledger.submit_transaction(CONTRACT_ID, PUBLISH_FUNCTION, args).await
    }

    /// Read a value from contract state.
    pub async fn get(&self, key: &str) -> LedgerResult<Vec<u8>> {
        let _guard = self.lock.lock().await;
        self.ledger
            .evaluate(CONTRACT_ID, GET_FUNCTION, vec![key.as_bytes().to_vec()])
            .await
    }

    pub async fn query_block(&self, number: u64) -> LedgerResult<Block> {
        let _guard = self.lock.lock().await;
        self.ledger.query_block(number).await
    }

    pub async fn chain_height(&self) -> LedgerResult<u64> {
        let _guard = self.lock.lock().await;
        self.ledger.query_chain_height().await
    }

    pub async fn subscribe(&self) -> LedgerResult<Subscription> {
        let _guard = self.lock.lock().await;
        self.ledger.subscribe().await
    }

    pub async fn unsubscribe(&self, handle: RegistrationHandle) -> LedgerResult<()> {
        let _guard = self.lock.lock().await;
        self.ledger.unsubscribe(handle).await
    }

    pub async fn close(&self) -> LedgerResult<()> {
        let _guard = self.lock.lock().await;
        self.ledger.close().await
    }
}
