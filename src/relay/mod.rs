//! The relay: a hash-chained summary of the ledger for light clients.
//!
//! Every ledger block from the contract instantiation onwards yields one
//! [`RelayBlock`](block::RelayBlock). The first commits to the trust anchors,
//! every later one to the batch roots of its ledger block and to the filter of
//! all certificates revoked so far. Blocks are signed by the relay and
//! published together with the filter through a [`Publisher`].
//!
//! [`Relay`] owns the live chain. It is advanced one block at a time, which
//! [`catch_up::CatchUpController`] does in response to block events.
use crate::{
    constants::{BLOCK_OFFSET, BLOOM_FILTER_TOPIC, RELAY_BLOCK_TOPIC},
    ledger::{LedgerError, LedgerSession},
};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

pub mod block;
pub mod bloom;
pub mod catch_up;
pub mod publisher;
pub mod signer;

pub use block::{BloomMessage, ChainBuilder, RelayBlock, RelayBlockMessage};
pub use bloom::{BloomError, BloomFilterState, BloomParameters};
pub use publisher::{ChannelPublisher, PublishError, Publisher};
pub use signer::{RelaySigner, RelayVerifier, SignatureError};

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("Malformed instantiation block: {0}")]
    MalformedGenesis(String),
    #[error("Could not sign relay block: {0}")]
    Signing(#[from] SignatureError),
    #[error("Could not publish: {0}")]
    Publish(#[from] PublishError),
    #[error("Bloom filter error: {0}")]
    Bloom(#[from] BloomError),
    #[error("Could not encode message: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("Expected ledger block {expected}, got block {found}.")]
    OutOfOrder { expected: u64, found: u64 },
    #[error("Ledger block {block} is past the last relay block index.")]
    IndexOverflow { block: u64 },
    #[error("Relay block {index} does not exist, the latest is {latest:?}.")]
    BeyondTip { index: u64, latest: Option<u64> },
    #[error("Relay state poisoned.")]
    Poisoned,
}

/// Configuration of a [`Relay`].
#[derive(Debug, Clone)]
pub struct RelayConfig {
    genesis_block: u64,
    bloom:         BloomParameters,
    block_topic:   String,
    bloom_topic:   String,
}

impl Default for RelayConfig {
    fn default() -> Self { Self::new() }
}

impl RelayConfig {
    /// Chain rooted at ledger block 1, filters sized for 1000 revocations at
    /// a false positive rate of one in a million, and the default topics.
    pub fn new() -> Self {
        Self {
            genesis_block: BLOCK_OFFSET,
            bloom:         BloomParameters::default(),
            block_topic:   RELAY_BLOCK_TOPIC.into(),
            bloom_topic:   BLOOM_FILTER_TOPIC.into(),
        }
    }

    /// Ledger block holding the contract instantiation, from which relay
    /// block 0 is derived.
    pub fn set_genesis_block(self, genesis_block: u64) -> Self {
        Self {
            genesis_block,
            ..self
        }
    }

    pub fn set_bloom(self, bloom: BloomParameters) -> Self { Self { bloom, ..self } }

    pub fn set_topics(self, block_topic: impl Into<String>, bloom_topic: impl Into<String>) -> Self {
        Self {
            block_topic: block_topic.into(),
            bloom_topic: bloom_topic.into(),
            ..self
        }
    }

    pub fn genesis_block(&self) -> u64 { self.genesis_block }

    pub fn bloom(&self) -> &BloomParameters { &self.bloom }

    pub fn block_topic(&self) -> &str { &self.block_topic }

    pub fn bloom_topic(&self) -> &str { &self.bloom_topic }
}

pub struct Relay {
    ledger:    Arc<LedgerSession>,
    signer:    RelaySigner,
    publisher: Arc<dyn Publisher>,
    config:    RelayConfig,
    state:     Mutex<ChainBuilder>,
}

impl Relay {
    pub fn new(
        ledger: Arc<LedgerSession>,
        signer: RelaySigner,
        publisher: Arc<dyn Publisher>,
        config: RelayConfig,
    ) -> Result<Self, RelayError> {
        let state = ChainBuilder::new(config.genesis_block, &config.bloom)?;
        Ok(Self {
            ledger,
            signer,
            publisher,
            config,
            state: Mutex::new(state),
        })
    }

    pub fn config(&self) -> &RelayConfig { &self.config }

    fn state(&self) -> Result<MutexGuard<'_, ChainBuilder>, RelayError> {
        self.state.lock().map_err(|_| RelayError::Poisoned)
    }

    /// Ledger block the next relay block will be derived from.
    pub fn next_block(&self) -> Result<u64, RelayError> { Ok(self.state()?.next_block()) }

    /// The latest relay block of the live chain.
    pub fn tail(&self) -> Result<Option<RelayBlock>, RelayError> { Ok(self.state()?.tail().cloned()) }

    /// A copy of the live revocation filter.
    pub fn filter(&self) -> Result<BloomFilterState, RelayError> { Ok(self.state()?.filter().clone()) }

    /// Derive, sign and publish the next relay block. The live chain only
    /// advances once both messages are published.
    pub async fn process_next(&self) -> Result<RelayBlockMessage, RelayError> {
        let mut staged = {
            let state = self.state()?;
            state.clone()
        };
        let number = staged.next_block();
        let block = self.ledger.query_block(number).await?;
        let relay_block = staged.apply(&block)?;
        let bloom = (relay_block.index > 0).then(|| BloomMessage {
            index:  relay_block.index,
            filter: staged.filter().to_bytes(),
        });
        let message = self.sign(relay_block)?;
        self.publisher
            .publish(&self.config.block_topic, serde_json::to_vec(&message)?)
            .await?;
        if let Some(bloom) = &bloom {
            self.publisher
                .publish(&self.config.bloom_topic, serde_json::to_vec(bloom)?)
                .await?;
        }
        {
            let mut state = self.state()?;
            if state.next_block() != number {
                return Err(RelayError::OutOfOrder {
                    expected: state.next_block(),
                    found:    number,
                });
            }
            *state = staged;
        }
        tracing::info!(
            target: "gpchain_relay",
            "Published relay block {} for ledger block {number}.",
            message.block.index
        );
        Ok(message)
    }

    pub fn sign(&self, block: RelayBlock) -> Result<RelayBlockMessage, RelayError> {
        let signature = self.signer.sign(&block)?;
        Ok(RelayBlockMessage {
            blockhash: block.hash(),
            siglist: vec![signature],
            block,
        })
    }

    /// Index of the relay block derived from the latest ledger block, or
    /// [`None`] if the ledger has not reached the genesis block yet.
    pub async fn latest_index(&self) -> Result<Option<u64>, RelayError> {
        let height = self.ledger.chain_height().await?;
        Ok(height.checked_sub(1 + self.config.genesis_block))
    }

    /// Rebuild the chain from the genesis block with a fresh filter and
    /// return relay block `index`, signed. The live chain is not touched.
    pub async fn replay(&self, index: u64) -> Result<RelayBlockMessage, RelayError> {
        let latest = self.latest_index().await?;
        if latest.map_or(true, |latest| index > latest) {
            return Err(RelayError::BeyondTip { index, latest });
        }
        let mut builder = ChainBuilder::new(self.config.genesis_block, &self.config.bloom)?;
        let mut last = None;
        for number in self.config.genesis_block..=self.config.genesis_block + index {
            let block = self.ledger.query_block(number).await?;
            last = Some(builder.apply(&block)?);
        }
        let block = last.ok_or(RelayError::BeyondTip { index, latest })?;
        tracing::debug!(target: "gpchain_relay", "Replayed relay chain up to block {index}.");
        self.sign(block)
    }
}

#[cfg(test)]
mod tests;
