//! Ledger block number = relay block index + [`BLOCK_OFFSET`]. Ledger block 0
//! is the genesis block and ledger block 1 is the contract instantiation that
//! carries the trust anchors.
use std::time::Duration;

/// Offset between ledger block numbers and relay block indices.
pub const BLOCK_OFFSET: u64 = 1;

/// State key written by the contract instantiation, holding the trust anchors.
pub const ROOT_CERTS_KEY: &str = "rootCerts";

/// Identifier of the publication contract.
pub const CONTRACT_ID: &str = "gpchain";
/// Contract function committing a batch root and its revocation list.
pub const PUBLISH_FUNCTION: &str = "pub";
/// Contract function reading a stored value.
pub const GET_FUNCTION: &str = "get";

/// Maximum distance, in seconds, between a batch timestamp and the time the
/// contract executes it.
pub const TIMESTAMP_WINDOW_SECS: i64 = 60;

/// Expected number of revoked fingerprints a filter is sized for.
pub const BLOOM_EXPECTED_ITEMS: usize = 1000;
/// Target false positive rate of the revocation filter.
pub const BLOOM_FALSE_POSITIVE_RATE: f64 = 0.000001;

/// Topic on which relay block messages are published.
pub const RELAY_BLOCK_TOPIC: &str = "relay1-relayblocks";
/// Topic on which bloom filter messages are published.
pub const BLOOM_FILTER_TOPIC: &str = "relay1-bloomfilters";

/// Prefix of the message a revoker signs: `REVOKE\n<PEM certificate>`.
pub const REVOKE_PREFIX: &str = "REVOKE\n";

/// Default interval between two batching cycles.
pub const DEFAULT_BATCH_INTERVAL: Duration = Duration::from_secs(5);
