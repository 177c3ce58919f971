//! In-process ledger applying the publication contract's rules.
//!
//! Block 0 is an empty genesis block. The contract instantiation block stores
//! the DER encoded trust anchors under [`ROOT_CERTS_KEY`]. Every accepted
//! `pub` call is ordered into its own block and announced to subscribers.
use super::*;
use crate::{
    constants::TIMESTAMP_WINDOW_SECS,
    internal::unix_now,
    merkle::MerkleHash,
};
use futures::StreamExt;
use openssl::x509::X509;
use std::{collections::BTreeSet, sync::Mutex};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

#[derive(Default)]
struct State {
    blocks:               Vec<Block>,
    world:                BTreeMap<String, Vec<u8>>,
    registrations:        BTreeSet<RegistrationHandle>,
    next_handle:          u64,
    fail_submissions:     bool,
    failed_registrations: u32,
    clock_offset:         i64,
}

pub struct MemoryLedger {
    state:  Mutex<State>,
    events: broadcast::Sender<BlockEvent>,
}

impl MemoryLedger {
    /// A ledger whose contract was instantiated in block 1 with the given
    /// trust anchors.
    pub fn new(root_certs: &[X509]) -> LedgerResult<Self> { Self::with_instantiation_block(root_certs, 1) }

    /// A ledger with empty blocks `0..block` followed by the contract
    /// instantiation.
    pub fn with_instantiation_block(root_certs: &[X509], block: u64) -> LedgerResult<Self> {
        let ders = root_certs
            .iter()
            .map(|c| c.to_der().map(hex::encode))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| LedgerError::ParseError(e.into()))?;
        let value = serde_json::to_vec(&ders)?;
        let mut state = State::default();
        for number in 0..block.max(1) {
            state.blocks.push(Block {
                number,
                transactions: Vec::new(),
            });
        }
        state.world.insert(ROOT_CERTS_KEY.to_owned(), value.clone());
        state.blocks.push(Block {
            number:       block.max(1),
            transactions: vec![Transaction {
                valid:  true,
                writes: vec![KvWrite {
                    key: ROOT_CERTS_KEY.to_owned(),
                    value,
                }],
            }],
        });
        let (events, _) = broadcast::channel(1024);
        Ok(Self {
            state: Mutex::new(state),
            events,
        })
    }

    fn lock(&self) -> LedgerResult<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| LedgerError::Unavailable("ledger state poisoned".into()))
    }

    /// Order a block with the given transactions and announce it. Returns the
    /// block number.
    pub fn append_block(&self, transactions: Vec<Transaction>) -> LedgerResult<u64> {
        let number = {
            let mut state = self.lock()?;
            let number = state.blocks.len() as u64;
            for write in transactions.iter().filter(|t| t.valid).flat_map(|t| t.writes.iter()) {
                state.world.insert(write.key.clone(), write.value.clone());
            }
            state.blocks.push(Block {
                number,
                transactions,
            });
            number
        };
        self.announce(number);
        Ok(number)
    }

    /// Deliver a block event, whether or not the block exists.
    pub fn announce(&self, block_number: u64) {
        // No receivers is not an error.
        let _ = self.events.send(BlockEvent { block_number });
    }

    /// Make every following submission fail as if the ledger was unreachable.
    pub fn set_fail_submissions(&self, fail: bool) -> LedgerResult<()> {
        self.lock()?.fail_submissions = fail;
        Ok(())
    }

    /// Make the next `count` event registrations fail.
    pub fn fail_next_registrations(&self, count: u32) -> LedgerResult<()> {
        self.lock()?.failed_registrations = count;
        Ok(())
    }

    /// Shift the contract's clock relative to the local one.
    pub fn set_clock_offset(&self, seconds: i64) -> LedgerResult<()> {
        self.lock()?.clock_offset = seconds;
        Ok(())
    }

    pub fn active_registrations(&self) -> LedgerResult<usize> { Ok(self.lock()?.registrations.len()) }

    fn validate_publication(state: &State, args: &[Vec<u8>]) -> LedgerResult<(String, Vec<u8>)> {
        let [root, revocations, timestamp] = args else {
            return Err(LedgerError::Rejected(format!(
                "pub takes 3 arguments, got {}",
                args.len()
            )));
        };
        let root = String::from_utf8(root.clone())
            .map_err(|_| LedgerError::Rejected("root is not text".into()))?;
        root.parse::<MerkleHash>()
            .map_err(|e| LedgerError::Rejected(format!("invalid root: {e}")))?;
        let timestamp: i64 = std::str::from_utf8(timestamp)
            .ok()
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| LedgerError::Rejected("invalid timestamp".into()))?;
        let now = unix_now() + state.clock_offset;
        if (now - timestamp).abs() > TIMESTAMP_WINDOW_SECS {
            return Err(LedgerError::Rejected(format!(
                "timestamp {timestamp} is outside the window around {now}"
            )));
        }
        let entries: Vec<RevocationEntry> = serde_json::from_slice(revocations)
            .map_err(|e| LedgerError::Rejected(format!("invalid revocation list: {e}")))?;
        for entry in &entries {
            let proof = &entry.publication_proof;
            let published = proof
                .merkle_root
                .map_or(false, |r| state.world.contains_key(&r.to_hex()));
            if !published {
                return Err(LedgerError::Rejected(
                    "revoked certificate was never published".into(),
                ));
            }
            if !proof.verify(&entry.cert_data) {
                return Err(LedgerError::Rejected(
                    "revoked certificate proof does not verify".into(),
                ));
            }
        }
        let list = RevocationList(entries.into_iter().map(|e| e.pcn).collect());
        Ok((root, serde_json::to_vec(&list)?))
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn submit_transaction(
        &self,
        contract: &str,
        function: &str,
        args: Vec<Vec<u8>>,
    ) -> LedgerResult<Vec<u8>> {
        if contract != CONTRACT_ID || function != PUBLISH_FUNCTION {
            return Err(LedgerError::Rejected(format!("unknown function {contract}.{function}")));
        }
        let (key, value) = {
            let state = self.lock()?;
            if state.fail_submissions {
                return Err(LedgerError::Unavailable("submission failed".into()));
            }
            Self::validate_publication(&state, &args)?
        };
        self.append_block(vec![Transaction {
            valid:  true,
            writes: vec![KvWrite {
                key:   key.clone(),
                value,
            }],
        }])?;
        Ok(key.into_bytes())
    }

    async fn evaluate(&self, contract: &str, function: &str, args: Vec<Vec<u8>>) -> LedgerResult<Vec<u8>> {
        if contract != CONTRACT_ID || function != GET_FUNCTION {
            return Err(LedgerError::Rejected(format!("unknown function {contract}.{function}")));
        }
        let key = args
            .first()
            .and_then(|k| std::str::from_utf8(k).ok())
            .ok_or_else(|| LedgerError::Rejected("get takes a key".into()))?;
        self.lock()?.world.get(key).cloned().ok_or(LedgerError::NotFound)
    }

    async fn query_block(&self, number: u64) -> LedgerResult<Block> {
        let state = self.lock()?;
        usize::try_from(number)
            .ok()
            .and_then(|n| state.blocks.get(n))
            .cloned()
            .ok_or(LedgerError::NotFound)
    }

    async fn query_chain_height(&self) -> LedgerResult<u64> { Ok(self.lock()?.blocks.len() as u64) }

    async fn subscribe(&self) -> LedgerResult<Subscription> {
        let (handle, receiver) = {
            let mut state = self.lock()?;
            if state.failed_registrations > 0 {
                state.failed_registrations -= 1;
                return Err(LedgerError::Unavailable("event registration refused".into()));
            }
            state.next_handle += 1;
            let handle = RegistrationHandle(state.next_handle);
            state.registrations.insert(handle);
            (handle, self.events.subscribe())
        };
        let events = BroadcastStream::new(receiver)
            .filter_map(|event| futures::future::ready(event.ok()))
            .boxed();
        Ok(Subscription { handle, events })
    }

    async fn unsubscribe(&self, handle: RegistrationHandle) -> LedgerResult<()> {
        if self.lock()?.registrations.remove(&handle) {
            Ok(())
        } else {
            Err(LedgerError::NotFound)
        }
    }
}
