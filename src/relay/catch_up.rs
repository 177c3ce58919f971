//! Single-flight catch-up of the relay chain to the ledger.
//!
//! A block event for ledger block `n` requires every relay block up to and
//! including the one for `n`. Events can arrive out of order, be lost, or
//! overlap, so the controller keeps one target and at most one worker. The
//! worker walks every missing ledger block in order, one relay block at a
//! time, until the target is reached. Callers raise the target and wait for
//! the relay to pass their block.
use super::{Relay, RelayError};
use crate::{async_trait, listener::BlockEventHandler};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::watch;

#[derive(Error, Debug)]
pub enum CatchUpError {
    #[error("Catch-up stalled before ledger block {target}, next block is {reached}: {reason}")]
    Stalled {
        reached: u64,
        target:  u64,
        reason:  String,
    },
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error("The catch-up worker is gone.")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Position of the live relay chain.
pub struct Progress {
    /// Ledger block the next relay block will be derived from.
    pub next_block: u64,
    /// Number of runs that ended in an error.
    pub failures:   u64,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct Flag {
    updating: bool,
    /// Highest ledger block requested so far.
    target:   u64,
}

struct Inner {
    relay:    Arc<Relay>,
    flag:     Mutex<Flag>,
    progress: watch::Sender<Progress>,
}

#[derive(Clone)]
pub struct CatchUpController {
    inner: Arc<Inner>,
}

impl CatchUpController {
    pub fn new(relay: Arc<Relay>) -> Result<Self, CatchUpError> {
        let (progress, _) = watch::channel(Progress {
            next_block: relay.next_block()?,
            failures:   0,
            last_error: None,
        });
        Ok(Self {
            inner: Arc::new(Inner {
                relay,
                flag: Mutex::new(Flag::default()),
                progress,
            }),
        })
    }

    pub fn relay(&self) -> &Arc<Relay> { &self.inner.relay }

    pub fn progress(&self) -> Progress { self.inner.progress.borrow().clone() }

    /// Follow the progress of the live chain.
    pub fn subscribe(&self) -> watch::Receiver<Progress> { self.inner.progress.subscribe() }

    /// Bring the relay up to and including ledger block `block_number`,
    /// returning once it got there. Blocks before the genesis block are
    /// ignored.
    pub async fn catch_up_to(&self, block_number: u64) -> Result<(), CatchUpError> {
        if block_number < self.inner.relay.config().genesis_block() {
            return Ok(());
        }
        let mut progress = self.inner.progress.subscribe();
        let failures = {
            let current = progress.borrow_and_update();
            if current.next_block > block_number {
                return Ok(());
            }
            current.failures
        };
        self.start(block_number);
        loop {
            {
                let current = progress.borrow_and_update();
                if current.next_block > block_number {
                    return Ok(());
                }
                if current.failures > failures {
                    return Err(CatchUpError::Stalled {
                        reached: current.next_block,
                        target:  block_number,
                        reason:  current.last_error.clone().unwrap_or_default(),
                    });
                }
            }
            progress.changed().await.map_err(|_| CatchUpError::Closed)?;
        }
    }

    /// Raise the target and start a worker unless one is running.
    fn start(&self, target: u64) {
        let spawn = {
            let mut flag = self.inner.flag();
            flag.target = flag.target.max(target);
            !std::mem::replace(&mut flag.updating, true)
        };
        if spawn {
            tracing::debug!(target: "gpchain_relay", "Starting catch-up to ledger block {target}.");
            tokio::spawn(self.inner.clone().run());
        }
    }
}

impl Inner {
    fn flag(&self) -> MutexGuard<'_, Flag> { self.flag.lock().unwrap_or_else(PoisonError::into_inner) }

    async fn run(self: Arc<Self>) {
        let mut next = self.progress.borrow().next_block;
        loop {
            let target = {
                let mut flag = self.flag();
                if next > flag.target {
                    flag.updating = false;
                    break;
                }
                flag.target
            };
            match self.relay.process_next().await {
                Ok(message) => {
                    next = self.relay.config().genesis_block() + u64::from(message.block.index) + 1;
                    self.progress.send_modify(|p| p.next_block = next);
                }
                Err(e) => {
                    tracing::error!(
                        target: "gpchain_relay",
                        "Catch-up to ledger block {target} failed at block {next}: {e}"
                    );
                    self.flag().updating = false;
                    self.progress.send_modify(|p| {
                        p.failures += 1;
                        p.last_error = Some(e.to_string());
                    });
                    return;
                }
            }
        }
        tracing::debug!(target: "gpchain_relay", "Caught up, next ledger block is {next}.");
    }
}

#[async_trait]
impl BlockEventHandler for CatchUpController {
    type Error = CatchUpError;

    async fn on_block(&self, block_number: u64) -> Result<(), CatchUpError> {
        self.catch_up_to(block_number).await
    }
}
