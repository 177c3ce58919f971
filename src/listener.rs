//! Subscribes to ledger block events and hands them, in order, to a
//! [`BlockEventHandler`].
//!
//! The main entrypoint is [`ListenerConfig::listen`].
use crate::{
    async_trait,
    ledger::{LedgerError, LedgerResult, LedgerSession, Subscription},
};
use futures::StreamExt;
use std::{future::Future, pin::Pin, time::Duration};

#[async_trait]
/// Handle the announcement of a new ledger block.
pub trait BlockEventHandler: Send + Sync {
    /// An error that can be signalled.
    type Error: std::fmt::Display + std::fmt::Debug + Send;

    /// Called once per event, never concurrently with itself. A failure is
    /// logged and the next event is processed.
    async fn on_block(&self, block_number: u64) -> Result<(), Self::Error>;
}

/// Configuration of the block event listener.
pub struct ListenerConfig {
    /// Number of registration attempts before giving up.
    max_attempts: u32,
    /// Pause between two registration attempts.
    retry_delay:  Duration,
    /// A future to be signalled to stop listening.
    stop:         Pin<Box<dyn Future<Output = ()> + Send>>,
}

impl Default for ListenerConfig {
    fn default() -> Self { Self::new() }
}

impl ListenerConfig {
    /// 200 registration attempts, one second apart, and no stop signal.
    pub fn new() -> Self {
        Self {
            max_attempts: 200,
            retry_delay:  Duration::from_secs(1),
            stop:         Box::pin(std::future::pending()),
        }
    }

    pub fn set_max_attempts(self, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..self
        }
    }

    pub fn set_retry_delay(self, retry_delay: Duration) -> Self { Self { retry_delay, ..self } }

    /// Set the stop signal for the listener. This accepts a future which will
    /// be polled and if the future yields ready the `listen` method will
    /// unsubscribe and terminate.
    ///
    /// An example of such a future would be the `Receiver` end of a oneshot
    /// channel.
    pub fn set_stop_signal(self, stop: impl Future<Output = ()> + Send + 'static) -> Self {
        Self {
            stop: Box::pin(stop),
            ..self
        }
    }

    /// Register for block events and dispatch them until the stop signal
    /// fires or the event stream ends.
    ///
    /// Returns an error only if registration keeps failing. The function will
    /// log progress using the `tracing` library with the target set to
    /// `gpchain_listener`.
    pub async fn listen<H: BlockEventHandler>(
        self,
        ledger: &LedgerSession,
        handler: &H,
    ) -> LedgerResult<()> {
        let ListenerConfig {
            max_attempts,
            retry_delay,
            mut stop,
        } = self;
        let mut subscription = tokio::select! {
            biased;
            _ = &mut stop => return Ok(()),
            r = register(ledger, max_attempts, retry_delay) => r?,
        };
        tracing::info!(target: "gpchain_listener", "Registered for block events.");
        while let Some(event) = tokio::select! {
            biased;
            _ = &mut stop => None,
            r = subscription.events.next() => r,
        } {
            let start = tokio::time::Instant::now();
            match handler.on_block(event.block_number).await {
                Ok(()) => tracing::debug!(
                    target: "gpchain_listener",
                    "Handled block {} in {}ms.",
                    event.block_number,
                    start.elapsed().as_millis()
                ),
                Err(e) => tracing::error!(
                    target: "gpchain_listener",
                    "Failed to handle block {}: {e}",
                    event.block_number
                ),
            }
        }
        if let Err(e) = ledger.unsubscribe(subscription.handle).await {
            tracing::warn!(target: "gpchain_listener", "Failed to unregister: {e}");
        }
        tracing::info!(target: "gpchain_listener", "Terminating the block event listener.");
        Ok(())
    }
}

async fn register(
    ledger: &LedgerSession,
    max_attempts: u32,
    retry_delay: Duration,
) -> LedgerResult<Subscription> {
    let mut attempt = 1;
    loop {
        match ledger.subscribe().await {
            Ok(subscription) => return Ok(subscription),
            Err(e) if attempt < max_attempts => {
                tracing::warn!(
                    target: "gpchain_listener",
                    "Event registration attempt {attempt} failed: {e}. Retrying in {}ms.",
                    retry_delay.as_millis()
                );
                tokio::time::sleep(retry_delay).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::error!(
                    target: "gpchain_listener",
                    "Giving up event registration after {attempt} attempts: {e}"
                );
                return Err(LedgerError::Unavailable(format!(
                    "event registration failed after {attempt} attempts: {e}"
                )));
            }
        }
    }
}
