//! Outbound message bus.
//!
//! Messages are published retained: a subscriber connecting later still sees
//! the last message of every topic.
use crate::async_trait;
use std::{collections::BTreeMap, sync::Mutex};
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("The broker refused the message: {0}")]
    Rejected(String),
    #[error("Publisher state poisoned.")]
    Poisoned,
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish `payload` on `topic` as the topic's retained message.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic:   String,
    pub payload: Vec<u8>,
}

/// In-process bus delivering to [`tokio::sync::broadcast`] subscribers.
pub struct ChannelPublisher {
    sender:   broadcast::Sender<PublishedMessage>,
    retained: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl ChannelPublisher {
    /// `capacity` bounds how far a subscriber can lag before losing messages.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            retained: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PublishedMessage> { self.sender.subscribe() }

    /// The last message published on `topic`.
    pub fn retained(&self, topic: &str) -> Result<Option<Vec<u8>>, PublishError> {
        Ok(self
            .retained
            .lock()
            .map_err(|_| PublishError::Poisoned)?
            .get(topic)
            .cloned())
    }
}

#[async_trait]
impl Publisher for ChannelPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        {
            let mut retained = self.retained.lock().map_err(|_| PublishError::Poisoned)?;
            retained.insert(topic.to_owned(), payload.clone());
        }
        // Retained even without subscribers.
        let _ = self.sender.send(PublishedMessage {
            topic: topic.to_owned(),
            payload,
        });
        Ok(())
    }
}
