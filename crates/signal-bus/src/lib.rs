use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

const TOPIC_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct SignalEvent {
    pub name: String,
    pub payload: Value,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("topic {0} was closed")]
    Closed(String),
    #[error("receiver lagged and skipped {0} events")]
    Lagged(u64),
}

pub type BusResult<T> = Result<T, BusError>;

/// Named-event fan-out. Every subscriber owns its own receiver, so dropping a
/// subscription is the only deregistration step required.
pub trait EventBus: Send + Sync {
    fn subscribe(&self, name: &str) -> Subscription;
    /// Delivers to current subscribers and returns how many received it.
    fn publish(&self, name: &str, payload: Value) -> usize;
    /// Closes every subscription for `name`; pending `recv` calls return `Closed`.
    fn close_topic(&self, name: &str) -> bool;
    fn listener_count(&self, name: &str) -> usize;
}

/// In-memory bus keyed by event name.
#[derive(Debug, Default)]
pub struct SignalBus {
    topics: parking_lot::RwLock<HashMap<String, broadcast::Sender<SignalEvent>>>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes while the map guard is held, so `publish` cannot prune the
    /// topic between lookup and subscription.
    fn receiver_for(&self, name: &str) -> broadcast::Receiver<SignalEvent> {
        if let Some(sender) = self.topics.read().get(name) {
            return sender.subscribe();
        }
        self.topics
            .write()
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    /// Names of topics that currently have at least one subscriber.
    pub fn active_topics(&self) -> Vec<String> {
        let guard = self.topics.read();
        let mut names: Vec<String> = guard
            .iter()
            .filter(|(_, sender)| sender.receiver_count() > 0)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn close_all(&self) {
        self.topics.write().clear();
    }
}

impl EventBus for SignalBus {
    fn subscribe(&self, name: &str) -> Subscription {
        Subscription {
            name: name.to_string(),
            receiver: self.receiver_for(name),
        }
    }

    fn publish(&self, name: &str, payload: Value) -> usize {
        let sender = {
            let guard = self.topics.read();
            match guard.get(name) {
                Some(sender) => sender.clone(),
                None => return 0,
            }
        };
        if sender.receiver_count() == 0 {
            let mut guard = self.topics.write();
            if guard
                .get(name)
                .is_some_and(|current| current.receiver_count() == 0)
            {
                guard.remove(name);
            }
            return 0;
        }
        sender
            .send(SignalEvent {
                name: name.to_string(),
                payload,
            })
            .unwrap_or(0)
    }

    fn close_topic(&self, name: &str) -> bool {
        self.topics.write().remove(name).is_some()
    }

    fn listener_count(&self, name: &str) -> usize {
        self.topics
            .read()
            .get(name)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

/// One registered listener. Dropping it deregisters the listener.
#[derive(Debug)]
pub struct Subscription {
    name: String,
    receiver: broadcast::Receiver<SignalEvent>,
}

impl Subscription {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn recv(&mut self) -> BusResult<SignalEvent> {
        match self.receiver.recv().await {
            Ok(event) => Ok(event),
            Err(broadcast::error::RecvError::Closed) => Err(BusError::Closed(self.name.clone())),
            Err(broadcast::error::RecvError::Lagged(skipped)) => Err(BusError::Lagged(skipped)),
        }
    }

    pub fn try_recv(&mut self) -> Option<SignalEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
