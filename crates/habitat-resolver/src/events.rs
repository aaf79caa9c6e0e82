//! Named producer/consumer rendezvous between sibling nodes.
//!
//! Each registered waiter gets a single-shot channel. Producing an event
//! releases every waiter registered under that name; `clear` releases all
//! waiters so a failing batch never leaves a sibling blocked.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Default)]
pub struct EventManager {
    consumers: Mutex<HashMap<String, Vec<oneshot::Sender<()>>>>,
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `event_name`. The returned receiver resolves
    /// once the event is produced or the manager is cleared.
    pub fn register_consumer(&self, event_name: &str) -> oneshot::Receiver<()> {
        debug!("register consumer for event {event_name}");
        let (sender, receiver) = oneshot::channel();
        self.consumers
            .lock()
            .expect("event manager lock")
            .entry(event_name.to_string())
            .or_default()
            .push(sender);
        receiver
    }

    /// Release every waiter registered under `event_name`.
    pub fn produce(&self, event_name: &str) {
        debug!("produce event {event_name}");
        let senders = self
            .consumers
            .lock()
            .expect("event manager lock")
            .remove(event_name);
        match senders {
            Some(senders) => {
                for sender in senders {
                    let _ = sender.send(());
                }
            }
            None => debug!("no consumers found for event: {event_name}"),
        }
    }

    /// Release every outstanding waiter.
    pub fn clear(&self) {
        let mut consumers = self.consumers.lock().expect("event manager lock");
        for (_, senders) in consumers.drain() {
            for sender in senders {
                let _ = sender.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_produce_releases_all_waiters() {
        let manager = EventManager::new();
        let first = manager.register_consumer("lib");
        let second = manager.register_consumer("lib");
        manager.produce("lib");
        first.await.unwrap();
        second.await.unwrap();
    }

    #[tokio::test]
    async fn test_produce_without_consumers_is_noop() {
        let manager = EventManager::new();
        manager.produce("nobody");
    }

    #[tokio::test]
    async fn test_clear_releases_every_event() {
        let manager = EventManager::new();
        let a = manager.register_consumer("a");
        let b = manager.register_consumer("b");
        manager.clear();
        a.await.unwrap();
        b.await.unwrap();
    }

    #[tokio::test]
    async fn test_waiter_blocks_until_produced() {
        let manager = std::sync::Arc::new(EventManager::new());
        let receiver = manager.register_consumer("slow");
        let producer = manager.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            producer.produce("slow");
        });
        tokio::time::timeout(std::time::Duration::from_secs(1), receiver)
            .await
            .expect("event must arrive")
            .unwrap();
        handle.await.unwrap();
    }
}
