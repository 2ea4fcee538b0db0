// This file is part of corvid-indexer.
// Copyright (C) 2026 Corvid Project
// SPDX-License-Identifier: Apache-2.0

use tokio::sync::watch;

/// A one-shot event: once set it stays set and every waiter, past or future,
/// proceeds immediately.
#[derive(Debug, Clone)]
pub struct Event {
    tx: watch::Sender<bool>,
}

impl Event {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender cannot be dropped while `self` is borrowed.
        let _ = rx.wait_for(|set| *set).await;
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event() {
        let event = Event::new();
        assert!(!event.is_set());

        let waiter = {
            let event = event.clone();
            tokio::spawn(async move { event.wait().await })
        };

        event.set();
        waiter.await.unwrap();
        assert!(event.is_set());

        // Waiting after the event is set returns immediately.
        event.wait().await;
    }
}
