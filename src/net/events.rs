//! Broadcast event streams for connection and subscription fan-out.
//!
//! An [`EventStream`] is a clonable handle to a broadcast channel with an
//! optional merge-repeated-events mode: publishing an event equal to the
//! previously published one is a no-op, so subscribers observe one event
//! per distinct value. Header and address-status streams use the merging
//! mode; connection events do not.

use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

const STREAM_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct EventStream<T> {
    tx: broadcast::Sender<T>,
    /// Last published value, present only in merge-repeated mode.
    last: Option<Arc<Mutex<Option<T>>>>,
}

impl<T: Clone + PartialEq> EventStream<T> {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(STREAM_CAPACITY);
        Self { tx, last: None }
    }

    /// A stream that suppresses consecutive duplicate events.
    pub fn merging() -> Self {
        let (tx, _) = broadcast::channel(STREAM_CAPACITY);
        Self { tx, last: Some(Arc::new(Mutex::new(None))) }
    }

    /// Publish an event. Dropped silently when merging and equal to the
    /// previous event, or when nobody is subscribed.
    pub fn send(&self, event: T) {
        if let Some(last) = &self.last {
            let mut last = last.lock().unwrap();
            if last.as_ref() == Some(&event) {
                return;
            }
            *last = Some(event.clone());
        }
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    /// Await the next event published after this call. `None` only when
    /// every sender handle has been dropped.
    pub async fn first(&self) -> Option<T> {
        let mut rx = self.tx.subscribe();
        loop {
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl<T: Clone + PartialEq> Default for EventStream<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn merging_collapses_consecutive_duplicates() {
        let stream: EventStream<serde_json::Value> = EventStream::merging();
        let mut rx = stream.subscribe();

        stream.send(json!({"height": 1}));
        stream.send(json!({"height": 1}));
        stream.send(json!({"height": 2}));
        stream.send(json!({"height": 1}));

        assert_eq!(rx.recv().await.unwrap(), json!({"height": 1}));
        assert_eq!(rx.recv().await.unwrap(), json!({"height": 2}));
        assert_eq!(rx.recv().await.unwrap(), json!({"height": 1}));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn non_merging_delivers_everything() {
        let stream: EventStream<bool> = EventStream::new();
        let mut rx = stream.subscribe();

        stream.send(true);
        stream.send(true);

        assert!(rx.recv().await.unwrap());
        assert!(rx.recv().await.unwrap());
    }

    #[tokio::test]
    async fn first_sees_only_later_events() {
        let stream: EventStream<bool> = EventStream::new();
        stream.send(true);

        let waiter = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.first().await })
        };
        tokio::task::yield_now().await;
        stream.send(false);

        assert_eq!(waiter.await.unwrap(), Some(false));
    }
}
