//! Change notifications.
//!
//! Commit emits one [`Event`] per applied record, in log order, after the
//! generation flip, followed by a `NewGen` event. Delivery is best effort:
//! a notifier that cannot deliver logs and drops the event, the commit
//! never fails because of it.

use nft_common::Family;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

/// What changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NewTable,
    DelTable,
    NewChain,
    DelChain,
    NewRule,
    DelRule,
    NewSet,
    DelSet,
    NewSetElem,
    DelSetElem,
    NewObj,
    DelObj,
    NewFlowtable,
    DelFlowtable,
    NewGen,
}

/// A notification with a snapshot of the entity it concerns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub kind: EventKind,
    pub family: Family,
    /// Owning table; empty for `NewGen`
    pub table: String,
    /// Entity name, when it has one
    pub name: Option<String>,
    pub handle: u64,
    pub snapshot: Value,
}

impl Event {
    pub fn new(kind: EventKind, family: Family, table: &str) -> Self {
        Self {
            kind,
            family,
            table: table.to_string(),
            name: None,
            handle: 0,
            snapshot: Value::Null,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn handle(mut self, handle: u64) -> Self {
        self.handle = handle;
        self
    }

    pub fn snapshot(mut self, snapshot: Value) -> Self {
        self.snapshot = snapshot;
        self
    }
}

/// Fire-and-forget event sink.
pub trait Notifier: Send + Sync {
    fn emit(&self, event: Event);
}

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn emit(&self, _event: Event) {}
}

/// Stores events in memory.
#[derive(Debug, Default)]
pub struct CollectingNotifier {
    events: Mutex<Vec<Event>>,
}

impl CollectingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns everything collected so far.
    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Kinds of the collected events, in order.
    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().iter().map(|e| e.kind).collect()
    }
}

impl Notifier for CollectingNotifier {
    fn emit(&self, event: Event) {
        self.events.lock().push(event);
    }
}

/// Fans events out to any number of async subscribers.
#[derive(Debug)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Event>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Notifier for BroadcastNotifier {
    fn emit(&self, event: Event) {
        if let Err(e) = self.tx.send(event) {
            tracing::debug!(kind = ?e.0.kind, "no subscriber for event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_collecting() {
        let notifier = CollectingNotifier::new();
        notifier.emit(Event::new(EventKind::NewTable, Family::Inet, "filter").handle(1));
        notifier.emit(Event::new(EventKind::NewGen, Family::Unspec, ""));
        assert_eq!(notifier.kinds(), vec![EventKind::NewTable, EventKind::NewGen]);
        assert_eq!(notifier.take().len(), 2);
        assert!(notifier.kinds().is_empty());
    }

    #[test]
    fn test_broadcast_without_subscribers() {
        let notifier = BroadcastNotifier::new(4);
        notifier.emit(Event::new(EventKind::NewGen, Family::Unspec, ""));
    }

    #[tokio::test]
    async fn test_broadcast_delivery() {
        let notifier = BroadcastNotifier::new(4);
        let mut rx = notifier.subscribe();
        notifier.emit(Event::new(EventKind::NewChain, Family::Ipv4, "nat").name("post"));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::NewChain);
        assert_eq!(event.name.as_deref(), Some("post"));
    }
}
