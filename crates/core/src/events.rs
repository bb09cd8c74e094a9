//! Process-wide event stream
//!
//! A broadcast channel carrying engine events. The sink is cheap to clone
//! and constructor-injected so tests can observe or replace it.

use tokio::sync::broadcast;

use crate::device_id::DeviceId;

/// Folder activity states surfaced to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolderActivity {
    Idle,
    Scanning,
    Pulling,
    Stopped,
}

/// Engine events.
#[derive(Debug, Clone)]
pub enum Event {
    FolderStateChanged {
        folder: String,
        activity: FolderActivity,
        error: Option<String>,
    },
    LocalIndexUpdated {
        folder: String,
        items: usize,
    },
    RemoteIndexUpdated {
        device: DeviceId,
        folder: String,
        items: usize,
    },
    ItemFinished {
        folder: String,
        item: String,
        error: Option<String>,
    },
    DeviceConnected {
        device: DeviceId,
    },
    DeviceDisconnected {
        device: DeviceId,
    },
    DeviceRenamed {
        device: DeviceId,
        name: String,
    },
    ConfigSaved,
}

/// Fan-out sender for [`Event`]s. Publishing with no subscribers is fine.
#[derive(Clone)]
pub struct EventSink {
    tx: broadcast::Sender<Event>,
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(512);
        Self { tx }
    }

    pub fn publish(&self, event: Event) {
        // Send fails only when nobody listens, which is not an error.
        let _ = self.tx.send(event);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_receive() {
        let sink = EventSink::new();
        let mut rx = sink.subscribe();
        sink.publish(Event::ConfigSaved);
        assert!(matches!(rx.recv().await.unwrap(), Event::ConfigSaved));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let sink = EventSink::new();
        sink.publish(Event::ConfigSaved); // must not panic
    }
}
