//! Device lifecycle events and emitter seams.
//!
//! The supervisor reports what it does through an [`EventEmitter`] so hosting
//! applications can surface connectivity and state changes however they like.
//! Three implementations ship with the crate: a no-op, a logger, and a
//! broadcast-channel fan-out.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::snapshot::StateDelta;

/// Something that happened to a managed device.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum DeviceEvent {
    /// A connect attempt started.
    Connecting { device_id: String },
    /// A connect attempt finished. Emitted whether or not the TV was
    /// reachable; check [`TvDevice::available`](crate::TvDevice::available)
    /// for the outcome.
    Connected { device_id: String },
    /// The device was explicitly disconnected.
    Disconnected { device_id: String },
    /// The reconnect loop gave up.
    Error { device_id: String, message: String },
    /// Cached state changed; `delta` holds only the fields that differ.
    Update { device_id: String, delta: StateDelta },
}

impl DeviceEvent {
    pub fn device_id(&self) -> &str {
        match self {
            DeviceEvent::Connecting { device_id }
            | DeviceEvent::Connected { device_id }
            | DeviceEvent::Disconnected { device_id }
            | DeviceEvent::Error { device_id, .. }
            | DeviceEvent::Update { device_id, .. } => device_id,
        }
    }
}

pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: DeviceEvent);
}

/// Swallows all events.
#[derive(Debug, Default)]
pub struct NoopEventEmitter;

impl EventEmitter for NoopEventEmitter {
    fn emit(&self, _event: DeviceEvent) {}
}

/// Logs every event at debug level.
#[derive(Debug, Default)]
pub struct LoggingEventEmitter;

impl EventEmitter for LoggingEventEmitter {
    fn emit(&self, event: DeviceEvent) {
        tracing::debug!(device_id = event.device_id(), ?event, "device event");
    }
}

/// Fans events out to any number of broadcast subscribers.
pub struct BroadcastEventEmitter {
    tx: broadcast::Sender<DeviceEvent>,
}

impl BroadcastEventEmitter {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (tx, _) = broadcast::channel(capacity);
        Arc::new(Self { tx })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.tx.subscribe()
    }

    pub fn sender(&self) -> broadcast::Sender<DeviceEvent> {
        self.tx.clone()
    }
}

impl EventEmitter for BroadcastEventEmitter {
    fn emit(&self, event: DeviceEvent) {
        if self.tx.send(event).is_err() {
            // no receivers right now, nothing to deliver
            log::trace!("[Events] dropped event, no subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_emitter_delivers_to_subscribers() {
        let emitter = BroadcastEventEmitter::new(8);
        let mut rx = emitter.subscribe();
        emitter.emit(DeviceEvent::Connecting { device_id: "tv-1".into() });

        let event = rx.try_recv().unwrap();
        assert_eq!(event.device_id(), "tv-1");
    }

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let emitter = BroadcastEventEmitter::new(8);
        emitter.emit(DeviceEvent::Disconnected { device_id: "tv-1".into() });
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = DeviceEvent::Connected { device_id: "tv-1".into() };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "connected");
        assert_eq!(json["deviceId"], "tv-1");
    }
}
