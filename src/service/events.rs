//! Device service event bus (spec §4.10, §5 ordering guarantees).

/// Events emitted by the device service. Delivery is asynchronous relative
/// to the state change that caused it — every event is sent only after the
/// service lock guarding zone state has been released (spec §5: "every
/// outbound event ... is invoked after the lock is released").
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    /// Precedes any `ValueChanged` caused by the same zone, and follows a
    /// `CommissioningClosed { reason: "commissioned" }` for a freshly
    /// commissioned zone (spec §5 ordering guarantees).
    Connected { zone_id: String },
    /// Follows the last message the session handled.
    Disconnected { zone_id: String },
    CommissioningClosed { reason: String },
    ZoneRemoved { zone_id: String },
    Commissioned { zone_id: String },
    ValueChanged { zone_id: String, endpoint_id: u32, feature_id: u32, attribute_id: u32 },
}

pub type EventSender = tokio::sync::mpsc::UnboundedSender<ServiceEvent>;
pub type EventReceiver = tokio::sync::mpsc::UnboundedReceiver<ServiceEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    tokio::sync::mpsc::unbounded_channel()
}
