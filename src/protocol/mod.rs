//! Operational protocol handler: dispatches Read/Write/Subscribe/Invoke
//! requests to a [`DeviceModel`] and fans out attribute-change notifications
//! to matching subscriptions (spec §4.8).

pub mod messages;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_cbor::Value as CborValue;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::device_model::{AttrWriteError, CommandError, DeviceModel, InvokeContext};
use crate::model::Subscription;

use messages::{
    Frame, InvokePayload, Notification, Operation, ReadPayload, Request, RequestPayload, Response,
    ResponsePayload, StatusCode, SubscribePayload, UnsubscribePayload, WritePayload,
};

/// Per-zone dispatcher. One instance per zone session (spec §4.9: the
/// session "owns ... a protocol handler").
pub struct ProtocolHandler {
    model: Arc<dyn DeviceModel>,
    subscriptions: Mutex<Vec<Subscription>>,
    next_subscription_id: AtomicU64,
    notify_tx: UnboundedSender<Frame>,
    on_write: Box<dyn Fn(u32, u32, &BTreeMap<u32, CborValue>) + Send + Sync>,
}

impl ProtocolHandler {
    pub fn new(
        model: Arc<dyn DeviceModel>,
        notify_tx: UnboundedSender<Frame>,
        on_write: impl Fn(u32, u32, &BTreeMap<u32, CborValue>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            model,
            subscriptions: Mutex::new(Vec::new()),
            next_subscription_id: AtomicU64::new(1),
            notify_tx,
            on_write: Box::new(on_write),
        }
    }

    /// Dispatches one request, returning the response to send back (spec
    /// §4.8). Unknown endpoint/feature short-circuit before touching the
    /// model at all.
    pub fn handle_request(&self, ctx: &InvokeContext, req: Request) -> Response {
        if !self.model.has_endpoint(req.endpoint_id) {
            return Response::error(req.message_id, StatusCode::InvalidEndpoint, "no such endpoint");
        }
        // Unsubscribe is addressed by feature_id == 0, which intentionally
        // bypasses the has_feature check below (spec §4.8: "featureId==0
        // means Unsubscribe").
        if req.feature_id != 0 && !self.model.has_feature(req.endpoint_id, req.feature_id) {
            return Response::error(req.message_id, StatusCode::InvalidFeature, "no such feature");
        }

        match (&req.operation, req.payload) {
            (Operation::Read, RequestPayload::Read(payload)) => self.handle_read(&req, payload),
            (Operation::Write, RequestPayload::Write(payload)) => self.handle_write(&req, payload),
            (Operation::Subscribe, RequestPayload::Subscribe(payload)) => self.handle_subscribe(&req, payload),
            (Operation::Subscribe, RequestPayload::Unsubscribe(payload)) => self.handle_unsubscribe(&req, payload),
            (Operation::Invoke, RequestPayload::Invoke(payload)) => self.handle_invoke(ctx, &req, payload),
            _ => Response::error(req.message_id, StatusCode::Unsupported, "operation/payload mismatch"),
        }
    }

    fn handle_read(&self, req: &Request, payload: ReadPayload) -> Response {
        let ids = if payload.attribute_ids.is_empty() {
            self.model.readable_attributes(req.endpoint_id, req.feature_id)
        } else {
            payload.attribute_ids
        };

        let mut values = BTreeMap::new();
        for id in ids {
            if let Some(v) = self.model.read_attribute(req.endpoint_id, req.feature_id, id) {
                values.insert(id, v);
            }
        }
        Response { message_id: req.message_id, status: StatusCode::Success, payload: ResponsePayload::Read { values } }
    }

    fn handle_write(&self, req: &Request, payload: WritePayload) -> Response {
        let mut applied = BTreeMap::new();
        let mut failure: Option<StatusCode> = None;

        for (attribute_id, value) in payload.attributes {
            match self.model.write_attribute(req.endpoint_id, req.feature_id, attribute_id, value) {
                Ok(read_back) => {
                    applied.insert(attribute_id, read_back);
                }
                Err(AttrWriteError::NotFound) => {
                    failure = Some(StatusCode::InvalidAttribute);
                    break;
                }
                Err(AttrWriteError::ReadOnly) => {
                    failure = Some(StatusCode::ReadOnly);
                    break;
                }
                Err(AttrWriteError::Constraint(msg)) => {
                    warn!(target: "mash::protocol", %msg, "write rejected by constraint");
                    failure = Some(StatusCode::ConstraintError);
                    break;
                }
            }
        }

        if !applied.is_empty() {
            (self.on_write)(req.endpoint_id, req.feature_id, &applied);
        }

        match failure {
            Some(status) => Response::error(req.message_id, status, "write failed"),
            None => Response {
                message_id: req.message_id,
                status: StatusCode::Success,
                payload: ResponsePayload::Write { values: applied },
            },
        }
    }

    fn handle_subscribe(&self, req: &Request, payload: SubscribePayload) -> Response {
        let id = self.next_subscription_id.fetch_add(1, Ordering::SeqCst);
        let sub = Subscription {
            id,
            endpoint_id: req.endpoint_id,
            feature_id: req.feature_id,
            attribute_ids: payload.attribute_ids.clone(),
            min_interval: std::time::Duration::from_millis(payload.min_interval_ms),
            max_interval: std::time::Duration::from_millis(payload.max_interval_ms),
        };

        let ids = if payload.attribute_ids.is_empty() {
            self.model.readable_attributes(req.endpoint_id, req.feature_id)
        } else {
            payload.attribute_ids
        };
        let mut current_values = BTreeMap::new();
        for id in ids {
            if let Some(v) = self.model.read_attribute(req.endpoint_id, req.feature_id, id) {
                current_values.insert(id, v);
            }
        }

        self.subscriptions.lock().push(sub);
        debug!(target: "mash::protocol", subscription_id = id, "subscription created");

        Response {
            message_id: req.message_id,
            status: StatusCode::Success,
            payload: ResponsePayload::Subscribe { subscription_id: id, current_values },
        }
    }

    fn handle_unsubscribe(&self, req: &Request, payload: UnsubscribePayload) -> Response {
        let mut subs = self.subscriptions.lock();
        let before = subs.len();
        subs.retain(|s| s.id != payload.subscription_id);
        if subs.len() == before {
            return Response::error(req.message_id, StatusCode::InvalidParameter, "unknown subscription id");
        }
        Response { message_id: req.message_id, status: StatusCode::Success, payload: ResponsePayload::Unsubscribe }
    }

    fn handle_invoke(&self, ctx: &InvokeContext, req: &Request, payload: InvokePayload) -> Response {
        match self.model.invoke(ctx, req.endpoint_id, req.feature_id, payload.command_id, payload.params) {
            Ok(value) => Response {
                message_id: req.message_id,
                status: StatusCode::Success,
                payload: ResponsePayload::Invoke { value },
            },
            Err(CommandError::NotFound) => Response::error(req.message_id, StatusCode::InvalidCommand, "no such command"),
            Err(CommandError::Other(msg)) => Response::error(req.message_id, StatusCode::ConstraintError, msg),
        }
    }

    /// Pushes one notification per matching subscription (spec §4.8
    /// `notify_attribute_change`).
    pub fn notify_attribute_change(&self, endpoint_id: u32, feature_id: u32, attribute_id: u32, value: CborValue) {
        let subs = self.subscriptions.lock();
        for sub in subs.iter().filter(|s| s.matches(endpoint_id, feature_id, attribute_id)) {
            let mut changes = BTreeMap::new();
            changes.insert(attribute_id, value.clone());
            let notification = Notification { subscription_id: sub.id, endpoint_id, feature_id, changes };
            if self.notify_tx.send(Frame::Notification(notification)).is_err() {
                debug!(target: "mash::protocol", "notification dropped, session send channel closed");
            }
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }
}
