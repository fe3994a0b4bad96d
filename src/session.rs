//! Zone session: the per-zone operational message loop (spec §4.9).
//!
//! Owns the framed connection, a [`ProtocolHandler`], a [`RenewalHandler`],
//! and the callbacks the device service wired in at session creation. Runs
//! until the peer disconnects or the service-wide shutdown token fires; the
//! device service is responsible for emitting `EventDisconnected` once this
//! returns (spec §4.9: "On exit the session is closed and the device
//! service emits EventDisconnected").

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collaborators::{NullProtocolLogger, ProtocolLogger};
use crate::device_model::InvokeContext;
use crate::error::MashResult;
use crate::model::OperationalCertificate;
use crate::protocol::messages::{Frame, RenewalStatusCode};
use crate::protocol::ProtocolHandler;
use crate::renewal::RenewalHandler;
use crate::transport::FrameIo;

/// Fired once a renewal install succeeds, carrying the new operational
/// certificate so the service can swap its TLS identity and persist it.
pub type CertRenewalSuccessCallback = Box<dyn Fn(OperationalCertificate) + Send + Sync>;

pub struct ZoneSession<T: FrameIo> {
    conn: T,
    ctx: InvokeContext,
    protocol: std::sync::Arc<ProtocolHandler>,
    renewal: RenewalHandler,
    notify_rx: UnboundedReceiver<Frame>,
    on_cert_renewal_success: CertRenewalSuccessCallback,
    protocol_logger: Arc<dyn ProtocolLogger>,
}

impl<T: FrameIo> ZoneSession<T> {
    pub fn new(
        conn: T,
        ctx: InvokeContext,
        protocol: std::sync::Arc<ProtocolHandler>,
        renewal: RenewalHandler,
        notify_rx: UnboundedReceiver<Frame>,
        on_cert_renewal_success: CertRenewalSuccessCallback,
    ) -> Self {
        Self {
            conn,
            ctx,
            protocol,
            renewal,
            notify_rx,
            on_cert_renewal_success,
            protocol_logger: Arc::new(NullProtocolLogger),
        }
    }

    /// Installs a structured protocol logger observing every frame this
    /// session sends or receives (spec §4.9 "an optional structured protocol
    /// logger").
    pub fn with_protocol_logger(mut self, logger: Arc<dyn ProtocolLogger>) -> Self {
        self.protocol_logger = logger;
        self
    }

    /// The message loop itself: read a frame, dispatch, continue. Ordering
    /// within a session is arrival order for requests and their responses
    /// (spec §5); outbound notifications interleave but never reorder a
    /// request/response pair since each iteration fully drains one frame
    /// before selecting again.
    pub async fn run(&mut self, shutdown: CancellationToken) -> MashResult<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(target: "mash::session", zone_id = %self.ctx.zone_id, "session loop cancelled by shutdown");
                    return Ok(());
                }
                notification = self.notify_rx.recv() => {
                    match notification {
                        Some(frame) => {
                            let bytes = frame.encode()?;
                            self.send_logged(&bytes).await?;
                        }
                        None => {
                            debug!(target: "mash::session", zone_id = %self.ctx.zone_id, "notification channel closed");
                        }
                    }
                }
                frame = self.conn.read_frame() => {
                    let bytes = frame?;
                    self.protocol_logger.on_frame_in(&self.ctx.zone_id, &bytes);
                    let decoded = Frame::decode(&bytes)?;
                    if !self.dispatch(decoded).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Sends a frame's already-encoded bytes, reporting them to the
    /// protocol logger first (spec §4.9 "an optional structured protocol
    /// logger" observes every frame this session sends or receives).
    async fn send_logged(&mut self, bytes: &[u8]) -> MashResult<()> {
        self.protocol_logger.on_frame_out(&self.ctx.zone_id, bytes);
        self.conn.send_frame(bytes).await
    }

    /// Handles one decoded frame. Returns `Ok(false)` if the peer asked to
    /// end the session cleanly (currently: never — reserved for a future
    /// graceful-close frame); any transport/codec error instead propagates
    /// and ends the loop.
    async fn dispatch(&mut self, frame: Frame) -> MashResult<bool> {
        match frame {
            Frame::Request(req) => {
                let response = self.protocol.handle_request(&self.ctx, req);
                let bytes = Frame::Response(response).encode()?;
                self.send_logged(&bytes).await?;
            }
            Frame::CertRenewalRequest { nonce, .. } => {
                match self.renewal.handle_renewal_request(&nonce) {
                    Ok(csr) => {
                        let bytes = Frame::CertRenewalCsr { csr_der: csr.csr_der, nonce_hash: Some(csr.nonce_hash) }.encode()?;
                        self.send_logged(&bytes).await?;
                    }
                    Err(e) => {
                        warn!(target: "mash::session", zone_id = %self.ctx.zone_id, error = %e, "renewal CSR generation failed");
                        let bytes = Frame::CertRenewalAck { status: RenewalStatusCode::CsrFailed, active_sequence: 0 }.encode()?;
                        self.send_logged(&bytes).await?;
                    }
                }
            }
            Frame::CertRenewalInstall { new_cert_der, sequence } => {
                let (status, installed) = self.renewal.handle_cert_install(&new_cert_der, &self.ctx.zone_id, sequence);
                let active_sequence = installed.as_ref().map(|c| c.sequence).unwrap_or(sequence);
                let bytes = Frame::CertRenewalAck { status: status.into(), active_sequence }.encode()?;
                self.send_logged(&bytes).await?;
                if let Some(cert) = installed {
                    info!(target: "mash::session", zone_id = %self.ctx.zone_id, sequence, "certificate renewed");
                    (self.on_cert_renewal_success)(cert);
                }
            }
            Frame::Response(_) | Frame::Notification(_) | Frame::PaseRequest(_) | Frame::PaseResponse(_) | Frame::Busy { .. } => {
                warn!(target: "mash::session", zone_id = %self.ctx.zone_id, "unexpected frame in operational session");
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::ZoneCa;
    use crate::device_model::InMemoryDeviceModel;
    use crate::model::ZoneType;
    use crate::protocol::messages::{Operation, ReadPayload, Request, RequestPayload};
    use crate::transport::FramedConnection;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tokio::io::duplex;

    fn protocol_handler() -> (Arc<ProtocolHandler>, tokio::sync::mpsc::UnboundedReceiver<Frame>) {
        let model = Arc::new(InMemoryDeviceModel::new());
        model.add_feature(1, 1, false);
        model.set_attribute(1, 1, 5, serde_cbor::Value::Integer(1));
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Arc::new(ProtocolHandler::new(model, tx, |_, _, _| {})), rx)
    }

    #[tokio::test]
    async fn operational_request_gets_a_response() {
        let (device_io, peer_io) = duplex(8192);
        let mut peer_conn = FramedConnection::new(peer_io);
        let (protocol, notify_rx) = protocol_handler();

        let mut session = ZoneSession::new(
            FramedConnection::new(device_io),
            InvokeContext { zone_id: "zone-1".into(), zone_type: ZoneType::Local },
            protocol,
            RenewalHandler::new("dev-1", ZoneType::Local),
            notify_rx,
            Box::new(|_| {}),
        );

        let shutdown = CancellationToken::new();
        let shutdown_clone = shutdown.clone();
        let handle = tokio::spawn(async move { session.run(shutdown_clone).await });

        let req = Frame::Request(Request {
            message_id: 1,
            operation: Operation::Read,
            endpoint_id: 1,
            feature_id: 1,
            payload: RequestPayload::Read(ReadPayload { attribute_ids: vec![5] }),
        });
        peer_conn.send(&req.encode().unwrap()).await.unwrap();

        let resp_bytes = peer_conn.read_frame().await.unwrap();
        let resp = Frame::decode(&resp_bytes).unwrap();
        assert!(matches!(resp, Frame::Response(_)));

        shutdown.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn renewal_request_then_install_fires_success_callback() {
        let (device_io, peer_io) = duplex(16384);
        let mut peer_conn = FramedConnection::new(peer_io);
        let (protocol, notify_rx) = protocol_handler();
        let ca = ZoneCa::generate(ZoneType::Local).unwrap();

        let installed_certs = Arc::new(Mutex::new(Vec::new()));
        let installed_clone = installed_certs.clone();

        let mut session = ZoneSession::new(
            FramedConnection::new(device_io),
            InvokeContext { zone_id: "zone-1".into(), zone_type: ZoneType::Local },
            protocol,
            RenewalHandler::new("dev-1", ZoneType::Local),
            notify_rx,
            Box::new(move |cert| installed_clone.lock().push(cert)),
        );

        let shutdown = CancellationToken::new();
        let shutdown_clone = shutdown.clone();
        let handle = tokio::spawn(async move { session.run(shutdown_clone).await });

        let req = Frame::CertRenewalRequest { nonce: b"nonce-a".to_vec(), zone_ca_der: ca.cert_der.clone() };
        peer_conn.send(&req.encode().unwrap()).await.unwrap();
        let csr_bytes = peer_conn.read_frame().await.unwrap();
        let csr_der = match Frame::decode(&csr_bytes).unwrap() {
            Frame::CertRenewalCsr { csr_der, .. } => csr_der,
            other => panic!("unexpected frame: {other:?}"),
        };

        let signed = ca.sign_csr(&csr_der).unwrap();
        let install = Frame::CertRenewalInstall { new_cert_der: signed, sequence: 1 };
        peer_conn.send(&install.encode().unwrap()).await.unwrap();
        let ack_bytes = peer_conn.read_frame().await.unwrap();
        match Frame::decode(&ack_bytes).unwrap() {
            Frame::CertRenewalAck { status, .. } => assert_eq!(status, RenewalStatusCode::Success),
            other => panic!("unexpected frame: {other:?}"),
        }

        shutdown.cancel();
        let _ = handle.await;
        assert_eq!(installed_certs.lock().len(), 1);
    }

    #[tokio::test]
    async fn notification_is_pushed_to_peer_without_a_request() {
        let (device_io, peer_io) = duplex(8192);
        let mut peer_conn = FramedConnection::new(peer_io);
        let model = Arc::new(InMemoryDeviceModel::new());
        model.add_feature(1, 1, false);
        model.set_attribute(1, 1, 5, serde_cbor::Value::Integer(1));
        let (tx, notify_rx) = tokio::sync::mpsc::unbounded_channel();
        let protocol = Arc::new(ProtocolHandler::new(model, tx, |_, _, _| {}));

        let mut session = ZoneSession::new(
            FramedConnection::new(device_io),
            InvokeContext { zone_id: "zone-1".into(), zone_type: ZoneType::Local },
            protocol.clone(),
            RenewalHandler::new("dev-1", ZoneType::Local),
            notify_rx,
            Box::new(|_| {}),
        );

        let shutdown = CancellationToken::new();
        let shutdown_clone = shutdown.clone();
        let handle = tokio::spawn(async move { session.run(shutdown_clone).await });

        // Prime a subscription first so the push has somewhere to go.
        let sub_req = Frame::Request(Request {
            message_id: 1,
            operation: Operation::Subscribe,
            endpoint_id: 1,
            feature_id: 1,
            payload: RequestPayload::Subscribe(crate::protocol::messages::SubscribePayload {
                attribute_ids: vec![5],
                min_interval_ms: 0,
                max_interval_ms: 1000,
            }),
        });
        peer_conn.send(&sub_req.encode().unwrap()).await.unwrap();
        let _ = peer_conn.read_frame().await.unwrap();

        protocol.notify_attribute_change(1, 1, 5, serde_cbor::Value::Integer(9));
        let bytes = peer_conn.read_frame().await.unwrap();
        assert!(matches!(Frame::decode(&bytes).unwrap(), Frame::Notification(_)));

        shutdown.cancel();
        let _ = handle.await;
    }
}
