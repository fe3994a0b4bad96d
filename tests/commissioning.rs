//! End-to-end commissioning scenarios driven entirely through the public
//! API, the way `tests/basic.rs`/`tests/feature_suite.rs` drive the teacher
//! crate's handshake layer over an in-memory transport rather than a real
//! socket.

use std::sync::Arc;
use std::time::Duration;

use mash::collaborators::{InMemoryCertStore, InMemoryStateStore, NullMdns};
use mash::device_model::InMemoryDeviceModel;
use mash::pase::PaseClient;
use mash::protocol::messages::{Frame, RenewalStatusCode};
use mash::service::events::{self, ServiceEvent};
use mash::transport::FramedConnection;
use mash::{cert, DeviceConfig, DeviceService, ZoneType};
use tokio::io::duplex;

fn config(max_zones: usize) -> DeviceConfig {
    let mut cfg = DeviceConfig::new("127.0.0.1:0".parse().unwrap(), 42, "12345678").test_mode();
    cfg.max_zones = max_zones;
    cfg
}

fn new_service(max_zones: usize) -> (DeviceService<InMemoryDeviceModel>, events::EventReceiver) {
    let (events_tx, events_rx) = events::event_channel();
    let service = DeviceService::new(
        config(max_zones),
        Arc::new(InMemoryDeviceModel::new()),
        Arc::new(InMemoryCertStore::default()),
        Arc::new(InMemoryStateStore::default()),
        Arc::new(NullMdns),
        events_tx,
    )
    .unwrap();
    (service, events_rx)
}

/// Drives one full commissioning attempt (PASE + cert exchange) against
/// `service` over an in-memory duplex pipe standing in for a TLS stream.
async fn run_commissioning_attempt(
    service: &DeviceService<InMemoryDeviceModel>,
    setup_code: &str,
) -> tokio::task::JoinHandle<mash::MashResult<()>> {
    let (device_io, controller_io) = duplex(32_768);
    let mut controller_conn = FramedConnection::new(controller_io);
    let ca = cert::ZoneCa::generate(ZoneType::Local).unwrap();

    let service_clone = service.clone();
    let device_task = tokio::spawn(async move {
        let mut conn = FramedConnection::new(device_io);
        service_clone.handle_connection(&mut conn, false).await
    });

    let handshake = PaseClient::handshake(&mut controller_conn, setup_code, b"controller", b"device", Duration::from_secs(2)).await;
    if handshake.is_err() {
        drop(controller_conn);
        return device_task;
    }

    controller_conn
        .send(&Frame::CertRenewalRequest { nonce: b"n".to_vec(), zone_ca_der: ca.cert_der.clone() }.encode().unwrap())
        .await
        .unwrap();
    let csr_bytes = controller_conn.read_frame().await.unwrap();
    let csr_der = match Frame::decode(&csr_bytes).unwrap() {
        Frame::CertRenewalCsr { csr_der, .. } => csr_der,
        other => panic!("expected a CSR frame, got {other:?}"),
    };
    let signed = ca.sign_csr(&csr_der).unwrap();
    controller_conn
        .send(&Frame::CertRenewalInstall { new_cert_der: signed, sequence: 1 }.encode().unwrap())
        .await
        .unwrap();
    let ack_bytes = controller_conn.read_frame().await.unwrap();
    match Frame::decode(&ack_bytes).unwrap() {
        Frame::CertRenewalAck { status, .. } => assert_eq!(status, RenewalStatusCode::Success),
        other => panic!("expected a cert-renewal ack, got {other:?}"),
    }

    drop(controller_conn);
    device_task
}

#[tokio::test]
async fn happy_commissioning_orders_events_and_closes_the_window() {
    let (service, mut events_rx) = new_service(2);
    service.start().await.unwrap();

    // The commissioning attempt now runs the full operational session after
    // registering the zone (spec §4.10(h)), so the device task only returns
    // once the controller side drops — which surfaces as a transport error
    // from the final `read_frame`, same as any other disconnected session.
    let _ = run_commissioning_attempt(&service, "12345678").await.await;

    // Spec §5 ordering: CommissioningClosed("commissioned") precedes the
    // first Connected for the newly commissioned zone, which itself
    // precedes any value-changed event, which precedes the eventual
    // Disconnected once the controller drops the connection.
    let mut saw_closed = false;
    let mut saw_commissioned = false;
    let mut saw_connected = false;
    let mut saw_disconnected = false;
    while let Ok(event) = events_rx.try_recv() {
        match event {
            ServiceEvent::CommissioningClosed { reason } => {
                assert_eq!(reason, "commissioned");
                assert!(!saw_commissioned && !saw_connected, "closed must come first");
                saw_closed = true;
            }
            ServiceEvent::Commissioned { .. } => {
                assert!(saw_closed, "commissioned must follow window close");
                saw_commissioned = true;
            }
            ServiceEvent::Connected { .. } => {
                assert!(saw_commissioned, "connected must follow the Commissioned event");
                saw_connected = true;
            }
            ServiceEvent::Disconnected { .. } => {
                assert!(saw_connected, "disconnected must follow connected");
                saw_disconnected = true;
            }
            other => panic!("unexpected event in happy path: {other:?}"),
        }
    }
    assert!(saw_closed && saw_commissioned && saw_connected && saw_disconnected);

    assert_eq!(service.zone_count(), 1);
    assert!(!service.device_id().is_empty());
}

#[tokio::test]
async fn wrong_setup_code_never_registers_a_zone() {
    let (service, mut events_rx) = new_service(2);
    service.start().await.unwrap();

    let _ = run_commissioning_attempt(&service, "00000000").await.await;

    assert_eq!(service.zone_count(), 0);
    assert!(events_rx.try_recv().is_err(), "no Connected/Commissioned event on a failed PASE attempt");
}

#[tokio::test]
async fn second_zone_needs_a_reopened_window_and_a_third_is_capped() {
    // Each successful commission closes the window (spec §4.10(h)), so a
    // second zone requires the admin to explicitly re-enter commissioning
    // mode. With max_zones=2, a third attempt after that is refused because
    // the registry is full and nothing is disconnected to evict (spec §3
    // invariant |zones| <= MaxZones, spec §8 "zone slots full").
    let (service, _events_rx) = new_service(2);
    service.start().await.unwrap();

    let _ = run_commissioning_attempt(&service, "12345678").await.await;
    assert_eq!(service.zone_count(), 1);

    service.enter_commissioning_mode().unwrap();
    let _ = run_commissioning_attempt(&service, "12345678").await.await;
    assert_eq!(service.zone_count(), 2);

    // Window is closed again after the second commission; without
    // re-entering commissioning mode a third attempt finds the window shut.
    let _ = run_commissioning_attempt(&service, "12345678").await.await;
    assert_eq!(service.zone_count(), 2);
}
