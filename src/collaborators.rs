//! External collaborator interfaces (spec §6): mDNS advertising/browsing,
//! certificate and state persistence, and the structured protocol logger.
//! Real implementations (files, a KV store, an mDNS responder) belong to the
//! embedder; this module specifies the trait boundary and ships the
//! in-memory/no-op implementations used by tests and headless operation.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::model::ZoneType;

/// Advertised commissionable-device info (discriminator + whatever else the
/// mDNS TXT record needs); kept opaque beyond the fields this crate derives.
#[derive(Debug, Clone)]
pub struct CommissionableInfo {
    pub discriminator: u16,
    pub device_id: String,
}

#[derive(Debug, Clone)]
pub struct OperationalInfo {
    pub device_id: String,
}

/// A newly observed pairing request from the network, handed to the
/// callback registered via `browse_pairing_requests`.
#[derive(Debug, Clone)]
pub struct PairingRequest {
    pub discriminator: u16,
    pub source: String,
}

/// mDNS advertising/browsing collaborator (spec §6 "mDNS (collaborator
/// interface)").
#[async_trait]
pub trait MdnsAdvertiser: Send + Sync {
    async fn advertise_commissionable(&self, info: CommissionableInfo);
    async fn stop_commissionable(&self);
    async fn advertise_operational(&self, info: OperationalInfo);
    async fn stop_all(&self);

    /// Runs until `shutdown` fires, invoking `callback` for each pairing
    /// request observed on the network.
    async fn browse_pairing_requests(
        &self,
        shutdown: CancellationToken,
        callback: Arc<dyn Fn(PairingRequest) + Send + Sync>,
    );
}

/// No-op implementation for tests and headless deployments that don't want
/// real mDNS traffic.
pub struct NullMdns;

#[async_trait]
impl MdnsAdvertiser for NullMdns {
    async fn advertise_commissionable(&self, _info: CommissionableInfo) {}
    async fn stop_commissionable(&self) {}
    async fn advertise_operational(&self, _info: OperationalInfo) {}
    async fn stop_all(&self) {}

    async fn browse_pairing_requests(
        &self,
        shutdown: CancellationToken,
        _callback: Arc<dyn Fn(PairingRequest) + Send + Sync>,
    ) {
        shutdown.cancelled().await;
    }
}

/// Persisted per-zone operational certificate material (spec §6 `CertStore`).
#[derive(Debug, Clone)]
pub struct StoredCert {
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
}

/// Certificate persistence collaborator (spec §6 "Persistence ... `CertStore`").
pub trait CertStore: Send + Sync {
    fn get_operational_cert(&self, zone_id: &str) -> Option<StoredCert>;
    fn set_operational_cert(&self, zone_id: &str, cert: StoredCert);
    fn set_zone_ca_cert(&self, zone_id: &str, ca_cert_der: Vec<u8>);
    fn get_zone_ca(&self, zone_id: &str) -> Option<Vec<u8>>;
    fn list_zones(&self) -> Vec<String>;
    fn save(&self) -> std::io::Result<()>;
}

#[derive(Default)]
struct CertStoreInner {
    operational: BTreeMap<String, StoredCert>,
    zone_ca: BTreeMap<String, Vec<u8>>,
}

/// In-memory `CertStore`, the default and the one used by tests (spec §6:
/// "persistence file formats beyond semantics" is out of scope for this crate).
#[derive(Default)]
pub struct InMemoryCertStore {
    inner: RwLock<CertStoreInner>,
}

impl CertStore for InMemoryCertStore {
    fn get_operational_cert(&self, zone_id: &str) -> Option<StoredCert> {
        self.inner.read().operational.get(zone_id).cloned()
    }

    fn set_operational_cert(&self, zone_id: &str, cert: StoredCert) {
        self.inner.write().operational.insert(zone_id.to_string(), cert);
    }

    fn set_zone_ca_cert(&self, zone_id: &str, ca_cert_der: Vec<u8>) {
        self.inner.write().zone_ca.insert(zone_id.to_string(), ca_cert_der);
    }

    fn get_zone_ca(&self, zone_id: &str) -> Option<Vec<u8>> {
        self.inner.read().zone_ca.get(zone_id).cloned()
    }

    fn list_zones(&self) -> Vec<String> {
        self.inner.read().operational.keys().cloned().collect()
    }

    fn save(&self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A single zone's persisted membership record (spec §6 `DeviceState`).
#[derive(Debug, Clone)]
pub struct ZoneMembership {
    pub zone_id: String,
    pub zone_type: ZoneType,
    pub cert_sequence: u64,
}

/// Whole-device persisted state (spec §6 `StateStore`:
/// `DeviceState = { saved_at, zones, zone_index_map, failsafe_state }`).
#[derive(Debug, Clone)]
pub struct DeviceState {
    pub saved_at_unix: i64,
    pub zones: Vec<ZoneMembership>,
    pub zone_index_map: BTreeMap<String, usize>,
    pub failsafe_state: BTreeMap<String, bool>,
}

/// Whole-device state persistence collaborator (spec §6 `StateStore`).
pub trait StateStore: Send + Sync {
    fn load(&self) -> Option<DeviceState>;
    fn save(&self, state: DeviceState);
}

/// In-memory `StateStore`, used by default and by tests.
#[derive(Default)]
pub struct InMemoryStateStore {
    inner: RwLock<Option<DeviceState>>,
}

impl StateStore for InMemoryStateStore {
    fn load(&self) -> Option<DeviceState> {
        self.inner.read().clone()
    }

    fn save(&self, state: DeviceState) {
        *self.inner.write() = Some(state);
    }
}

/// Structured per-frame observer for diagnostics (spec §6 `ProtocolLogger`;
/// named in the config table as `protocol_logger` but, per the original
/// scope, given no interface of its own — this is that interface).
pub trait ProtocolLogger: Send + Sync {
    fn on_frame_in(&self, zone_id: &str, bytes: &[u8]);
    fn on_frame_out(&self, zone_id: &str, bytes: &[u8]);
}

/// No-op logger, the default when no `protocol_logger` is configured.
pub struct NullProtocolLogger;

impl ProtocolLogger for NullProtocolLogger {
    fn on_frame_in(&self, _zone_id: &str, _bytes: &[u8]) {}
    fn on_frame_out(&self, _zone_id: &str, _bytes: &[u8]) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_cert_store_round_trips() {
        let store = InMemoryCertStore::default();
        assert!(store.get_operational_cert("zone-1").is_none());
        store.set_operational_cert("zone-1", StoredCert { cert_der: vec![1, 2, 3], key_der: vec![4, 5] });
        let got = store.get_operational_cert("zone-1").unwrap();
        assert_eq!(got.cert_der, vec![1, 2, 3]);
        assert_eq!(store.list_zones(), vec!["zone-1".to_string()]);
    }

    #[test]
    fn in_memory_state_store_round_trips() {
        let store = InMemoryStateStore::default();
        assert!(store.load().is_none());
        store.save(DeviceState {
            saved_at_unix: 100,
            zones: vec![ZoneMembership { zone_id: "z1".into(), zone_type: ZoneType::Local, cert_sequence: 1 }],
            zone_index_map: BTreeMap::from([("z1".to_string(), 0)]),
            failsafe_state: BTreeMap::new(),
        });
        let loaded = store.load().unwrap();
        assert_eq!(loaded.zones.len(), 1);
        assert_eq!(loaded.saved_at_unix, 100);
    }

    #[tokio::test]
    async fn null_mdns_browse_returns_on_shutdown() {
        let mdns = NullMdns;
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        mdns.browse_pairing_requests(shutdown, Arc::new(|_| {})).await;
    }
}
