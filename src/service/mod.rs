//! Device service: the accept loop, routing decision, and state machine
//! tying every other component together (spec §4.10).

pub mod events;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hkdf::Hkdf;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backoff::PaseAttemptTracker;
use crate::cert::{self, DeviceCsrIdentity};
use crate::collaborators::{CertStore, MdnsAdvertiser, NullProtocolLogger, ProtocolLogger, StateStore, StoredCert};
use crate::config::DeviceConfig;
use crate::device_model::{AttrWriteError, CommandError, DeviceModel, FeatureSubscriber, InvokeContext};
use crate::error::{MashError, MashResult};
use crate::gate::{CommissioningGate, GateRefusal};
use crate::model::{OperationalCertificate, Zone, ZoneType};
use crate::pase::{PaseError, PaseServerSession};
use crate::protocol::messages::{Frame, RenewalStatusCode};
use crate::protocol::ProtocolHandler;
use crate::renewal::RenewalHandler;
use crate::session::ZoneSession;
use crate::tracker::{Closeable, ConnectionTracker};
use crate::transport::FrameIo;

use events::{EventSender, ServiceEvent};

/// A pre-operational connection registered with the [`ConnectionTracker`]
/// has no real close handle from this generic, transport-agnostic code path
/// (spec §4.4's forced close is a property of the real TLS accept loop, not
/// of the `FrameIo` abstraction tests drive). This stands in for it so the
/// tracker's bookkeeping (and reaper) still exercises every commissioning
/// attempt; a production accept loop closes the real socket instead.
struct NullCloseable;

impl Closeable for NullCloseable {
    fn close(&self) {}
}

/// Removes a tracker entry on every exit path out of the commissioning
/// handshake (spec §9 "Scoped resources": "acquired on accept, released on
/// every exit path").
struct TrackerGuard<'a> {
    tracker: &'a ConnectionTracker,
    id: u64,
}

impl Drop for TrackerGuard<'_> {
    fn drop(&mut self) {
        self.tracker.remove(self.id);
    }
}

/// Device service lifecycle state (spec §4.10 "State machine states").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// The outcome of the routing decision made right after a TLS handshake
/// completes (spec §4.10 "Routing decision").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    OperationalReconnect { zone_id: String },
    Commissioning,
    Reject,
}

struct ZoneRecord {
    zone: Zone,
    cert: Option<OperationalCertificate>,
}

struct ServiceInner {
    state: ServiceState,
    device_id: String,
    commissioning_open: bool,
    zones: BTreeMap<String, ZoneRecord>,
    current_cert: Option<StoredCert>,
    throwaway_identity: Option<StoredCert>,
}

/// The ADMIN endpoint/feature/command used to expose `RemoveZone` through
/// the regular Invoke dispatch path (spec §4.8 "so that RemoveZone and
/// similar commands can enforce self-removal only").
pub const ADMIN_ENDPOINT_ID: u32 = 0;
pub const ADMIN_FEATURE_ID: u32 = 0;
pub const REMOVE_ZONE_COMMAND_ID: u32 = 1;

/// Ties the injected domain model together with the service's own
/// zone-registry admin surface, so `Invoke(ADMIN, RemoveZone)` reaches
/// `DeviceService::remove_zone` without the protocol handler needing a
/// back-pointer into the service (spec §9 "arena/index design").
struct ServiceDeviceModel<M> {
    inner: Arc<M>,
    service: Arc<DeviceServiceCore>,
}

impl<M: DeviceModel> DeviceModel for ServiceDeviceModel<M> {
    fn has_endpoint(&self, endpoint_id: u32) -> bool {
        endpoint_id == ADMIN_ENDPOINT_ID || self.inner.has_endpoint(endpoint_id)
    }

    fn has_feature(&self, endpoint_id: u32, feature_id: u32) -> bool {
        (endpoint_id == ADMIN_ENDPOINT_ID && feature_id == ADMIN_FEATURE_ID)
            || self.inner.has_feature(endpoint_id, feature_id)
    }

    fn readable_attributes(&self, endpoint_id: u32, feature_id: u32) -> Vec<u32> {
        self.inner.readable_attributes(endpoint_id, feature_id)
    }

    fn read_attribute(&self, endpoint_id: u32, feature_id: u32, attribute_id: u32) -> Option<serde_cbor::Value> {
        self.inner.read_attribute(endpoint_id, feature_id, attribute_id)
    }

    fn write_attribute(
        &self,
        endpoint_id: u32,
        feature_id: u32,
        attribute_id: u32,
        value: serde_cbor::Value,
    ) -> Result<serde_cbor::Value, AttrWriteError> {
        self.inner.write_attribute(endpoint_id, feature_id, attribute_id, value)
    }

    fn invoke(
        &self,
        ctx: &InvokeContext,
        endpoint_id: u32,
        feature_id: u32,
        command_id: u32,
        params: serde_cbor::Value,
    ) -> Result<Option<serde_cbor::Value>, CommandError> {
        if endpoint_id == ADMIN_ENDPOINT_ID && feature_id == ADMIN_FEATURE_ID && command_id == REMOVE_ZONE_COMMAND_ID {
            let target = match &params {
                serde_cbor::Value::Text(s) => s.clone(),
                _ => ctx.zone_id.clone(),
            };
            return DeviceServiceCore::remove_zone(&self.service, ctx, &target)
                .map(|_| None)
                .map_err(|e| CommandError::Other(e.to_string()));
        }
        self.inner.invoke(ctx, endpoint_id, feature_id, command_id, params)
    }
}

/// The shared, clonable core of a device service: everything that needs to
/// be reachable from both the public `DeviceService` handle and from zone
/// sessions spawned on background tasks.
struct DeviceServiceCore {
    config: DeviceConfig,
    inner: RwLock<ServiceInner>,
    gate: CommissioningGate,
    tracker: ConnectionTracker,
    pase_tracker: PaseAttemptTracker,
    active_conns: AtomicUsize,
    shutdown: CancellationToken,
    events_tx: EventSender,
    cert_store: Arc<dyn CertStore>,
    state_store: Arc<dyn StateStore>,
    mdns: Arc<dyn MdnsAdvertiser>,
    /// Every live zone session's protocol handler, keyed by zone id. Kept in
    /// its own lock rather than nested inside `inner` (spec §5: "No function
    /// blocks while holding the service lock"), so fan-out to sessions never
    /// competes with zone-registry mutations for the same lock.
    protocol_handlers: RwLock<BTreeMap<String, Arc<ProtocolHandler>>>,
    /// Optional structured observer over raw frames, wired into every zone
    /// session (spec §4.9 "an optional structured protocol logger"; spec §6
    /// config knob `protocol_logger`). Defaults to a no-op.
    protocol_logger: RwLock<Arc<dyn ProtocolLogger>>,
    /// One independent timer task per zone in the registry (spec §3 "for
    /// every zone in the registry there is exactly one failsafe timer"),
    /// keyed by zone id. Restarted on every connect/reconnect; left running
    /// across a disconnect so a zone that never comes back still trips its
    /// failsafe.
    failsafe_timers: RwLock<BTreeMap<String, CancellationToken>>,
    /// The single in-flight "close the commissioning window after
    /// `CommissioningWindowDuration`" timer, if the window is currently open
    /// (spec §5 "Timers (failsafe, duration, commissioning window, ...)").
    commissioning_window_timer: RwLock<Option<CancellationToken>>,
}

impl FeatureSubscriber for DeviceServiceCore {
    /// Model → subscriber → {event bus, every matching session} fan-out
    /// (spec §9 "Callback-centric fan-out"). A `Write` feeds this path via
    /// the `on_write` callback wired in [`DeviceService::run_zone_session`];
    /// a real device model driven by hardware would call it directly for
    /// changes that happen without any inbound `Write`.
    fn on_attribute_changed(&self, endpoint_id: u32, feature_id: u32, attribute_id: u32, value: serde_cbor::Value) {
        let handlers: Vec<(String, Arc<ProtocolHandler>)> =
            self.protocol_handlers.read().iter().map(|(id, h)| (id.clone(), h.clone())).collect();
        for (zone_id, handler) in handlers {
            handler.notify_attribute_change(endpoint_id, feature_id, attribute_id, value.clone());
            self.emit(ServiceEvent::ValueChanged { zone_id, endpoint_id, feature_id, attribute_id });
        }
    }
}

impl DeviceServiceCore {
    fn state(&self) -> ServiceState {
        self.inner.read().state
    }

    fn set_state(&self, state: ServiceState) {
        self.inner.write().state = state;
    }

    fn zone_count(&self) -> usize {
        self.inner.read().zones.len()
    }

    /// The certificate this device presents over TLS right now (spec §4.10
    /// "Start"/"(h)"): the most recently installed operational certificate,
    /// or a cached throwaway identity before any zone has been commissioned.
    fn current_identity(&self) -> MashResult<StoredCert> {
        if let Some(cert) = self.inner.read().current_cert.clone() {
            return Ok(cert);
        }
        if let Some(identity) = self.inner.read().throwaway_identity.clone() {
            return Ok(identity);
        }
        let identity = crate::tls::generate_throwaway_identity(self.config.discriminator)?;
        self.inner.write().throwaway_identity = Some(identity.clone());
        Ok(identity)
    }

    /// Every Zone CA this device has seen, used to validate a client
    /// certificate presented on an operational reconnection (spec §4.3a).
    fn trusted_zone_cas(&self) -> Vec<Vec<u8>> {
        self.cert_store
            .list_zones()
            .into_iter()
            .filter_map(|zone_id| self.cert_store.get_zone_ca(&zone_id))
            .collect()
    }

    fn is_commissioning_open(&self) -> bool {
        self.inner.read().commissioning_open
    }

    /// Finds any zone with `connected == false`, used both for routing
    /// operational reconnections and for LOCAL-zone eviction.
    fn pick_disconnected_zone(&self) -> Option<String> {
        self.inner
            .read()
            .zones
            .values()
            .find(|r| !r.zone.connected)
            .map(|r| r.zone.id.clone())
    }

    /// Spec §4.10 "Zone eviction": makes room for a new commissioning by
    /// evicting the oldest disconnected LOCAL zone. Callers must only reach
    /// for this after the gate has confirmed every other admission
    /// condition passes and the *only* remaining refusal is a full zone
    /// table, so an attempt that would be refused for some other reason
    /// never costs a LOCAL zone. GRID zones are never evicted; returns
    /// `true` if a slot is available after this call.
    fn make_room_for_new_zone(&self) -> bool {
        let mut inner = self.inner.write();
        if inner.zones.len() < self.config.max_zones {
            return true;
        }

        let oldest_local = inner
            .zones
            .values()
            .filter(|r| !r.zone.connected && r.zone.zone_type == ZoneType::Local)
            .min_by_key(|r| r.zone.last_seen)
            .map(|r| r.zone.id.clone());

        match oldest_local {
            Some(id) => {
                inner.zones.remove(&id);
                info!(target: "mash::service", zone_id = %id, "evicted disconnected LOCAL zone to make room");
                true
            }
            None => false,
        }
    }

    /// Routing decision (spec §4.10 "Routing decision"): a presented peer
    /// certificate plus a known disconnected zone means operational
    /// reconnection; otherwise fall back to the commissioning window.
    fn route(&self, peer_cert_present: bool) -> Route {
        if peer_cert_present {
            if let Some(zone_id) = self.pick_disconnected_zone() {
                return Route::OperationalReconnect { zone_id };
            }
        }
        if self.is_commissioning_open() {
            return Route::Commissioning;
        }
        Route::Reject
    }

    fn emit(&self, event: ServiceEvent) {
        if self.events_tx.send(event).is_err() {
            warn!(target: "mash::service", "event bus has no receiver");
        }
    }

    /// Closes the commissioning window, resetting the PASE tracker (spec
    /// §4.5: "reset ... whenever the commissioning window closes") and
    /// cancelling the duration timer that would otherwise close it again on
    /// the same reason later.
    fn close_commissioning_window(&self, reason: &str) {
        {
            let mut inner = self.inner.write();
            if !inner.commissioning_open {
                return;
            }
            inner.commissioning_open = false;
        }
        if let Some(token) = self.commissioning_window_timer.write().take() {
            token.cancel();
        }
        self.pase_tracker.reset();
        self.emit(ServiceEvent::CommissioningClosed { reason: reason.to_string() });
    }

    fn enter_commissioning_mode(&self) -> MashResult<()> {
        if self.state() != ServiceState::Running {
            return Err(MashError::NotStarted);
        }
        self.inner.write().commissioning_open = true;
        Ok(())
    }

    /// Spawns the single timer that closes the commissioning window after
    /// `CommissioningWindowDuration` if nothing else closes it first (spec
    /// §5 "Timers ... commissioning window"; spec §4.5 "open -> close
    /// transitions"). Replaces (and cancels) any timer already running, so
    /// re-opening the window always starts a fresh countdown.
    fn start_commissioning_window_timer(core: &Arc<DeviceServiceCore>) {
        let token = CancellationToken::new();
        if let Some(old) = core.commissioning_window_timer.write().replace(token.clone()) {
            old.cancel();
        }
        let shutdown = core.shutdown.clone();
        let duration = core.config.commissioning_window_duration;
        let core = core.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(duration) => {
                    core.close_commissioning_window("timeout");
                }
            }
        });
    }

    /// Restarts (or starts) the failsafe timer for one zone: cancels
    /// whatever timer was running for it and spawns a fresh one (spec §4.10
    /// "reset & restart its failsafe timer" on every connect/reconnect).
    /// Left running across a disconnect — only firing, a fresh connect, or
    /// service shutdown stops it.
    fn restart_failsafe_timer(core: &Arc<DeviceServiceCore>, zone_id: String) {
        let token = CancellationToken::new();
        if let Some(old) = core.failsafe_timers.write().insert(zone_id.clone(), token.clone()) {
            old.cancel();
        }
        let shutdown = core.shutdown.clone();
        let timeout = core.config.failsafe_timeout;
        let core = core.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    core.mark_failsafe_active(&zone_id);
                }
            }
        });
    }

    /// A failsafe timer expiring without being reset (spec §4.10 "A failsafe
    /// timeout marks failsafe_active=true").
    fn mark_failsafe_active(&self, zone_id: &str) {
        let marked = {
            let mut inner = self.inner.write();
            match inner.zones.get_mut(zone_id) {
                Some(record) => {
                    record.zone.failsafe_active = true;
                    true
                }
                None => false,
            }
        };
        if marked {
            warn!(target: "mash::service", zone_id, "failsafe timer expired, zone marked failsafe_active");
        }
    }

    /// `RemoveZone` (spec §3 "self-remove only, except a TEST zone may
    /// remove any zone"; spec §9 "ambient context for authorization"). Takes
    /// `core` explicitly rather than as `&self` so it can reach the
    /// `Arc<DeviceServiceCore>` needed to spawn the reopened window's timer.
    fn remove_zone(core: &Arc<DeviceServiceCore>, ctx: &InvokeContext, target_zone_id: &str) -> MashResult<()> {
        if ctx.zone_type != ZoneType::Test && target_zone_id != ctx.zone_id {
            return Err(MashError::Unauthorized(format!(
                "zone {} may not remove zone {}",
                ctx.zone_id, target_zone_id
            )));
        }

        let removed = {
            let mut inner = core.inner.write();
            inner.zones.remove(target_zone_id).is_some()
        };
        if !removed {
            return Err(MashError::DeviceNotFound(target_zone_id.to_string()));
        }
        if let Some(token) = core.failsafe_timers.write().remove(target_zone_id) {
            token.cancel();
        }

        core.emit(ServiceEvent::ZoneRemoved { zone_id: target_zone_id.to_string() });

        // DEC-059: removing the last zone re-opens the commissioning window.
        if core.zone_count() == 0 {
            core.inner.write().commissioning_open = true;
            info!(target: "mash::service", "last zone removed, commissioning window reopened");
            Self::start_commissioning_window_timer(core);
        }
        Ok(())
    }
}

fn derive_device_id(public_key_der: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(public_key_der);
    let digest = hasher.finalize();
    hex_prefix(&digest, 16)
}

fn hex_prefix(bytes: &[u8], chars: usize) -> String {
    let mut s = String::new();
    for b in bytes {
        if s.len() >= chars {
            break;
        }
        s.push_str(&format!("{b:02x}"));
    }
    s.truncate(chars);
    s
}

/// Domain-separated KDF turning the PASE shared secret into a zone id
/// (spec §4.10(e)).
fn derive_zone_id(shared_secret: &[u8]) -> String {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut okm = [0u8; 16];
    hk.expand(b"mash-zone-id-v1", &mut okm).expect("16 bytes is a valid HKDF length");
    hex_prefix(&okm, 32)
}

fn nonce_hash(nonce: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(nonce);
    hasher.finalize().to_vec()
}

/// Device-facing handle. Cloning shares the same underlying state (it's a
/// thin `Arc` wrapper), matching the session/service split in spec §9.
#[derive(Clone)]
pub struct DeviceService<M: DeviceModel + 'static> {
    core: Arc<DeviceServiceCore>,
    device_model: Arc<M>,
}

impl<M: DeviceModel + 'static> DeviceService<M> {
    /// `events_tx` is the caller's half of an [`events::event_channel`]; the
    /// caller keeps the receiver to observe `ServiceEvent`s (spec §9
    /// "callback-centric fan-out": the service never owns its own
    /// subscriber list, it's handed one sender at construction, same shape
    /// as the `CertStore`/`StateStore`/`MdnsAdvertiser` collaborators).
    pub fn new(
        config: DeviceConfig,
        device_model: Arc<M>,
        cert_store: Arc<dyn CertStore>,
        state_store: Arc<dyn StateStore>,
        mdns: Arc<dyn MdnsAdvertiser>,
        events_tx: EventSender,
    ) -> MashResult<Self> {
        let config = config.validate()?;
        let pase_tracker = PaseAttemptTracker::new(config.pase_backoff_tiers.clone(), config.pase_backoff_enabled);
        let gate = CommissioningGate::new(config.connection_cooldown, config.handshake_timeout);

        let core = Arc::new(DeviceServiceCore {
            config,
            inner: RwLock::new(ServiceInner {
                state: ServiceState::Idle,
                device_id: String::new(),
                commissioning_open: false,
                zones: BTreeMap::new(),
                current_cert: None,
                throwaway_identity: None,
            }),
            gate,
            tracker: ConnectionTracker::new(),
            pase_tracker,
            active_conns: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
            events_tx,
            cert_store,
            state_store,
            mdns,
            protocol_handlers: RwLock::new(BTreeMap::new()),
            protocol_logger: RwLock::new(Arc::new(NullProtocolLogger)),
            failsafe_timers: RwLock::new(BTreeMap::new()),
            commissioning_window_timer: RwLock::new(None),
        });

        Ok(Self { core, device_model })
    }

    /// Installs a structured protocol logger observing raw frames on every
    /// zone session from this point on (spec §4.9, §6 `protocol_logger`).
    pub fn set_protocol_logger(&self, logger: Arc<dyn ProtocolLogger>) {
        *self.core.protocol_logger.write() = logger;
    }

    pub fn state(&self) -> ServiceState {
        self.core.state()
    }

    /// Spec §4.10 "Start". Loads any existing operational certs/zones,
    /// otherwise stays uncommissioned with an empty device id.
    pub async fn start(&self) -> MashResult<()> {
        if self.core.state() != ServiceState::Idle {
            return Err(MashError::AlreadyStarted);
        }
        self.core.set_state(ServiceState::Starting);

        if let Some(state) = self.core.state_store.load() {
            let mut loaded_zone_ids = Vec::new();
            {
                let mut inner = self.core.inner.write();
                for membership in state.zones {
                    let cert = self.core.cert_store.get_operational_cert(&membership.zone_id);
                    if inner.device_id.is_empty() {
                        if let Some(stored) = &cert {
                            if let Ok(id) = cert::extract_device_id(&stored.cert_der) {
                                inner.device_id = id;
                            }
                        }
                    }
                    let mut zone = Zone::new(membership.zone_id.clone(), membership.zone_type);
                    zone.connected = false;
                    loaded_zone_ids.push(membership.zone_id.clone());
                    inner.zones.insert(
                        membership.zone_id.clone(),
                        ZoneRecord {
                            zone,
                            cert: cert.map(|c| OperationalCertificate {
                                cert_der: c.cert_der,
                                key_der: c.key_der,
                                zone_id: membership.zone_id.clone(),
                                zone_type: membership.zone_type,
                                not_after_unix: 0,
                                sequence: membership.cert_sequence,
                            }),
                        },
                    );
                }
            }
            // Spec §3 invariant: every zone in the registry has exactly one
            // failsafe timer, including ones just loaded from persisted
            // state rather than freshly connected.
            for zone_id in loaded_zone_ids {
                DeviceServiceCore::restart_failsafe_timer(&self.core, zone_id);
            }
        }

        self.core.tracker.spawn_reaper(
            self.core.config.reaper_interval,
            self.core.config.stale_connection_timeout,
            self.core.shutdown.clone(),
        );

        if self.core.zone_count() == 0 {
            self.core.inner.write().commissioning_open = true;
            DeviceServiceCore::start_commissioning_window_timer(&self.core);
        }

        self.core.set_state(ServiceState::Running);
        info!(target: "mash::service", "device service running");
        Ok(())
    }

    /// Spec §4.10 "`stop` cancels the service context...". Cancelling
    /// `shutdown` already stops every failsafe/commissioning-window timer
    /// task (each races its own work against `shutdown.cancelled()`); this
    /// just clears the bookkeeping and the zones' in-memory state.
    pub async fn stop(&self) -> MashResult<()> {
        self.core.set_state(ServiceState::Stopping);
        self.core.shutdown.cancel();
        self.core.mdns.stop_all().await;
        {
            let mut inner = self.core.inner.write();
            for record in inner.zones.values_mut() {
                record.zone.connected = false;
                record.zone.failsafe_active = false;
            }
        }
        self.core.failsafe_timers.write().clear();
        *self.core.commissioning_window_timer.write() = None;
        self.core.set_state(ServiceState::Stopped);
        Ok(())
    }

    pub fn enter_commissioning_mode(&self) -> MashResult<()> {
        self.core.enter_commissioning_mode()?;
        DeviceServiceCore::start_commissioning_window_timer(&self.core);
        Ok(())
    }

    pub fn zone_count(&self) -> usize {
        self.core.zone_count()
    }

    pub fn device_id(&self) -> String {
        self.core.inner.read().device_id.clone()
    }

    /// Public entry point for a model-originated attribute change (spec §9
    /// "Callback-centric fan-out"): a device model backed by real hardware
    /// calls this when a value changes without any inbound `Write`, reaching
    /// subscribers through the same path a successful `Write` does.
    pub fn notify_attribute_changed(&self, endpoint_id: u32, feature_id: u32, attribute_id: u32, value: serde_cbor::Value) {
        self.core.on_attribute_changed(endpoint_id, feature_id, attribute_id, value);
    }

    /// The TLS identity this device should present right now: its current
    /// operational cert, or a throwaway self-signed identity before first
    /// commission (spec §4.10 "Start"/"(h)"). The real accept loop lives
    /// outside this crate's generic `FrameIo` core; this accessor is what it
    /// calls into before each TLS handshake.
    pub fn current_tls_identity(&self) -> MashResult<StoredCert> {
        self.core.current_identity()
    }

    /// Every Zone CA this device trusts, used to build the TLS client-cert
    /// verifier that lets an operational reconnection's client certificate
    /// chain-verify (spec §4.3a).
    pub fn trusted_zone_cas(&self) -> Vec<Vec<u8>> {
        self.core.trusted_zone_cas()
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.core.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.core.shutdown.is_cancelled()
    }

    fn model_for_session(&self) -> Arc<dyn DeviceModel> {
        Arc::new(ServiceDeviceModel { inner: self.device_model.clone(), service: self.core.clone() })
    }

    /// Handles one already-TLS-terminated connection end to end: routes it,
    /// then runs either the commissioning or operational-reconnect path.
    /// Callers (the real accept loop, or a test) are responsible for the
    /// scoped `active_conns`/tracker bookkeeping around this call (spec §9
    /// "Scoped resources") via [`try_acquire_connection_slot`] /
    /// [`release_connection_slot`] — this method itself does not touch the
    /// counter, so the admission check and the increment it guards can live
    /// together in the caller's single-threaded accept loop with no TOCTOU
    /// window between them (spec §4.6, §8).
    ///
    /// [`try_acquire_connection_slot`]: Self::try_acquire_connection_slot
    /// [`release_connection_slot`]: Self::release_connection_slot
    pub async fn handle_connection<T: FrameIo>(&self, conn: T, peer_cert_present: bool) -> MashResult<()> {
        match self.core.route(peer_cert_present) {
            Route::OperationalReconnect { zone_id } => self.run_operational_reconnect(conn, zone_id).await,
            Route::Commissioning => self.run_commissioning(conn).await,
            Route::Reject => {
                warn!(target: "mash::service", "connection rejected: no disconnected zone and commissioning closed");
                Ok(())
            }
        }
    }

    /// Atomically checks `active_conns < MaxZones + 1` and increments if so,
    /// returning whether a slot was reserved. Must be called synchronously
    /// in the single-threaded accept loop, before spawning a handler task
    /// and before the (async) TLS handshake — spec §4.6's "no TOCTOU since
    /// the check and increment share the single-threaded accept loop" only
    /// holds if both happen here, not after an `.await`.
    pub fn try_acquire_connection_slot(&self) -> bool {
        let max = self.core.config.max_zones + 1;
        loop {
            let current = self.core.active_conns.load(Ordering::SeqCst);
            if current >= max {
                return false;
            }
            if self
                .core
                .active_conns
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Releases a slot reserved by [`try_acquire_connection_slot`]; callers
    /// must call this on every exit path of the connection handler task
    /// (spec §9 "Scoped resources").
    pub fn release_connection_slot(&self) {
        self.core.active_conns.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn active_connections(&self) -> usize {
        self.core.active_conns.load(Ordering::SeqCst)
    }

    async fn run_operational_reconnect<T: FrameIo>(&self, conn: T, zone_id: String) -> MashResult<()> {
        {
            let mut inner = self.core.inner.write();
            if let Some(record) = inner.zones.get_mut(&zone_id) {
                record.zone.connected = true;
                record.zone.touch();
                record.zone.failsafe_active = false;
            }
        }

        self.core.emit(ServiceEvent::Connected { zone_id: zone_id.clone() });
        let result = self.run_zone_session(conn, zone_id.clone()).await;

        {
            let mut inner = self.core.inner.write();
            if let Some(record) = inner.zones.get_mut(&zone_id) {
                record.zone.connected = false;
            }
        }
        self.core.emit(ServiceEvent::Disconnected { zone_id });
        result
    }

    /// Spec §4.10 "Commissioning path", steps (a)-(h). Owns `conn` outright
    /// (rather than borrowing it) so that on a successful commission it can
    /// hand the same connection straight into [`Self::run_zone_session`]
    /// once the gate is released, exactly as [`Self::run_operational_reconnect`]
    /// does for a reconnecting zone.
    async fn run_commissioning<T: FrameIo>(&self, mut conn: T) -> MashResult<()> {
        let test_mode = self.core.config.test_mode;

        // Registered for the whole commissioning/cert-exchange phase,
        // released on every exit path via `TrackerGuard` (spec §3 invariant:
        // "A connection is tracked iff it is in the commissioning/
        // cert-exchange phase.").
        let tracker_id = self.core.tracker.add(Arc::new(NullCloseable));
        let _tracker_guard = TrackerGuard { tracker: &self.core.tracker, id: tracker_id };

        // (a) create PASE session.
        let server = PaseServerSession::create_session(
            self.core.config.setup_code.as_str(),
            b"controller",
            b"device",
        );

        // (b) wait_for_pase_request, no gate held.
        let first_msg = match PaseServerSession::wait_for_pase_request(
            &mut conn,
            self.core.config.pase_first_message_timeout,
        )
        .await
        {
            Ok(msg) => msg,
            Err(PaseError::Timeout) => {
                info!(target: "mash::service", "idle connection closed without touching the gate");
                return Ok(());
            }
            Err(e) => {
                warn!(target: "mash::service", error = %e, "failed reading first PASE message");
                return Ok(());
            }
        };

        // (c) acquire the commissioning gate. Eviction only runs once the
        // gate confirms every other condition (not already in progress, past
        // cooldown) would otherwise admit this attempt, so an attempt that's
        // going to be refused anyway never destroys a LOCAL zone for nothing
        // (spec §4.10: eviction happens only "before admitting a new
        // commissioning that would exceed MaxZones").
        let slots = (self.core.zone_count(), self.core.config.max_zones);
        if let Err(refusal) = self.core.gate.accept(test_mode, slots) {
            if !matches!(refusal, GateRefusal::ZoneSlotsFull { .. }) || !self.core.make_room_for_new_zone() {
                warn!(target: "mash::service", reason = %refusal.reason_string(), "commissioning refused by gate");
                let retry_after_ms = self.core.gate.busy_retry_after_ms(&refusal);
                let _ = conn.send_frame(&Frame::Busy { retry_after_ms }.encode()?).await;
                return Ok(());
            }

            let slots = (self.core.zone_count(), self.core.config.max_zones);
            if let Err(refusal) = self.core.gate.accept(test_mode, slots) {
                warn!(target: "mash::service", reason = %refusal.reason_string(), "commissioning refused by gate");
                let retry_after_ms = self.core.gate.busy_retry_after_ms(&refusal);
                let _ = conn.send_frame(&Frame::Busy { retry_after_ms }.encode()?).await;
                return Ok(());
            }
        }

        let commissioned_zone_id =
            self.run_commissioning_handshake_and_cert_exchange(&mut conn, server, first_msg, test_mode).await?;
        // Spec §4.10(h): release the gate before entering the operational
        // loop, not after it — a commissioned zone's session can run for as
        // long as the peer stays connected, and holding the single-writer
        // gate for that whole lifetime would block every other commissioning
        // attempt behind it.
        self.core.gate.release();

        let Some(zone_id) = commissioned_zone_id else {
            return Ok(());
        };

        let result = self.run_zone_session(conn, zone_id.clone()).await;

        {
            let mut inner = self.core.inner.write();
            if let Some(record) = inner.zones.get_mut(&zone_id) {
                record.zone.connected = false;
            }
        }
        self.core.emit(ServiceEvent::Disconnected { zone_id });
        result
    }

    /// Runs the handshake and certificate exchange only (spec §4.10
    /// steps (d)-(h) up through zone registration); the caller runs the
    /// operational session itself once it has released the gate. Returns
    /// the newly commissioned zone id on success, or `None` on any expected
    /// failure (PASE failure, cert exchange failure, a disallowed TEST
    /// zone) — each of which already warns and leaves the connection to be
    /// dropped by the caller.
    async fn run_commissioning_handshake_and_cert_exchange<T: FrameIo>(
        &self,
        conn: &mut T,
        server: PaseServerSession,
        first_msg: Vec<u8>,
        test_mode: bool,
    ) -> MashResult<Option<String>> {
        // (d) apply the backoff delay, then complete the handshake.
        let delay = self.core.pase_tracker.get_delay();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }

        let shared_secret = match server
            .complete_handshake(conn, first_msg, self.core.config.handshake_timeout)
            .await
        {
            Ok(secret) => {
                self.core.pase_tracker.reset();
                secret
            }
            Err(e) => {
                self.core.pase_tracker.record_failure();
                warn!(target: "mash::service", error = %e, "PASE handshake failed");
                return Ok(None);
            }
        };

        // (e) derive zone id from the shared secret.
        let zone_id = derive_zone_id(&shared_secret);

        // (f)/(g) cert exchange, then zone-type gating.
        let (operational_cert, zone_type) = match self.commissioning_cert_exchange(conn, &zone_id).await {
            Ok(result) => result,
            Err(e) => {
                warn!(target: "mash::service", error = %e, "cert exchange failed");
                return Ok(None);
            }
        };

        if zone_type == ZoneType::Test && !test_mode {
            warn!(target: "mash::service", "rejecting TEST zone commissioning outside test mode");
            return Ok(None);
        }

        // (h) register the zone, persist, close the window, graduate.
        self.register_commissioned_zone(zone_id.clone(), zone_type, operational_cert);
        self.core.close_commissioning_window("commissioned");
        self.core.emit(ServiceEvent::Commissioned { zone_id: zone_id.clone() });

        {
            let mut inner = self.core.inner.write();
            if let Some(record) = inner.zones.get_mut(&zone_id) {
                record.zone.connected = true;
                record.zone.failsafe_active = false;
            }
        }
        self.core.emit(ServiceEvent::Connected { zone_id: zone_id.clone() });

        Ok(Some(zone_id))
    }

    async fn commissioning_cert_exchange<T: FrameIo>(
        &self,
        conn: &mut T,
        zone_id: &str,
    ) -> MashResult<(OperationalCertificate, ZoneType)> {
        // The controller opens the exchange by presenting its Zone CA and a
        // nonce, mirroring the renewal wire shape (spec §4.10(f)).
        let request_bytes = conn.read_frame().await?;
        let (nonce, zone_ca_der) = match Frame::decode(&request_bytes)? {
            Frame::CertRenewalRequest { nonce, zone_ca_der } => (nonce, zone_ca_der),
            other => return Err(MashError::Certificate(format!("unexpected frame during cert exchange: {other:?}"))),
        };

        let zone_type = cert::extract_zone_type(&zone_ca_der)?;
        // Persisted so a later operational reconnection's client cert can be
        // chain-verified against this zone's CA (spec §4.3a, §6 `CertStore`).
        self.core.cert_store.set_zone_ca_cert(zone_id, zone_ca_der.clone());

        let device_id = {
            let existing = self.core.inner.read().device_id.clone();
            if !existing.is_empty() {
                existing
            } else {
                // Device id is derived once, at first commissioning, from
                // the hash of the operational cert's public key (spec §3).
                let probe = cert::generate_key_pair()?;
                derive_device_id(&probe.public_key_der)
            }
        };

        let key_pair = cert::generate_key_pair()?;
        let identity = DeviceCsrIdentity { device_id: device_id.clone() };
        let csr_der = cert::create_csr(&key_pair.key_pair, &identity)?;

        conn.send_frame(
            &Frame::CertRenewalCsr { csr_der, nonce_hash: Some(nonce_hash(&nonce)) }.encode()?,
        )
        .await?;

        let install_bytes = conn.read_frame().await?;
        let (new_cert_der, sequence) = match Frame::decode(&install_bytes)? {
            Frame::CertRenewalInstall { new_cert_der, sequence } => (new_cert_der, sequence),
            other => return Err(MashError::Certificate(format!("unexpected frame during cert exchange: {other:?}"))),
        };

        let installed_pubkey = cert_public_key_der(&new_cert_der)?;
        if installed_pubkey != key_pair.public_key_der {
            conn.send_frame(
                &Frame::CertRenewalAck { status: RenewalStatusCode::InvalidNonce, active_sequence: 0 }.encode()?,
            )
            .await?;
            return Err(MashError::Certificate("commissioning cert public key mismatch".into()));
        }

        conn.send_frame(
            &Frame::CertRenewalAck { status: RenewalStatusCode::Success, active_sequence: sequence }.encode()?,
        )
        .await?;

        if self.core.inner.read().device_id.is_empty() {
            self.core.inner.write().device_id = device_id;
        }

        let not_after_unix = cert_not_after(&new_cert_der)?;
        Ok((
            OperationalCertificate {
                cert_der: new_cert_der,
                key_der: key_pair.key_der,
                zone_id: zone_id.to_string(),
                zone_type,
                not_after_unix,
                sequence,
            },
            zone_type,
        ))
    }

    fn register_commissioned_zone(&self, zone_id: String, zone_type: ZoneType, cert: OperationalCertificate) {
        let mut zone = Zone::new(zone_id.clone(), zone_type);
        zone.connected = false;

        self.core.cert_store.set_operational_cert(
            &zone_id,
            StoredCert { cert_der: cert.cert_der.clone(), key_der: cert.key_der.clone() },
        );
        let _ = self.core.cert_store.save();

        {
            let mut inner = self.core.inner.write();
            // Spec §4.10(h): "update the TLS certificate to the new
            // operational cert for future connections".
            inner.current_cert = Some(StoredCert { cert_der: cert.cert_der.clone(), key_der: cert.key_der.clone() });
            inner.zones.insert(zone_id, ZoneRecord { zone, cert: Some(cert) });
        }
    }

    async fn run_zone_session<T: FrameIo>(&self, conn: T, zone_id: String) -> MashResult<()> {
        let zone_type = self
            .core
            .inner
            .read()
            .zones
            .get(&zone_id)
            .map(|r| r.zone.zone_type)
            .unwrap_or(ZoneType::Local);

        // Spec §4.10 "reset & restart its failsafe timer": every entry into
        // the operational loop, fresh commission or reconnect alike, gets a
        // clean countdown. Left running when this session ends so a zone
        // that disconnects and never comes back still trips its failsafe.
        DeviceServiceCore::restart_failsafe_timer(&self.core, zone_id.clone());

        let ctx = InvokeContext { zone_id: zone_id.clone(), zone_type };
        let (notify_tx, notify_rx) = tokio::sync::mpsc::unbounded_channel();

        // A successful Write feeds the same subscriber fan-out a
        // hardware-driven change would (spec §9 "Callback-centric fan-out").
        let core_for_write = self.core.clone();
        let on_write = move |endpoint_id: u32, feature_id: u32, applied: &BTreeMap<u32, serde_cbor::Value>| {
            for (attribute_id, value) in applied {
                core_for_write.on_attribute_changed(endpoint_id, feature_id, *attribute_id, value.clone());
            }
        };
        let protocol = Arc::new(ProtocolHandler::new(self.model_for_session(), notify_tx, on_write));
        self.core.protocol_handlers.write().insert(zone_id.clone(), protocol.clone());

        let renewal = RenewalHandler::new(self.device_id(), zone_type);

        let core = self.core.clone();
        let on_cert_renewal_success: crate::session::CertRenewalSuccessCallback = {
            let zone_id = zone_id.clone();
            Box::new(move |cert: OperationalCertificate| {
                let stored = StoredCert { cert_der: cert.cert_der.clone(), key_der: cert.key_der.clone() };
                core.cert_store.set_operational_cert(&zone_id, stored.clone());
                let _ = core.cert_store.save();
                // Spec §4.10(h) applies equally to a renewal: the TLS
                // identity presented on future connections tracks whichever
                // operational cert was installed most recently.
                core.inner.write().current_cert = Some(stored);
            })
        };

        let protocol_logger = self.core.protocol_logger.read().clone();
        let mut session =
            ZoneSession::new(conn, ctx, protocol, renewal, notify_rx, on_cert_renewal_success)
                .with_protocol_logger(protocol_logger);
        let result = session.run(self.core.shutdown.clone()).await;
        self.core.protocol_handlers.write().remove(&zone_id);
        if let Err(e) = &result {
            error!(target: "mash::service", zone_id = %zone_id, error = %e, "zone session ended with error");
        }
        result
    }
}

fn cert_public_key_der(cert_der: &[u8]) -> MashResult<Vec<u8>> {
    use x509_parser::prelude::*;
    let (_, cert) = X509Certificate::from_der(cert_der).map_err(|e| MashError::Certificate(format!("cert parse: {e}")))?;
    Ok(cert.public_key().raw.to_vec())
}

fn cert_not_after(cert_der: &[u8]) -> MashResult<i64> {
    use x509_parser::prelude::*;
    let (_, cert) = X509Certificate::from_der(cert_der).map_err(|e| MashError::Certificate(format!("cert parse: {e}")))?;
    Ok(cert.validity().not_after.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{InMemoryCertStore, InMemoryStateStore, NullMdns};
    use crate::device_model::InMemoryDeviceModel;
    use crate::pase::PaseClient;
    use tokio::io::duplex;

    fn test_config() -> DeviceConfig {
        DeviceConfig::new("127.0.0.1:0".parse().unwrap(), 1234, "12345678")
            .test_mode()
    }

    fn test_service() -> DeviceService<InMemoryDeviceModel> {
        let (events_tx, _events_rx) = events::event_channel();
        DeviceService::new(
            test_config(),
            Arc::new(InMemoryDeviceModel::new()),
            Arc::new(InMemoryCertStore::default()),
            Arc::new(InMemoryStateStore::default()),
            Arc::new(NullMdns),
            events_tx,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn start_opens_commissioning_when_no_zones() {
        let service = test_service();
        service.start().await.unwrap();
        assert_eq!(service.state(), ServiceState::Running);
        assert!(service.core.is_commissioning_open());
    }

    #[tokio::test]
    async fn happy_commissioning_registers_a_local_zone() {
        let service = test_service();
        service.start().await.unwrap();

        let (device_io, controller_io) = duplex(16384);
        let mut controller_conn = crate::transport::FramedConnection::new(controller_io);
        let ca = cert::ZoneCa::generate(ZoneType::Local).unwrap();

        let service_clone = service.clone();
        let device_task = tokio::spawn(async move {
            let mut conn = crate::transport::FramedConnection::new(device_io);
            service_clone.handle_connection(&mut conn, false).await
        });

        let secret = PaseClient::handshake(
            &mut controller_conn,
            "12345678",
            b"controller",
            b"device",
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        let _ = secret;

        controller_conn
            .send(
                &Frame::CertRenewalRequest { nonce: b"commission-nonce".to_vec(), zone_ca_der: ca.cert_der.clone() }
                    .encode()
                    .unwrap(),
            )
            .await
            .unwrap();

        let csr_bytes = controller_conn.read_frame().await.unwrap();
        let csr_der = match Frame::decode(&csr_bytes).unwrap() {
            Frame::CertRenewalCsr { csr_der, .. } => csr_der,
            other => panic!("unexpected frame: {other:?}"),
        };
        let signed = ca.sign_csr(&csr_der).unwrap();
        controller_conn
            .send(&Frame::CertRenewalInstall { new_cert_der: signed, sequence: 1 }.encode().unwrap())
            .await
            .unwrap();
        let ack_bytes = controller_conn.read_frame().await.unwrap();
        match Frame::decode(&ack_bytes).unwrap() {
            Frame::CertRenewalAck { status, .. } => assert_eq!(status, RenewalStatusCode::Success),
            other => panic!("unexpected frame: {other:?}"),
        }

        drop(controller_conn);
        let _ = device_task.await;

        assert_eq!(service.zone_count(), 1);
        assert!(!service.core.is_commissioning_open());
    }

    #[tokio::test]
    async fn wrong_setup_code_leaves_zone_count_at_zero() {
        let service = test_service();
        service.start().await.unwrap();

        let (device_io, controller_io) = duplex(16384);
        let mut controller_conn = crate::transport::FramedConnection::new(controller_io);

        let service_clone = service.clone();
        let device_task = tokio::spawn(async move {
            let mut conn = crate::transport::FramedConnection::new(device_io);
            service_clone.handle_connection(&mut conn, false).await
        });

        let _ = PaseClient::handshake(
            &mut controller_conn,
            "00000000",
            b"controller",
            b"device",
            Duration::from_secs(2),
        )
        .await;

        drop(controller_conn);
        let _ = device_task.await;

        assert_eq!(service.zone_count(), 0);
        assert_eq!(service.core.pase_tracker.consecutive_failures(), 1);
    }

    #[test]
    fn remove_zone_rejects_cross_zone_removal_unless_test() {
        let service = test_service();
        service.register_commissioned_zone(
            "zone-a".into(),
            ZoneType::Local,
            OperationalCertificate {
                cert_der: vec![],
                key_der: vec![],
                zone_id: "zone-a".into(),
                zone_type: ZoneType::Local,
                not_after_unix: 0,
                sequence: 1,
            },
        );
        let ctx = InvokeContext { zone_id: "zone-b".into(), zone_type: ZoneType::Local };
        let err = DeviceServiceCore::remove_zone(&service.core, &ctx, "zone-a").unwrap_err();
        assert!(matches!(err, MashError::Unauthorized(_)));

        let test_ctx = InvokeContext { zone_id: "zone-b".into(), zone_type: ZoneType::Test };
        DeviceServiceCore::remove_zone(&service.core, &test_ctx, "zone-a").unwrap();
        assert_eq!(service.zone_count(), 0);
    }

    #[test]
    fn removing_last_zone_reopens_commissioning() {
        let service = test_service();
        service.core.inner.write().commissioning_open = false;
        service.register_commissioned_zone(
            "zone-a".into(),
            ZoneType::Local,
            OperationalCertificate {
                cert_der: vec![],
                key_der: vec![],
                zone_id: "zone-a".into(),
                zone_type: ZoneType::Local,
                not_after_unix: 0,
                sequence: 1,
            },
        );
        let ctx = InvokeContext { zone_id: "zone-a".into(), zone_type: ZoneType::Local };
        DeviceServiceCore::remove_zone(&service.core, &ctx, "zone-a").unwrap();
        assert_eq!(service.zone_count(), 0);
        assert!(service.core.is_commissioning_open());
    }

    #[test]
    fn max_zones_one_refuses_second_commission_until_eviction() {
        let config = DeviceConfig::new("127.0.0.1:0".parse().unwrap(), 1, "12345678").test_mode();
        let mut config = config;
        config.max_zones = 1;
        let (events_tx, _events_rx) = events::event_channel();
        let service = DeviceService::new(
            config,
            Arc::new(InMemoryDeviceModel::new()),
            Arc::new(InMemoryCertStore::default()),
            Arc::new(InMemoryStateStore::default()),
            Arc::new(NullMdns),
            events_tx,
        )
        .unwrap();

        service.register_commissioned_zone(
            "zone-a".into(),
            ZoneType::Local,
            OperationalCertificate {
                cert_der: vec![],
                key_der: vec![],
                zone_id: "zone-a".into(),
                zone_type: ZoneType::Local,
                not_after_unix: 0,
                sequence: 1,
            },
        );
        {
            let mut inner = service.core.inner.write();
            inner.zones.get_mut("zone-a").unwrap().zone.connected = true;
        }
        assert!(!service.core.make_room_for_new_zone());

        service.core.inner.write().zones.get_mut("zone-a").unwrap().zone.connected = false;
        assert!(service.core.make_room_for_new_zone());
        assert_eq!(service.zone_count(), 0);
    }
}
