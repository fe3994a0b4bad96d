//! TLS transport: the real accept loop behind the generic `FrameIo` core
//! (spec §4.3a "Concrete TLS stack", §4.10 "Accept loop").
//!
//! Everything else in this crate is transport-agnostic so it can be driven
//! over an in-memory duplex in tests; this module is where that meets an
//! actual `rustls` server over TCP.

use std::sync::Arc;

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use rustls::server::danger::ClientCertVerifier;
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use time::{Duration as TimeDuration, OffsetDateTime};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

use crate::collaborators::StoredCert;
use crate::device_model::DeviceModel;
use crate::error::{MashError, MashResult};
use crate::service::DeviceService;
use crate::transport::FramedConnection;

/// ALPN protocol identifier a MASH peer negotiates (spec §4.3a).
pub const ALPN_PROTOCOL: &[u8] = b"mash/1";

/// Releases a reserved connection slot on drop, so every exit path out of a
/// spawned connection-handler task — including an early return on a failed
/// TLS handshake — lets the next accept back in (spec §9 "Scoped resources").
struct ConnectionSlotGuard<'a, M: DeviceModel + 'static>(&'a DeviceService<M>);

impl<M: DeviceModel + 'static> Drop for ConnectionSlotGuard<'_, M> {
    fn drop(&mut self) {
        self.0.release_connection_slot();
    }
}

/// A throwaway, self-signed identity presented before first commission
/// (spec §4.10 "(h)", §4.3a). Its CN embeds the discriminator so a
/// controller glancing at the cert during debugging can tell which
/// commissionable device it reached; nothing verifies it.
pub fn generate_throwaway_identity(discriminator: u16) -> MashResult<StoredCert> {
    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
        .map_err(|e| MashError::Certificate(format!("throwaway key generation failed: {e}")))?;

    let mut params = CertificateParams::new(Vec::<String>::new())
        .map_err(|e| MashError::Certificate(format!("throwaway params: {e}")))?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, format!("mash-uncommissioned-{discriminator}"));
    params.distinguished_name = dn;
    params.not_before = OffsetDateTime::now_utc() - TimeDuration::days(1);
    params.not_after = OffsetDateTime::now_utc() + TimeDuration::days(1);

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| MashError::Certificate(format!("throwaway self-sign: {e}")))?;

    Ok(StoredCert { cert_der: cert.der().to_vec(), key_der: key_pair.serialize_der() })
}

/// Builds the server-side TLS config for one accept: `identity` is
/// presented to every peer, and a client certificate is accepted (not
/// required) and chain-verified against `trusted_zone_cas` when present —
/// a commissioning attempt arrives with no client cert at all, while an
/// operational reconnection arrives with one issued by a Zone CA this
/// device already trusts (spec §4.3a, §4.10 "Routing decision").
pub fn build_server_config(identity: &StoredCert, trusted_zone_cas: &[Vec<u8>]) -> MashResult<rustls::ServerConfig> {
    let cert_chain = vec![rustls::pki_types::CertificateDer::from(identity.cert_der.clone())];
    let key_der = rustls::pki_types::PrivateKeyDer::try_from(identity.key_der.clone())
        .map_err(|e| MashError::Certificate(format!("private key DER: {e}")))?;

    let client_verifier: Arc<dyn ClientCertVerifier> = if trusted_zone_cas.is_empty() {
        // No zone commissioned yet: nothing to verify a client cert
        // against, so only the commissioning path (no client cert) can
        // succeed anyway. `allow_unauthenticated` lets that handshake
        // complete at all.
        let empty_roots = RootCertStore::empty();
        WebPkiClientVerifier::builder(Arc::new(empty_roots))
            .allow_unauthenticated()
            .build()
            .map_err(|e| MashError::Certificate(format!("client verifier: {e}")))?
    } else {
        let mut roots = RootCertStore::empty();
        for ca_der in trusted_zone_cas {
            roots
                .add(rustls::pki_types::CertificateDer::from(ca_der.clone()))
                .map_err(|e| MashError::Certificate(format!("zone CA root: {e}")))?;
        }
        WebPkiClientVerifier::builder(Arc::new(roots))
            .allow_unauthenticated()
            .build()
            .map_err(|e| MashError::Certificate(format!("client verifier: {e}")))?
    };

    let mut config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(cert_chain, key_der)
        .map_err(|e| MashError::Certificate(format!("server config: {e}")))?;
    config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];
    Ok(config)
}

/// Runs the real accept loop until `service` is shut down (spec §4.10
/// "Accept loop"): bind, and for each incoming TCP connection negotiate
/// TLS fresh against the device's current identity and trusted Zone CAs,
/// then hand the framed, TLS-terminated connection to
/// [`DeviceService::handle_connection`].
///
/// A fresh `ServerConfig` is built per accept rather than once up front,
/// because the device's identity and trusted CA set both change over the
/// device's lifetime (commissioning, renewal) and a `rustls::ServerConfig`
/// is immutable once built.
pub async fn serve<M: DeviceModel + 'static>(service: DeviceService<M>) -> MashResult<()> {
    let listener = TcpListener::bind(service.config().listen_address).await?;
    info!(target: "mash::tls", addr = %service.config().listen_address, "listening");

    loop {
        let shutdown = service.is_shutting_down();
        if shutdown {
            return Ok(());
        }

        let (stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(target: "mash::tls", error = %e, "accept failed");
                continue;
            }
        };

        // A transport-level cap independent of the zone registry: one slot
        // per possible zone plus one for an in-flight commissioning attempt
        // (spec §4.10 "at most MaxZones + 1 concurrent connections"). The
        // check and the increment happen together, synchronously, right
        // here in the single-threaded accept loop — before the TLS
        // handshake or anything else gets a chance to `.await` — so there
        // is no window for a burst of connections to all pass the check
        // before any of them is counted (spec §4.6).
        if !service.try_acquire_connection_slot() {
            warn!(target: "mash::tls", %peer_addr, "dropping connection: transport connection cap reached");
            drop(stream);
            continue;
        }

        let identity = match service.current_tls_identity() {
            Ok(identity) => identity,
            Err(e) => {
                error!(target: "mash::tls", error = %e, "no TLS identity available");
                service.release_connection_slot();
                continue;
            }
        };
        let trusted = service.trusted_zone_cas();
        let tls_config = match build_server_config(&identity, &trusted) {
            Ok(config) => config,
            Err(e) => {
                error!(target: "mash::tls", error = %e, "failed to build TLS server config");
                service.release_connection_slot();
                continue;
            }
        };
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));

        let service = service.clone();
        tokio::spawn(async move {
            // Releases the slot reserved above on every exit path out of
            // this task, including a failed TLS handshake (spec §9 "Scoped
            // resources": acquired before the handler task, released on
            // every exit path out of it).
            let _slot = ConnectionSlotGuard(&service);

            let tls_stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(target: "mash::tls", %peer_addr, error = %e, "TLS handshake failed");
                    return;
                }
            };
            let peer_cert_present =
                tls_stream.get_ref().1.peer_certificates().is_some_and(|certs| !certs.is_empty());

            let conn = FramedConnection::new(tls_stream);
            if let Err(e) = service.handle_connection(conn, peer_cert_present).await {
                warn!(target: "mash::tls", %peer_addr, error = %e, "connection ended with error");
            }
        });
    }
}
