//! Device-side certificate renewal state machine (spec §4.7).
//!
//! Pending renewal state holds at most one in-flight key pair: a second
//! request overwrites the first outright (spec §3 "a second renewal request
//! replaces it"). Install is only accepted while Pending, and only if the
//! installed certificate's public key matches the pending key pair's —
//! otherwise the controller is replaying a CSR signed against a stale nonce
//! session, which must surface as `InvalidNonce`, not a generic failure.

use sha2::{Digest, Sha256};

use crate::cert::{self, DeviceCsrIdentity, GeneratedKeyPair};
use crate::model::{OperationalCertificate, PendingRenewal, ZoneType};

/// Outcome of `handle_cert_install` (spec §4.8 status codes 0-4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalStatus {
    Success,
    CsrFailed,
    InstallFailed,
    InvalidCert,
    InvalidNonce,
}

/// A freshly minted CSR plus the nonce hash the controller expects to see
/// echoed back in the eventual install, per `handle_renewal_request`.
pub struct RenewalCsr {
    pub csr_der: Vec<u8>,
    pub nonce_hash: Vec<u8>,
}

enum RenewalState {
    Idle,
    Pending { key_pair: GeneratedKeyPair, nonce_hash: Vec<u8> },
}

/// Owns the renewal state for a single zone. One instance per zone, created
/// alongside the zone's operational certificate (spec §4.7).
pub struct RenewalHandler {
    device_id: String,
    zone_type: ZoneType,
    state: RenewalState,
}

fn nonce_hash(nonce: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(nonce);
    hasher.finalize().to_vec()
}

impl RenewalHandler {
    pub fn new(device_id: impl Into<String>, zone_type: ZoneType) -> Self {
        Self { device_id: device_id.into(), zone_type, state: RenewalState::Idle }
    }

    /// Generates a fresh key pair, overwrites any prior pending renewal, and
    /// returns a CSR for it (spec §4.7 `handle_renewal_request`). The
    /// previous pending key pair, if any, is simply dropped — it was never
    /// installed and there is nothing to clean up.
    pub fn handle_renewal_request(&mut self, nonce: &[u8]) -> crate::error::MashResult<RenewalCsr> {
        let key_pair = cert::generate_key_pair()?;
        let csr_der = cert::create_csr(&key_pair.key_pair, &DeviceCsrIdentity {
            device_id: self.device_id.clone(),
        })?;
        let hash = nonce_hash(nonce);

        self.state = RenewalState::Pending { key_pair, nonce_hash: hash.clone() };
        Ok(RenewalCsr { csr_der, nonce_hash: hash })
    }

    /// Validates and installs a signed certificate (spec §4.7
    /// `handle_cert_install`). Only valid while `Pending`; an install with no
    /// pending renewal in flight is `InstallFailed`.
    pub fn handle_cert_install(
        &mut self,
        new_cert_der: &[u8],
        zone_id: &str,
        sequence: u64,
    ) -> (RenewalStatus, Option<OperationalCertificate>) {
        let (key_pair, _hash) = match &self.state {
            RenewalState::Pending { key_pair, nonce_hash } => (key_pair, nonce_hash),
            RenewalState::Idle => return (RenewalStatus::InstallFailed, None),
        };

        let installed_pubkey = match cert_public_key_der(new_cert_der) {
            Ok(pk) => pk,
            Err(_) => return (RenewalStatus::InvalidCert, None),
        };

        if installed_pubkey != key_pair.public_key_der {
            return (RenewalStatus::InvalidNonce, None);
        }

        let not_after_unix = match cert_not_after(new_cert_der) {
            Ok(ts) => ts,
            Err(_) => return (RenewalStatus::InvalidCert, None),
        };

        let installed = OperationalCertificate {
            cert_der: new_cert_der.to_vec(),
            key_der: key_pair.key_der.clone(),
            zone_id: zone_id.to_string(),
            zone_type: self.zone_type,
            not_after_unix,
            sequence,
        };

        self.state = RenewalState::Idle;
        (RenewalStatus::Success, Some(installed))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, RenewalState::Pending { .. })
    }
}

fn cert_public_key_der(cert_der: &[u8]) -> crate::error::MashResult<Vec<u8>> {
    use x509_parser::prelude::*;
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| crate::error::MashError::Certificate(format!("cert parse: {e}")))?;
    Ok(cert.public_key().raw.to_vec())
}

fn cert_not_after(cert_der: &[u8]) -> crate::error::MashResult<i64> {
    use x509_parser::prelude::*;
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| crate::error::MashError::Certificate(format!("cert parse: {e}")))?;
    Ok(cert.validity().not_after.timestamp())
}

/// Snapshot used by tests and the zone session to carry a pending renewal
/// across an async boundary without borrowing the handler.
impl From<&RenewalHandler> for Option<PendingRenewal> {
    fn from(handler: &RenewalHandler) -> Self {
        match &handler.state {
            RenewalState::Pending { key_pair, nonce_hash } => Some(PendingRenewal {
                pending_key_der: key_pair.key_der.clone(),
                pending_public_key: key_pair.public_key_der.clone(),
                renewal_nonce: nonce_hash.clone(),
            }),
            RenewalState::Idle => None,
        }
    }
}
