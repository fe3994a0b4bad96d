//! Certificate helpers (spec §4.3): key generation, CSR creation, Zone CA
//! signing/verification, and identity extraction from X.509 certificates.

use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, Ia5String,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType, PKCS_ECDSA_P256_SHA256,
};
use time::{Duration as TimeDuration, OffsetDateTime};
use x509_parser::prelude::*;

use crate::error::{MashError, MashResult};
use crate::model::ZoneType;

/// Operational certificates are valid for 365 days from issuance (spec §4.3).
pub const OPERATIONAL_VALIDITY_DAYS: i64 = 365;

/// A certificate is considered due for renewal inside this window of its
/// expiry, or if it is absent entirely (spec §4.3 `needs_renewal`).
pub const RENEWAL_WINDOW_DAYS: i64 = 30;

/// Identity embedded in a CSR's CN (spec §4.3 `create_csr`).
#[derive(Debug, Clone)]
pub struct DeviceCsrIdentity {
    pub device_id: String,
}

/// A freshly generated ECDSA P-256 key pair plus its DER encoding, used both
/// at commissioning time and on every renewal (spec §4.7: "Fresh key pair
/// generation on every request is mandatory").
pub struct GeneratedKeyPair {
    pub key_pair: KeyPair,
    pub key_der: Vec<u8>,
    pub public_key_der: Vec<u8>,
}

/// Generates a fresh ECDSA key pair (spec §4.3 `generate_key_pair`).
pub fn generate_key_pair() -> MashResult<GeneratedKeyPair> {
    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
        .map_err(|e| MashError::Certificate(format!("key generation failed: {e}")))?;
    let key_der = key_pair.serialize_der();
    let public_key_der = key_pair.public_key_der();
    Ok(GeneratedKeyPair { key_pair, key_der, public_key_der })
}

/// Builds a PKCS#10 CSR with `CN = identity.device_id` (spec §4.3
/// `create_csr`). Returns the DER-encoded CSR.
pub fn create_csr(key_pair: &KeyPair, identity: &DeviceCsrIdentity) -> MashResult<Vec<u8>> {
    let mut params = CertificateParams::new(Vec::<String>::new())
        .map_err(|e| MashError::Certificate(format!("csr params: {e}")))?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, identity.device_id.clone());
    params.distinguished_name = dn;
    params.subject_alt_names = vec![SanType::Rfc822Name(
        Ia5String::try_from(format!("{}@device.mash", identity.device_id))
            .unwrap_or_else(|_| Ia5String::try_from("device@mash").unwrap()),
    )];

    let csr = params
        .serialize_request(key_pair)
        .map_err(|e| MashError::Certificate(format!("csr serialize: {e}")))?;
    Ok(csr.der().to_vec())
}

/// A loaded Zone CA: its signing key pair, DER certificate, and zone type
/// (recovered from its OU field at load time, per spec §4.3
/// `extract_zone_type`).
pub struct ZoneCa {
    pub key_pair: KeyPair,
    pub cert_der: Vec<u8>,
    pub zone_type: ZoneType,
}

impl ZoneCa {
    /// Builds a self-signed Zone CA (used by tests standing in for the
    /// controller side, which owns the real Zone CA in production).
    pub fn generate(zone_type: ZoneType) -> MashResult<Self> {
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| MashError::Certificate(format!("ca key generation failed: {e}")))?;

        let mut params = CertificateParams::new(Vec::<String>::new())
            .map_err(|e| MashError::Certificate(format!("ca params: {e}")))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "MASH Zone CA");
        dn.push(DnType::OrganizationalUnitName, zone_type.as_ou_str());
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.not_before = OffsetDateTime::now_utc() - TimeDuration::days(1);
        params.not_after = OffsetDateTime::now_utc() + TimeDuration::days(3650);

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| MashError::Certificate(format!("ca self-sign: {e}")))?;

        Ok(Self { key_pair, cert_der: cert.der().to_vec(), zone_type })
    }

    pub fn from_parts(key_pair: KeyPair, cert_der: Vec<u8>) -> MashResult<Self> {
        let zone_type = extract_zone_type(&cert_der)?;
        Ok(Self { key_pair, cert_der, zone_type })
    }

    /// Signs a device's CSR, producing an operational certificate whose
    /// issuer is this Zone CA. Validity is 365 days (spec §4.3 `sign_csr`).
    pub fn sign_csr(&self, csr_der: &[u8]) -> MashResult<Vec<u8>> {
        let csr_params = rcgen::CertificateSigningRequestParams::from_der(
            &rcgen::CertificateSigningRequestDer::from(csr_der.to_vec()),
        )
        .map_err(|e| MashError::Certificate(format!("csr parse: {e}")))?;

        let mut issuer_params = CertificateParams::new(Vec::<String>::new())
            .map_err(|e| MashError::Certificate(format!("issuer params: {e}")))?;
        let mut issuer_dn = DistinguishedName::new();
        issuer_dn.push(DnType::CommonName, "MASH Zone CA");
        issuer_dn.push(DnType::OrganizationalUnitName, self.zone_type.as_ou_str());
        issuer_params.distinguished_name = issuer_dn;
        let issuer = Issuer::new(issuer_params, self.key_pair.clone());

        let mut params = csr_params.params;
        params.not_before = OffsetDateTime::now_utc() - TimeDuration::hours(1);
        params.not_after = OffsetDateTime::now_utc() + TimeDuration::days(OPERATIONAL_VALIDITY_DAYS);
        params.is_ca = IsCa::NoCa;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth, ExtendedKeyUsagePurpose::ServerAuth];

        let signed = params
            .signed_by(&csr_params.public_key, &issuer)
            .map_err(|e| MashError::Certificate(format!("csr sign: {e}")))?;
        Ok(signed.der().to_vec())
    }
}

/// Verifies that `cert_der` chains to `zone_ca` (spec §4.3
/// `verify_operational`). Checks issuer/subject linkage and validity window;
/// signature verification is delegated to the TLS stack at connection time,
/// this is the out-of-band check used right after the cert-exchange.
pub fn verify_operational(cert_der: &[u8], zone_ca: &ZoneCa) -> MashResult<()> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| MashError::Certificate(format!("cert parse: {e}")))?;
    let (_, ca_cert) = X509Certificate::from_der(&zone_ca.cert_der)
        .map_err(|e| MashError::Certificate(format!("ca cert parse: {e}")))?;

    if cert.issuer() != ca_cert.subject() {
        return Err(MashError::Certificate("issuer does not match Zone CA subject".into()));
    }
    if !cert.validity().is_valid() {
        return Err(MashError::Certificate("certificate is outside its validity window".into()));
    }
    cert.verify_signature(Some(ca_cert.public_key()))
        .map_err(|e| MashError::Certificate(format!("signature verification failed: {e}")))?;
    Ok(())
}

/// Extracts the device id from a certificate's CN (spec §4.3
/// `extract_device_id`).
pub fn extract_device_id(cert_der: &[u8]) -> MashResult<String> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| MashError::Certificate(format!("cert parse: {e}")))?;
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
        .ok_or_else(|| MashError::Certificate("certificate has no CN".into()))
}

/// Extracts the zone type from a Zone CA certificate's OU, defaulting to
/// `Local` (spec §4.3 `extract_zone_type`).
pub fn extract_zone_type(ca_cert_der: &[u8]) -> MashResult<ZoneType> {
    let (_, cert) = X509Certificate::from_der(ca_cert_der)
        .map_err(|e| MashError::Certificate(format!("ca cert parse: {e}")))?;
    let ou = cert
        .subject()
        .iter_organizational_unit()
        .next()
        .and_then(|ou| ou.as_str().ok());
    Ok(ZoneType::from_ou(ou))
}

/// True when `not_after_unix` is within [`RENEWAL_WINDOW_DAYS`] of now, or
/// absent entirely (spec §4.3 `needs_renewal`).
pub fn needs_renewal(not_after_unix: Option<i64>) -> bool {
    match not_after_unix {
        None => true,
        Some(not_after) => {
            let now = OffsetDateTime::now_utc().unix_timestamp();
            let window_secs = RENEWAL_WINDOW_DAYS * 24 * 60 * 60;
            not_after - now <= window_secs
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_pair_has_matching_public_key() {
        let kp = generate_key_pair().unwrap();
        assert!(!kp.key_der.is_empty());
        assert!(!kp.public_key_der.is_empty());
    }

    #[test]
    fn csr_embeds_device_id_in_cn() {
        let kp = generate_key_pair().unwrap();
        let csr_der = create_csr(&kp.key_pair, &DeviceCsrIdentity { device_id: "dev-123".into() }).unwrap();
        assert!(!csr_der.is_empty());
    }

    #[test]
    fn zone_ca_signs_and_verifies_operational_cert() {
        let ca = ZoneCa::generate(ZoneType::Local).unwrap();
        let device_kp = generate_key_pair().unwrap();
        let csr = create_csr(&device_kp.key_pair, &DeviceCsrIdentity { device_id: "dev-abc".into() }).unwrap();
        let cert_der = ca.sign_csr(&csr).unwrap();

        verify_operational(&cert_der, &ca).unwrap();
        assert_eq!(extract_device_id(&cert_der).unwrap(), "dev-abc");
    }

    #[test]
    fn extract_zone_type_defaults_to_local_when_ou_missing() {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "no-ou-ca");
        params.distinguished_name = dn;
        let kp = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
        let cert = params.self_signed(&kp).unwrap();
        assert_eq!(extract_zone_type(&cert.der().to_vec()).unwrap(), ZoneType::Local);
    }

    #[test]
    fn needs_renewal_true_when_absent_or_near_expiry() {
        assert!(needs_renewal(None));
        let soon = OffsetDateTime::now_utc().unix_timestamp() + 10 * 24 * 60 * 60;
        assert!(needs_renewal(Some(soon)));
        let far = OffsetDateTime::now_utc().unix_timestamp() + 200 * 24 * 60 * 60;
        assert!(!needs_renewal(Some(far)));
    }
}
