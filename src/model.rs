//! Core data model (spec §3).

use std::time::Instant;

/// A zone's type, recovered from the issuing Zone CA's OU field (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ZoneType {
    Grid,
    Local,
    Test,
}

impl ZoneType {
    /// Static priority derived from zone type (spec §3: "priority derived
    /// from type"). Higher is more important; used only as a tie-breaker,
    /// never to starve lower-priority zones of service.
    pub fn priority(self) -> u8 {
        match self {
            ZoneType::Grid => 2,
            ZoneType::Local => 1,
            ZoneType::Test => 0,
        }
    }

    /// Parses the Zone CA's OU field into a zone type, defaulting to `Local`
    /// when the field is missing or unrecognized (spec §4.3
    /// `extract_zone_type`).
    pub fn from_ou(ou: Option<&str>) -> Self {
        match ou.map(str::to_ascii_uppercase).as_deref() {
            Some("GRID") => ZoneType::Grid,
            Some("TEST") => ZoneType::Test,
            _ => ZoneType::Local,
        }
    }

    pub fn as_ou_str(self) -> &'static str {
        match self {
            ZoneType::Grid => "GRID",
            ZoneType::Local => "LOCAL",
            ZoneType::Test => "TEST",
        }
    }
}

/// A zone: one controller's membership with this device (spec §3).
#[derive(Debug, Clone)]
pub struct Zone {
    pub id: String,
    pub zone_type: ZoneType,
    pub connected: bool,
    pub last_seen: Instant,
    pub failsafe_active: bool,
}

impl Zone {
    pub fn new(id: String, zone_type: ZoneType) -> Self {
        Self {
            id,
            zone_type,
            connected: false,
            last_seen: Instant::now(),
            failsafe_active: false,
        }
    }

    pub fn priority(&self) -> u8 {
        self.zone_type.priority()
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }
}

/// The device's per-zone operational certificate (spec §3).
#[derive(Debug, Clone)]
pub struct OperationalCertificate {
    /// DER-encoded X.509 certificate.
    pub cert_der: Vec<u8>,
    /// DER-encoded PKCS#8 private key.
    pub key_der: Vec<u8>,
    pub zone_id: String,
    pub zone_type: ZoneType,
    /// PEM-less validity horizon; re-derived from the parsed cert when
    /// needed, cached here to make `needs_renewal` cheap.
    pub not_after_unix: i64,
    pub sequence: u64,
}

/// Holds at most one pending renewal key pair (spec §3, §4.7).
#[derive(Debug, Clone)]
pub struct PendingRenewal {
    pub pending_key_der: Vec<u8>,
    pub pending_public_key: Vec<u8>,
    pub renewal_nonce: Vec<u8>,
}

/// An inbound subscription to attribute-change notifications (spec §3).
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: u64,
    pub endpoint_id: u32,
    pub feature_id: u32,
    /// Empty means "all attributes on this (endpoint, feature)".
    pub attribute_ids: Vec<u32>,
    pub min_interval: std::time::Duration,
    pub max_interval: std::time::Duration,
}

impl Subscription {
    /// Whether this subscription matches a notification coordinate. An
    /// empty `attribute_ids` is a wildcard over all attributes on the
    /// (endpoint, feature) pair (spec §4.8 "notify_attribute_change").
    pub fn matches(&self, endpoint_id: u32, feature_id: u32, attribute_id: u32) -> bool {
        self.endpoint_id == endpoint_id
            && self.feature_id == feature_id
            && (self.attribute_ids.is_empty() || self.attribute_ids.contains(&attribute_id))
    }
}
