//! Wire message and payload types (spec §6 "Application messages").
//!
//! Frames are CBOR-encoded, map-typed, and carried over [`crate::transport`].
//! Payloads are a discriminated union keyed by [`Operation`] rather than a
//! dynamically-typed blob, so decoding is a match on the operation tag
//! followed by a single typed decode (spec §9 "Tagged variants over dynamic
//! payloads").

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_cbor::Value as CborValue;

/// The four dispatchable operations (spec §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Read,
    Write,
    Subscribe,
    Invoke,
}

/// Operational status codes (spec §6 "Status codes (operational)").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    Success,
    InvalidEndpoint,
    InvalidFeature,
    InvalidAttribute,
    InvalidCommand,
    InvalidParameter,
    ReadOnly,
    ConstraintError,
    Unsupported,
    Busy,
}

/// Certificate-renewal status codes (spec §6, numbered 0-4 on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RenewalStatusCode {
    Success = 0,
    CsrFailed = 1,
    InstallFailed = 2,
    InvalidCert = 3,
    InvalidNonce = 4,
}

impl From<crate::renewal::RenewalStatus> for RenewalStatusCode {
    fn from(status: crate::renewal::RenewalStatus) -> Self {
        use crate::renewal::RenewalStatus as R;
        match status {
            R::Success => RenewalStatusCode::Success,
            R::CsrFailed => RenewalStatusCode::CsrFailed,
            R::InstallFailed => RenewalStatusCode::InstallFailed,
            R::InvalidCert => RenewalStatusCode::InvalidCert,
            R::InvalidNonce => RenewalStatusCode::InvalidNonce,
        }
    }
}

/// Discriminated union of request payloads, one variant per [`Operation`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RequestPayload {
    Read(ReadPayload),
    Write(WritePayload),
    Subscribe(SubscribePayload),
    Unsubscribe(UnsubscribePayload),
    Invoke(InvokePayload),
}

/// Empty `attribute_ids` requests every readable attribute on the feature.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadPayload {
    pub attribute_ids: Vec<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WritePayload {
    pub attributes: BTreeMap<u32, CborValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribePayload {
    pub attribute_ids: Vec<u32>,
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
}

/// Sent with `feature_id == 0` at the request level (spec §4.8
/// "featureId==0 means Unsubscribe").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsubscribePayload {
    pub subscription_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokePayload {
    pub command_id: u32,
    pub params: CborValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Discriminated union of response payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponsePayload {
    Read { values: BTreeMap<u32, CborValue> },
    Write { values: BTreeMap<u32, CborValue> },
    Subscribe { subscription_id: u64, current_values: BTreeMap<u32, CborValue> },
    Unsubscribe,
    Invoke { value: Option<CborValue> },
    Error(ErrorPayload),
    Empty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub message_id: u64,
    pub operation: Operation,
    pub endpoint_id: u32,
    pub feature_id: u32,
    pub payload: RequestPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub message_id: u64,
    pub status: StatusCode,
    pub payload: ResponsePayload,
}

impl Response {
    pub fn error(message_id: u64, status: StatusCode, message: impl Into<String>) -> Self {
        Self { message_id, status, payload: ResponsePayload::Error(ErrorPayload { message: message.into() }) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub subscription_id: u64,
    pub endpoint_id: u32,
    pub feature_id: u32,
    pub changes: BTreeMap<u32, CborValue>,
}

/// Top-level frame envelope. Commissioning frames (PASE, cert renewal) and
/// the operational Request/Response/Notification triad share one transport
/// (spec §6); `PaseRequest`/`PaseResponse` payloads are opaque to this crate
/// and carried as raw bytes produced by [`crate::pase`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    Request(Request),
    Response(Response),
    Notification(Notification),
    PaseRequest(Vec<u8>),
    PaseResponse(Vec<u8>),
    CertRenewalRequest { nonce: Vec<u8>, zone_ca_der: Vec<u8> },
    CertRenewalCsr { csr_der: Vec<u8>, nonce_hash: Option<Vec<u8>> },
    CertRenewalInstall { new_cert_der: Vec<u8>, sequence: u64 },
    CertRenewalAck { status: RenewalStatusCode, active_sequence: u64 },
    /// Sent in place of a `Response` when a commissioning attempt is
    /// refused by the gate (spec §7 "the device sends a BUSY error frame
    /// with a retry-after hint before closing").
    Busy { retry_after_ms: u64 },
}

impl Frame {
    pub fn encode(&self) -> crate::error::MashResult<Vec<u8>> {
        serde_cbor::to_vec(self).map_err(|e| crate::error::MashError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> crate::error::MashResult<Self> {
        serde_cbor::from_slice(bytes).map_err(|e| crate::error::MashError::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips_through_cbor() {
        let frame = Frame::Request(Request {
            message_id: 7,
            operation: Operation::Read,
            endpoint_id: 1,
            feature_id: 2,
            payload: RequestPayload::Read(ReadPayload { attribute_ids: vec![5, 6] }),
        });
        let encoded = frame.encode().unwrap();
        let decoded = Frame::decode(&encoded).unwrap();
        match decoded {
            Frame::Request(r) => {
                assert_eq!(r.message_id, 7);
                assert_eq!(r.endpoint_id, 1);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn busy_frame_round_trips() {
        let frame = Frame::Busy { retry_after_ms: 5000 };
        let encoded = frame.encode().unwrap();
        let decoded = Frame::decode(&encoded).unwrap();
        assert!(matches!(decoded, Frame::Busy { retry_after_ms: 5000 }));
    }
}
