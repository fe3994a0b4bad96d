//! Password-authenticated session establishment (spec §4.2).
//!
//! Wraps a SPAKE2 exchange (the `spake2` crate's Ed25519-group
//! implementation) keyed by the 8-digit setup code. The wire messages are
//! opaque byte blobs as far as the rest of the crate is concerned — §6
//! explicitly treats `PASERequest`/`PASEResponse` payloads as opaque.

use std::time::Duration;

use sha2::{Digest, Sha256};
use spake2::{Ed25519Group, Identity, Password, Spake2};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{MashError, MashResult};
use crate::transport::FrameIo;

/// A SPAKE2 finish only proves the two sides *ran the same protocol* — if
/// the passwords differ the derived secrets simply differ silently, they
/// don't make `finish` return an error. Key confirmation (exchanging a tag
/// derived from the secret and comparing) is what actually detects a wrong
/// setup code, so both sides run it as a second round-trip before trusting
/// the secret.
fn confirm_tag(secret: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(secret);
    hasher.update(b"mash-pase-confirm-v1");
    hasher.finalize().to_vec()
}

/// Errors specific to the PASE exchange, all of which are folded into
/// [`MashError::PaseFailed`] at the call site (spec §7: "PASE/cert-exchange
/// failures close the connection ... they never propagate further").
#[derive(Debug, thiserror::Error)]
pub enum PaseError {
    #[error("timed out waiting for the first PASE message")]
    Timeout,
    #[error("PASE handshake timed out")]
    HandshakeTimeout,
    #[error("setup code mismatch")]
    WrongSetupCode,
    #[error("malformed PASE message: {0}")]
    Malformed(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<PaseError> for MashError {
    fn from(err: PaseError) -> Self {
        MashError::PaseFailed(err.to_string())
    }
}

impl From<MashError> for PaseError {
    fn from(err: MashError) -> Self {
        PaseError::Transport(err.to_string())
    }
}

fn spake_state(setup_code: &str, our_identity: &[u8], their_identity: &[u8]) -> (Spake2<Ed25519Group>, Vec<u8>) {
    Spake2::<Ed25519Group>::start_symmetric(
        &Password::new(setup_code.as_bytes()),
        &Identity::new(&[our_identity, their_identity].concat()),
    )
}

/// Server (device) side of the PASE exchange.
pub struct PaseServerSession {
    state: Spake2<Ed25519Group>,
    outbound: Vec<u8>,
}

impl PaseServerSession {
    /// Derives the verifier from the setup code and identities. Cheap and
    /// side-effect free; does not touch the wire.
    pub fn create_session(setup_code: &str, client_identity: &[u8], server_identity: &[u8]) -> Self {
        let (state, outbound) = spake_state(setup_code, server_identity, client_identity);
        Self { state, outbound }
    }

    /// Reads the first PASE message with an independent short timeout. Per
    /// spec §4.6, this is called *before* the commissioning gate is
    /// acquired, so an idle connection never blocks commissioning.
    pub async fn wait_for_pase_request<T: FrameIo + ?Sized>(
        conn: &mut T,
        first_message_timeout: Duration,
    ) -> Result<Vec<u8>, PaseError> {
        match timeout(first_message_timeout, conn.read_frame()).await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(e)) => Err(PaseError::Transport(e.to_string())),
            Err(_) => Err(PaseError::Timeout),
        }
    }

    /// Completes the protocol: sends the server's SPAKE2 message, derives
    /// the shared secret, then runs a key-confirmation round-trip so a wrong
    /// setup code is detected here rather than silently producing divergent
    /// keys. Returns the shared secret.
    pub async fn complete_handshake<T: FrameIo + ?Sized>(
        self,
        conn: &mut T,
        first_msg: Vec<u8>,
        handshake_timeout: Duration,
    ) -> Result<Vec<u8>, PaseError> {
        timeout(handshake_timeout, conn.send_frame(&self.outbound))
            .await
            .map_err(|_| PaseError::HandshakeTimeout)?
            .map_err(|e| PaseError::Transport(e.to_string()))?;

        let secret = self
            .state
            .finish(&first_msg)
            .map_err(|e| PaseError::Malformed(e.to_string()))?;

        let local_tag = confirm_tag(&secret);
        let peer_tag = timeout(handshake_timeout, conn.read_frame())
            .await
            .map_err(|_| PaseError::HandshakeTimeout)?
            .map_err(|e| PaseError::Transport(e.to_string()))?;
        timeout(handshake_timeout, conn.send_frame(&local_tag))
            .await
            .map_err(|_| PaseError::HandshakeTimeout)?
            .map_err(|e| PaseError::Transport(e.to_string()))?;

        if peer_tag != local_tag {
            return Err(PaseError::WrongSetupCode);
        }

        Ok(secret)
    }
}

/// Client (controller) side, included so integration tests can drive a
/// realistic counterparty without depending on a separate controller crate.
pub struct PaseClient;

impl PaseClient {
    pub async fn handshake<T: FrameIo + ?Sized>(
        conn: &mut T,
        setup_code: &str,
        client_identity: &[u8],
        server_identity: &[u8],
        handshake_timeout: Duration,
    ) -> Result<Vec<u8>, PaseError> {
        let (state, outbound) = spake_state(setup_code, client_identity, server_identity);

        timeout(handshake_timeout, conn.send_frame(&outbound))
            .await
            .map_err(|_| PaseError::HandshakeTimeout)?
            .map_err(|e| PaseError::Transport(e.to_string()))?;

        let inbound = timeout(handshake_timeout, conn.read_frame())
            .await
            .map_err(|_| PaseError::HandshakeTimeout)?
            .map_err(|e| PaseError::Transport(e.to_string()))?;

        let secret = state
            .finish(&inbound)
            .map_err(|e| PaseError::Malformed(e.to_string()))?;

        let local_tag = confirm_tag(&secret);
        timeout(handshake_timeout, conn.send_frame(&local_tag))
            .await
            .map_err(|_| PaseError::HandshakeTimeout)?
            .map_err(|e| PaseError::Transport(e.to_string()))?;
        let peer_tag = timeout(handshake_timeout, conn.read_frame())
            .await
            .map_err(|_| PaseError::HandshakeTimeout)?
            .map_err(|e| PaseError::Transport(e.to_string()))?;

        if peer_tag != local_tag {
            warn!(target: "mash::pase", "PASE key confirmation mismatch");
            return Err(PaseError::WrongSetupCode);
        }

        debug!(target: "mash::pase", "PASE handshake complete");
        Ok(secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::FramedConnection;
    use tokio::io::duplex;

    #[tokio::test]
    async fn matching_setup_codes_derive_equal_secrets() {
        let (client_io, server_io) = duplex(4096);
        let mut client_conn = FramedConnection::new(client_io);
        let mut server_conn = FramedConnection::new(server_io);

        let server = PaseServerSession::create_session("12345678", b"client", b"server");

        let client_task = tokio::spawn(async move {
            PaseClient::handshake(
                &mut client_conn,
                "12345678",
                b"client",
                b"server",
                Duration::from_secs(2),
            )
            .await
        });

        let first = PaseServerSession::wait_for_pase_request(&mut server_conn, Duration::from_secs(2))
            .await
            .unwrap();
        let server_secret = server
            .complete_handshake(&mut server_conn, first, Duration::from_secs(2))
            .await
            .unwrap();

        let client_secret = client_task.await.unwrap().unwrap();
        assert_eq!(server_secret, client_secret);
    }

    #[tokio::test]
    async fn mismatched_setup_codes_fail() {
        let (client_io, server_io) = duplex(4096);
        let mut client_conn = FramedConnection::new(client_io);
        let mut server_conn = FramedConnection::new(server_io);

        let server = PaseServerSession::create_session("12345678", b"client", b"server");

        let client_task = tokio::spawn(async move {
            PaseClient::handshake(
                &mut client_conn,
                "87654321",
                b"client",
                b"server",
                Duration::from_secs(2),
            )
            .await
        });

        let first = PaseServerSession::wait_for_pase_request(&mut server_conn, Duration::from_secs(2))
            .await
            .unwrap();
        let result = server
            .complete_handshake(&mut server_conn, first, Duration::from_secs(2))
            .await;
        assert!(matches!(result, Err(PaseError::WrongSetupCode)));
        let _ = client_task.await;
    }

    #[tokio::test]
    async fn idle_connection_times_out_without_blocking() {
        let (_client_io, server_io) = duplex(4096);
        let mut server_conn = FramedConnection::new(server_io);
        let result =
            PaseServerSession::wait_for_pase_request(&mut server_conn, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(PaseError::Timeout)));
    }
}
