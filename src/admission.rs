//! # Admission Handshake
//!
//! A peer enters the overlay only through a two-stage challenge protocol
//! with a bootstrap peer:
//!
//! ```text
//! joiner                         server
//!   | JOIN_REQ (peer_id, pubkey)  |   identity binding checked
//!   |<──────── JOIN_CHALLENGE ────|   nonce recorded in pending table
//!   | JOIN_RES (signature) ──────>|   ECDSA verify against pending nonce
//!   |<──────── POS_CHALLENGE ─────|   T-bit prefix sampled   (if capable)
//!   | POS_PROOF (plot entry) ────>|   proof verified, deadline enforced
//!   |<──────── JOIN_ACK ──────────|   accepted → routing table insert
//! ```
//!
//! Without the proof-of-space capability the server acknowledges right
//! after the signature step.
//!
//! The server keeps at most one pending record per joining peer, expiring
//! after 10 seconds; late or out-of-order messages fail cleanly with a
//! typed reason that travels back in the terminal ack. The joiner bounds
//! every await at 10 seconds and treats unexpected message types as
//! protocol failures.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use p256::ecdsa::VerifyingKey;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::identity::{check_peer_id, new_nonce, verify_signature, Contact, Keypair, PeerId};
use crate::messages::{
    JoinAckPayload, JoinChallengePayload, JoinRequestPayload, JoinResponsePayload, MessageType,
    PosChallengePayload,
};
use crate::pos::{Challenge, Plot, PosError, Proof};
use crate::transport::{RpcError, UdpTransport};

// ============================================================================
// Rejection and error types
// ============================================================================

/// Server-side reasons for refusing a join step. The `Display` form is what
/// travels to the joiner inside `JOIN_ACK(success=false)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinRejection {
    /// Public key does not derive the claimed peer id.
    Sybil,
    /// Public key bytes are not a valid P-256 point.
    InvalidKey,
    /// ECDSA verification of the challenge nonce failed.
    SignatureInvalid,
    /// No pending challenge for this peer (never issued, or expired).
    ChallengeExpired,
    /// Message arrived in the wrong handshake state.
    OutOfOrder,
    /// The space proof failed verification.
    Proof(PosError),
}

impl std::fmt::Display for JoinRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JoinRejection::Sybil => {
                write!(f, "sybil check failed: public key does not derive peer id")
            }
            JoinRejection::InvalidKey => write!(f, "public key is not a valid P-256 point"),
            JoinRejection::SignatureInvalid => write!(f, "challenge signature invalid"),
            JoinRejection::ChallengeExpired => write!(f, "challenge expired or never issued"),
            JoinRejection::OutOfOrder => write!(f, "unexpected handshake message"),
            JoinRejection::Proof(e) => write!(f, "space proof rejected: {e}"),
        }
    }
}

impl std::error::Error for JoinRejection {}

/// Joiner-side failure of `join_network`.
#[derive(Debug)]
pub enum JoinError {
    /// A handshake step did not answer within its deadline.
    Timeout(&'static str),
    /// The server answered a step with an unexpected message type.
    Protocol {
        step: &'static str,
        got: MessageType,
    },
    /// The server refused admission; carries its reason.
    Rejected(String),
    /// Transport-level failure below the handshake.
    Rpc(RpcError),
    /// The local plot could not answer the challenge.
    Proof(PosError),
    /// The server demanded a space proof but no plot is configured.
    PlotUnavailable,
    /// Plot I/O failure while searching for a proof.
    Plot(String),
}

impl std::fmt::Display for JoinError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JoinError::Timeout(step) => write!(f, "timed out {step}"),
            JoinError::Protocol { step, got } => {
                write!(f, "protocol violation {step}: got {got}")
            }
            JoinError::Rejected(reason) => write!(f, "join rejected: {reason}"),
            JoinError::Rpc(e) => write!(f, "join transport failure: {e}"),
            JoinError::Proof(e) => write!(f, "space proof failed: {e}"),
            JoinError::PlotUnavailable => {
                write!(f, "server requires a space proof but no plot is configured")
            }
            JoinError::Plot(e) => write!(f, "plot search failed: {e}"),
        }
    }
}

impl std::error::Error for JoinError {}

// ============================================================================
// Server side
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    AwaitingSignature,
    AwaitingProof,
}

struct PendingJoin {
    nonce: String,
    public_key: Vec<u8>,
    created_at: Instant,
    stage: Stage,
    challenge: Option<Challenge>,
    challenge_issued_at: Option<Instant>,
}

/// Server half of the handshake: the pending-challenge table plus the
/// verification steps. Routing-table insertion is the caller's business;
/// this type only decides accept/reject.
pub struct AdmissionServer {
    pending: RwLock<HashMap<PeerId, PendingJoin>>,
    ttl: Duration,
    proof_timeout: Duration,
}

impl AdmissionServer {
    pub fn new(ttl: Duration, proof_timeout: Duration) -> Self {
        Self {
            pending: RwLock::new(HashMap::new()),
            ttl,
            proof_timeout,
        }
    }

    /// JOIN_REQ: check the identity binding and issue a nonce challenge.
    /// A repeated request from the same peer replaces its pending record.
    pub async fn begin_join(
        &self,
        request: &JoinRequestPayload,
    ) -> Result<JoinChallengePayload, JoinRejection> {
        if VerifyingKey::from_sec1_bytes(&request.public_key).is_err() {
            return Err(JoinRejection::InvalidKey);
        }
        if !check_peer_id(&request.public_key, &request.peer_id) {
            warn!(
                claimed = &request.peer_id.to_hex()[..16],
                "join refused: key does not derive claimed id"
            );
            return Err(JoinRejection::Sybil);
        }

        let nonce = new_nonce();
        let mut pending = self.pending.write().await;
        pending.insert(
            request.peer_id,
            PendingJoin {
                nonce: nonce.clone(),
                public_key: request.public_key.clone(),
                created_at: Instant::now(),
                stage: Stage::AwaitingSignature,
                challenge: None,
                challenge_issued_at: None,
            },
        );
        debug!(
            peer = &request.peer_id.to_hex()[..16],
            "join challenge issued"
        );
        Ok(JoinChallengePayload { nonce })
    }

    /// JOIN_RES: verify the nonce signature against the pending record.
    /// Leaves the record in place on success so the proof stage (or the
    /// caller's terminal accept) can follow.
    pub async fn verify_signature(
        &self,
        sender_id: PeerId,
        response: &JoinResponsePayload,
    ) -> Result<(), JoinRejection> {
        let mut pending = self.pending.write().await;
        let (created_at, stage, public_key, nonce) = match pending.get(&sender_id) {
            Some(entry) => (
                entry.created_at,
                entry.stage,
                entry.public_key.clone(),
                entry.nonce.clone(),
            ),
            None => return Err(JoinRejection::ChallengeExpired),
        };
        if created_at.elapsed() > self.ttl {
            pending.remove(&sender_id);
            return Err(JoinRejection::ChallengeExpired);
        }
        if stage != Stage::AwaitingSignature {
            return Err(JoinRejection::OutOfOrder);
        }
        if !verify_signature(&public_key, nonce.as_bytes(), &response.signature) {
            pending.remove(&sender_id);
            warn!(
                peer = &sender_id.to_hex()[..16],
                "join refused: signature invalid"
            );
            return Err(JoinRejection::SignatureInvalid);
        }
        Ok(())
    }

    /// Advance a signature-verified peer to the proof stage, sampling a
    /// fresh challenge and refreshing the record's clock.
    pub async fn issue_space_challenge(
        &self,
        sender_id: PeerId,
        prefix_bits: u32,
    ) -> Result<PosChallengePayload, JoinRejection> {
        let mut pending = self.pending.write().await;
        let Some(entry) = pending.get_mut(&sender_id) else {
            return Err(JoinRejection::ChallengeExpired);
        };
        if entry.stage != Stage::AwaitingSignature {
            return Err(JoinRejection::OutOfOrder);
        }
        let challenge = Challenge::random(prefix_bits);
        let now = Instant::now();
        entry.stage = Stage::AwaitingProof;
        entry.challenge = Some(challenge.clone());
        entry.challenge_issued_at = Some(now);
        entry.created_at = now;
        debug!(
            peer = &sender_id.to_hex()[..16],
            bits = prefix_bits,
            "space challenge issued"
        );
        Ok(challenge.to_payload())
    }

    /// POS_PROOF: verify against the pending challenge. The record is
    /// cleared on every terminal outcome, success or failure; only an
    /// out-of-order message leaves the handshake alive.
    pub async fn verify_space_proof(
        &self,
        sender_id: PeerId,
        proof: &Proof,
    ) -> Result<(), JoinRejection> {
        let mut pending = self.pending.write().await;
        let (created_at, stage, challenge, issued_at) = match pending.get(&sender_id) {
            Some(entry) => (
                entry.created_at,
                entry.stage,
                entry.challenge.clone(),
                entry.challenge_issued_at,
            ),
            None => return Err(JoinRejection::ChallengeExpired),
        };
        if stage != Stage::AwaitingProof {
            return Err(JoinRejection::OutOfOrder);
        }
        let issued_at = issued_at.expect("proof stage entry always carries its challenge clock");
        if issued_at.elapsed() > self.proof_timeout || created_at.elapsed() > self.ttl {
            pending.remove(&sender_id);
            return Err(JoinRejection::ChallengeExpired);
        }
        let challenge = challenge.expect("proof stage entry always carries its challenge");

        let verdict = crate::pos::verify(&sender_id, &challenge, proof);
        pending.remove(&sender_id);
        match verdict {
            Ok(()) => {
                info!(peer = &sender_id.to_hex()[..16], "space proof accepted");
                Ok(())
            }
            Err(e) => {
                warn!(
                    peer = &sender_id.to_hex()[..16],
                    reason = %e,
                    "space proof rejected"
                );
                Err(JoinRejection::Proof(e))
            }
        }
    }

    /// Drop the pending record after a terminal signature-only accept.
    pub async fn complete(&self, sender_id: &PeerId) {
        self.pending.write().await.remove(sender_id);
    }

    /// Number of handshakes currently in flight (status/tests).
    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }
}

// ============================================================================
// Joiner side
// ============================================================================

fn step_error(step: &'static str, e: RpcError) -> JoinError {
    match e {
        RpcError::Timeout => JoinError::Timeout(step),
        other => JoinError::Rpc(other),
    }
}

/// Interpret a terminal ack: success yields the bootstrap contact.
fn ack_outcome(
    ack: JoinAckPayload,
    server_id: PeerId,
    bootstrap: SocketAddr,
) -> Result<Contact, JoinError> {
    if ack.success {
        info!(
            bootstrap = &server_id.to_hex()[..16],
            message = %ack.message,
            "admission granted"
        );
        Ok(Contact::new(server_id, bootstrap))
    } else {
        Err(JoinError::Rejected(ack.message))
    }
}

/// Run the joiner's side of the handshake against `bootstrap`.
///
/// On success the returned contact is the bootstrap peer; the caller is
/// expected to insert it into the routing table and run a self-lookup to
/// populate nearby buckets.
pub async fn join_network(
    transport: &UdpTransport,
    keypair: &Keypair,
    plot: Option<&Plot>,
    bootstrap: SocketAddr,
) -> Result<Contact, JoinError> {
    let self_id = transport.self_id();

    // Step 1: announce ourselves, expect a nonce challenge.
    let request = JoinRequestPayload {
        peer_id: self_id,
        public_key: keypair.public_key_sec1(),
    };
    let response = transport
        .handshake_step(bootstrap, MessageType::JoinReq, &request)
        .await
        .map_err(|e| step_error("awaiting join challenge", e))?;
    let nonce = match response.msg_type {
        MessageType::JoinChallenge => {
            let challenge: JoinChallengePayload = response
                .payload_as()
                .map_err(|e| JoinError::Rpc(RpcError::Decode(e.to_string())))?;
            challenge.nonce
        }
        MessageType::JoinAck => {
            let ack: JoinAckPayload = response
                .payload_as()
                .map_err(|e| JoinError::Rpc(RpcError::Decode(e.to_string())))?;
            return Err(JoinError::Rejected(ack.message));
        }
        got => {
            return Err(JoinError::Protocol {
                step: "awaiting join challenge",
                got,
            })
        }
    };

    // Step 2: sign the nonce, expect either the terminal ack or a space
    // challenge depending on the server's capability.
    let signature = keypair.sign(nonce.as_bytes());
    let response = transport
        .handshake_step(bootstrap, MessageType::JoinRes, &JoinResponsePayload { signature })
        .await
        .map_err(|e| step_error("awaiting signature verdict", e))?;

    let challenge_payload = match response.msg_type {
        MessageType::JoinAck => {
            let ack: JoinAckPayload = response
                .payload_as()
                .map_err(|e| JoinError::Rpc(RpcError::Decode(e.to_string())))?;
            return ack_outcome(ack, response.sender_id, bootstrap);
        }
        MessageType::PosChallenge => response
            .payload_as::<PosChallengePayload>()
            .map_err(|e| JoinError::Rpc(RpcError::Decode(e.to_string())))?,
        got => {
            return Err(JoinError::Protocol {
                step: "awaiting signature verdict",
                got,
            })
        }
    };

    // Step 3: search the plot and present the proof.
    let challenge = Challenge::from_payload(&challenge_payload).map_err(JoinError::Proof)?;
    let plot = plot.ok_or(JoinError::PlotUnavailable)?.clone();
    debug!(
        bits = challenge.prefix_bits,
        prefix = %hex::encode(&challenge.prefix),
        "searching plot for space challenge"
    );
    let search = {
        let challenge = challenge.clone();
        tokio::task::spawn_blocking(move || plot.search(&challenge))
            .await
            .map_err(|e| JoinError::Plot(e.to_string()))?
            .map_err(|e| JoinError::Plot(e.to_string()))?
    };
    let proof = search.ok_or(JoinError::Proof(PosError::NoProof))?;

    let response = transport
        .handshake_step(bootstrap, MessageType::PosProof, &proof.to_payload())
        .await
        .map_err(|e| step_error("awaiting admission ack", e))?;
    match response.msg_type {
        MessageType::JoinAck => {
            let ack: JoinAckPayload = response
                .payload_as()
                .map_err(|e| JoinError::Rpc(RpcError::Decode(e.to_string())))?;
            ack_outcome(ack, response.sender_id, bootstrap)
        }
        got => Err(JoinError::Protocol {
            step: "awaiting admission ack",
            got,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pos::{entry_hash, raw_value};

    fn server() -> AdmissionServer {
        AdmissionServer::new(Duration::from_secs(10), Duration::from_secs(5))
    }

    fn join_request(keypair: &Keypair) -> JoinRequestPayload {
        JoinRequestPayload {
            peer_id: keypair.peer_id(),
            public_key: keypair.public_key_sec1(),
        }
    }

    #[tokio::test]
    async fn begin_join_issues_nonce_for_valid_identity() {
        let server = server();
        let joiner = Keypair::generate();

        let challenge = server.begin_join(&join_request(&joiner)).await.unwrap();
        assert!(challenge.nonce.len() >= 32);
        assert_eq!(server.pending_count().await, 1);
    }

    #[tokio::test]
    async fn begin_join_rejects_sybil_claim() {
        let server = server();
        let joiner = Keypair::generate();
        let other = Keypair::generate();

        let request = JoinRequestPayload {
            peer_id: other.peer_id(),
            public_key: joiner.public_key_sec1(),
        };
        assert_eq!(
            server.begin_join(&request).await,
            Err(JoinRejection::Sybil)
        );
        assert_eq!(server.pending_count().await, 0);
    }

    #[tokio::test]
    async fn begin_join_rejects_garbage_key() {
        let server = server();
        let request = JoinRequestPayload {
            peer_id: PeerId::from_bytes([1u8; 32]),
            public_key: vec![0xDE, 0xAD],
        };
        assert_eq!(
            server.begin_join(&request).await,
            Err(JoinRejection::InvalidKey)
        );
    }

    #[tokio::test]
    async fn signature_verification_happy_path() {
        let server = server();
        let joiner = Keypair::generate();

        let challenge = server.begin_join(&join_request(&joiner)).await.unwrap();
        let response = JoinResponsePayload {
            signature: joiner.sign(challenge.nonce.as_bytes()),
        };
        server
            .verify_signature(joiner.peer_id(), &response)
            .await
            .unwrap();
        // Record survives for the proof stage.
        assert_eq!(server.pending_count().await, 1);
    }

    #[tokio::test]
    async fn wrong_signature_is_rejected_and_cleared() {
        let server = server();
        let joiner = Keypair::generate();
        let imposter = Keypair::generate();

        let challenge = server.begin_join(&join_request(&joiner)).await.unwrap();
        let response = JoinResponsePayload {
            signature: imposter.sign(challenge.nonce.as_bytes()),
        };
        assert_eq!(
            server.verify_signature(joiner.peer_id(), &response).await,
            Err(JoinRejection::SignatureInvalid)
        );
        assert_eq!(server.pending_count().await, 0);
    }

    #[tokio::test]
    async fn response_without_pending_record_is_rejected() {
        let server = server();
        let joiner = Keypair::generate();
        let response = JoinResponsePayload {
            signature: joiner.sign(b"anything"),
        };
        assert_eq!(
            server.verify_signature(joiner.peer_id(), &response).await,
            Err(JoinRejection::ChallengeExpired)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stale_pending_record_is_rejected() {
        let server = server();
        let joiner = Keypair::generate();

        let challenge = server.begin_join(&join_request(&joiner)).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;

        let response = JoinResponsePayload {
            signature: joiner.sign(challenge.nonce.as_bytes()),
        };
        assert_eq!(
            server.verify_signature(joiner.peer_id(), &response).await,
            Err(JoinRejection::ChallengeExpired)
        );
        assert_eq!(server.pending_count().await, 0);
    }

    #[tokio::test]
    async fn space_challenge_and_proof_roundtrip() {
        let server = server();
        let joiner = Keypair::generate();
        let joiner_id = joiner.peer_id();

        let challenge = server.begin_join(&join_request(&joiner)).await.unwrap();
        let response = JoinResponsePayload {
            signature: joiner.sign(challenge.nonce.as_bytes()),
        };
        server.verify_signature(joiner_id, &response).await.unwrap();

        let payload = server.issue_space_challenge(joiner_id, 16).await.unwrap();
        assert_eq!(payload.prefix.len(), 2);

        // Brute-force an entry index matching the issued prefix; cheaper
        // than generating a whole plot here.
        let mut found = None;
        for index in 0..1_000_000u64 {
            let hash = entry_hash(&joiner_id, index);
            let challenge = Challenge::from_payload(&payload).unwrap();
            if challenge.matches(&hash) {
                found = Some(Proof {
                    raw_value: raw_value(&joiner_id, index),
                    index,
                    hash,
                });
                break;
            }
        }
        let proof = found.expect("a 16-bit prefix should appear within 1M entries");

        server.verify_space_proof(joiner_id, &proof).await.unwrap();
        assert_eq!(server.pending_count().await, 0);
    }

    #[tokio::test]
    async fn tampered_proof_hash_is_rejected() {
        let server = server();
        let joiner = Keypair::generate();
        let joiner_id = joiner.peer_id();

        let challenge = server.begin_join(&join_request(&joiner)).await.unwrap();
        let response = JoinResponsePayload {
            signature: joiner.sign(challenge.nonce.as_bytes()),
        };
        server.verify_signature(joiner_id, &response).await.unwrap();
        server.issue_space_challenge(joiner_id, 16).await.unwrap();

        let mut proof = Proof {
            raw_value: raw_value(&joiner_id, 7),
            index: 7,
            hash: entry_hash(&joiner_id, 7),
        };
        proof.hash[3] ^= 0x01;

        assert_eq!(
            server.verify_space_proof(joiner_id, &proof).await,
            Err(JoinRejection::Proof(PosError::HashMismatch))
        );
        assert_eq!(server.pending_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_proof_misses_server_deadline() {
        let server = server();
        let joiner = Keypair::generate();
        let joiner_id = joiner.peer_id();

        let challenge = server.begin_join(&join_request(&joiner)).await.unwrap();
        let response = JoinResponsePayload {
            signature: joiner.sign(challenge.nonce.as_bytes()),
        };
        server.verify_signature(joiner_id, &response).await.unwrap();
        server.issue_space_challenge(joiner_id, 16).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;

        let proof = Proof {
            raw_value: raw_value(&joiner_id, 7),
            index: 7,
            hash: entry_hash(&joiner_id, 7),
        };
        assert_eq!(
            server.verify_space_proof(joiner_id, &proof).await,
            Err(JoinRejection::ChallengeExpired)
        );
    }

    #[tokio::test]
    async fn proof_before_signature_is_out_of_order() {
        let server = server();
        let joiner = Keypair::generate();
        let joiner_id = joiner.peer_id();

        server.begin_join(&join_request(&joiner)).await.unwrap();

        let proof = Proof {
            raw_value: raw_value(&joiner_id, 7),
            index: 7,
            hash: entry_hash(&joiner_id, 7),
        };
        assert_eq!(
            server.verify_space_proof(joiner_id, &proof).await,
            Err(JoinRejection::OutOfOrder)
        );
        // The in-progress handshake is still alive.
        assert_eq!(server.pending_count().await, 1);
    }

    #[tokio::test]
    async fn repeated_join_request_replaces_pending_record() {
        let server = server();
        let joiner = Keypair::generate();

        let first = server.begin_join(&join_request(&joiner)).await.unwrap();
        let second = server.begin_join(&join_request(&joiner)).await.unwrap();
        assert_ne!(first.nonce, second.nonce);
        assert_eq!(server.pending_count().await, 1);

        // The replaced nonce no longer verifies.
        let stale = JoinResponsePayload {
            signature: joiner.sign(first.nonce.as_bytes()),
        };
        assert_eq!(
            server.verify_signature(joiner.peer_id(), &stale).await,
            Err(JoinRejection::SignatureInvalid)
        );
    }
}
