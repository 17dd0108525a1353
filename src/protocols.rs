//! Protocol trait definitions for the networking layer.
//!
//! The transport and the DHT core never reference each other directly; they
//! meet at the traits defined here.
//!
//! - [`DhtRpc`] is the client-side capability: "send this RPC to that
//!   contact and give me the typed reply". The lookup engine is generic over
//!   it, which keeps the crawl logic testable without sockets.
//! - [`RequestHandler`], [`AdmissionHandler`] and [`ProofHandler`] are the
//!   server-side capabilities the transport dispatches inbound requests to.
//!   They are grouped in a [`HandlerSet`]; the proof handler is optional,
//!   modelling deployments whose admission stops at the signature step.
//!
//! Neither side owns the other: the transport holds a `HandlerSet`, the node
//! holds the transport.

use async_trait::async_trait;
use std::sync::Arc;

use crate::admission::JoinRejection;
use crate::identity::{Contact, PeerId};
use crate::messages::{
    JoinAckPayload, JoinChallengePayload, JoinRequestPayload, JoinResponsePayload,
    PingResponse, PosChallengePayload, PosProofPayload,
};
use crate::transport::RpcError;

/// Client-side DHT RPCs, one method per request/response pair.
#[async_trait]
pub trait DhtRpc: Send + Sync + 'static {
    /// Liveness probe.
    async fn ping(&self, to: &Contact) -> Result<(), RpcError>;

    /// Ask a peer for its closest contacts to `target`.
    async fn find_node(&self, to: &Contact, target: PeerId) -> Result<Vec<Contact>, RpcError>;

    /// Ask a peer for a value; a miss returns the peer's closest contacts.
    async fn find_value(
        &self,
        to: &Contact,
        key: PeerId,
    ) -> Result<(Option<Vec<u8>>, Vec<Contact>), RpcError>;

    /// Ask a peer to store a key/value pair. `Ok(true)` means acknowledged.
    async fn store(&self, to: &Contact, key: PeerId, value: Vec<u8>) -> Result<bool, RpcError>;
}

/// Server side of the four plain DHT request types.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn on_ping(&self, sender: Contact) -> PingResponse;

    async fn on_find_node(&self, sender: Contact, target: PeerId) -> Vec<Contact>;

    /// Returns whether the value was accepted.
    async fn on_store(&self, sender: Contact, key: PeerId, value: Vec<u8>) -> bool;

    /// Local hit returns `(Some(value), [])`; a miss returns closest contacts.
    async fn on_find_value(&self, sender: Contact, key: PeerId)
        -> (Option<Vec<u8>>, Vec<Contact>);
}

/// What a verified signature step leads to.
pub enum JoinResponseOutcome {
    /// Admission complete; reply with this terminal ack.
    Accepted(JoinAckPayload),
    /// Admission continues with a proof-of-space challenge.
    SpaceChallenge(PosChallengePayload),
}

/// Server side of the join handshake's signature stage.
#[async_trait]
pub trait AdmissionHandler: Send + Sync + 'static {
    /// JOIN_REQ: verify the identity binding and issue a nonce challenge.
    async fn on_join_request(
        &self,
        sender: Contact,
        request: JoinRequestPayload,
    ) -> Result<JoinChallengePayload, JoinRejection>;

    /// JOIN_RES: verify the nonce signature; either finish admission or
    /// escalate to the space challenge, depending on local capability.
    async fn on_join_response(
        &self,
        sender: Contact,
        response: JoinResponsePayload,
    ) -> Result<JoinResponseOutcome, JoinRejection>;
}

/// Server side of the proof-of-space stage. Optional capability.
#[async_trait]
pub trait ProofHandler: Send + Sync + 'static {
    /// POS_PROOF: verify the proof against the pending challenge.
    async fn on_pos_proof(
        &self,
        sender: Contact,
        proof: PosProofPayload,
    ) -> Result<JoinAckPayload, JoinRejection>;
}

/// The handler capability set installed into the transport at startup.
#[derive(Clone)]
pub struct HandlerSet {
    pub requests: Arc<dyn RequestHandler>,
    pub admission: Arc<dyn AdmissionHandler>,
    /// Absent when the node runs without the proof-of-space gate. A
    /// `POS_PROOF` arriving anyway is answered with a typed failure ack.
    pub proof: Option<Arc<dyn ProofHandler>>,
}
