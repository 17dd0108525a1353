//! # Datagram Transport
//!
//! Best-effort UDP transport for the overlay protocol. One socket carries
//! both roles:
//!
//! - **Client**: [`UdpTransport::request`] allocates an rpc id, registers a
//!   one-slot mailbox, sends the datagram and waits for the correlated
//!   response with a timeout. The typed [`DhtRpc`] methods are thin wrappers
//!   that check the response type and decode the payload.
//! - **Server**: the receive loop decodes each datagram; response types are
//!   delivered to their mailbox (non-blocking, dropped when the slot is
//!   full or gone), request types fan out to short-lived tasks that invoke
//!   the installed [`HandlerSet`] and answer to the datagram's source
//!   address under the request's rpc id.
//!
//! There are no retries and no at-least-once semantics here; a lost
//! datagram surfaces as a call timeout and callers decide what to do.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::RngCore;
use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::{HANDSHAKE_STEP_TIMEOUT, MAX_DATAGRAM_BYTES, RPC_TIMEOUT};
use crate::identity::{now_ms, Contact, PeerId};
use crate::messages::{
    self, FindNodeRequest, FindNodeResponse, FindValueRequest, FindValueResponse, JoinAckPayload,
    Message, MessageType, PingRequest, PingResponse, StoreRequest, StoreResponse, WireError,
};
use crate::protocols::{DhtRpc, HandlerSet, JoinResponseOutcome};

/// Transport-layer failure kinds, as seen by a caller.
#[derive(Debug)]
pub enum RpcError {
    /// No response arrived within the per-call deadline.
    Timeout,
    /// The response arrived but its payload (or the datagram) was malformed.
    Decode(String),
    /// A response of an unexpected type arrived for this rpc id.
    Protocol {
        expected: MessageType,
        got: MessageType,
    },
    /// Socket-level send failure.
    Io(String),
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcError::Timeout => write!(f, "rpc timed out"),
            RpcError::Decode(e) => write!(f, "rpc decode failed: {e}"),
            RpcError::Protocol { expected, got } => {
                write!(f, "expected {expected}, got {got}")
            }
            RpcError::Io(e) => write!(f, "rpc send failed: {e}"),
        }
    }
}

impl std::error::Error for RpcError {}

impl From<WireError> for RpcError {
    fn from(e: WireError) -> Self {
        RpcError::Decode(e.to_string())
    }
}

/// Allocate a fresh rpc correlation id: 16 random bytes, hex encoded.
fn new_rpc_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    self_id: PeerId,
    /// rpc_id → one-slot mailbox of the call awaiting that response.
    mailboxes: StdRwLock<HashMap<String, mpsc::Sender<Message>>>,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr, self_id: PeerId) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("binding UDP socket on {addr}"))?;
        let local_addr = socket.local_addr()?;
        Ok(Arc::new(Self {
            socket,
            local_addr,
            self_id,
            mailboxes: StdRwLock::new(HashMap::new()),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn self_id(&self) -> PeerId {
        self.self_id
    }

    /// Spawn the receive loop. Each datagram is handled on its own task so a
    /// slow handler never stalls the socket.
    pub fn spawn_listener(self: Arc<Self>, handlers: HandlerSet) -> JoinHandle<()> {
        let transport = self;
        tokio::spawn(async move {
            debug!(addr = %transport.local_addr, "listening for datagrams");
            let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
            loop {
                let (len, src) = match transport.socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        warn!(error = %e, "datagram receive failed");
                        continue;
                    }
                };
                let data = buf[..len].to_vec();
                let transport = Arc::clone(&transport);
                let handlers = handlers.clone();
                tokio::spawn(async move {
                    transport.handle_datagram(&handlers, data, src).await;
                });
            }
        })
    }

    async fn handle_datagram(&self, handlers: &HandlerSet, data: Vec<u8>, src: SocketAddr) {
        let message = match messages::decode(&data) {
            Ok(message) => message,
            Err(e) => {
                debug!(from = %src, error = %e, "dropping undecodable datagram");
                return;
            }
        };

        if message.msg_type.is_response() {
            self.deliver_response(message);
            return;
        }

        let sender = Contact::new(message.sender_id, src);
        self.dispatch_request(handlers, message, sender, src).await;
    }

    /// Route a response to the mailbox registered for its rpc id. Delivery
    /// is non-blocking; orphans and full slots are logged and dropped.
    fn deliver_response(&self, message: Message) {
        let slot = {
            let mailboxes = self.mailboxes.read().expect("mailbox lock poisoned");
            mailboxes.get(&message.rpc_id).cloned()
        };
        match slot {
            Some(tx) => {
                if tx.try_send(message).is_err() {
                    warn!("response mailbox full or closed, dropping message");
                }
            }
            None => {
                debug!(
                    rpc_id = %message.rpc_id,
                    msg_type = %message.msg_type,
                    "orphan response (call likely timed out)"
                );
            }
        }
    }

    async fn dispatch_request(
        &self,
        handlers: &HandlerSet,
        message: Message,
        sender: Contact,
        src: SocketAddr,
    ) {
        let rpc_id = message.rpc_id.clone();
        match message.msg_type {
            MessageType::Ping => {
                if message.payload_as::<PingRequest>().is_err() {
                    trace!(from = %src, "malformed ping payload");
                    return;
                }
                let response = handlers.requests.on_ping(sender).await;
                self.respond(&rpc_id, MessageType::PingRes, &response, src)
                    .await;
            }
            MessageType::FindNode => {
                let Ok(request) = message.payload_as::<FindNodeRequest>() else {
                    trace!(from = %src, "malformed find-node payload");
                    return;
                };
                let nodes = handlers
                    .requests
                    .on_find_node(sender, request.target_id)
                    .await;
                self.respond(
                    &rpc_id,
                    MessageType::FindNodeRes,
                    &FindNodeResponse { nodes },
                    src,
                )
                .await;
            }
            MessageType::Store => {
                let Ok(request) = message.payload_as::<StoreRequest>() else {
                    trace!(from = %src, "malformed store payload");
                    return;
                };
                let success = handlers
                    .requests
                    .on_store(sender, request.key, request.value)
                    .await;
                self.respond(
                    &rpc_id,
                    MessageType::StoreRes,
                    &StoreResponse { success },
                    src,
                )
                .await;
            }
            MessageType::FindValue => {
                let Ok(request) = message.payload_as::<FindValueRequest>() else {
                    trace!(from = %src, "malformed find-value payload");
                    return;
                };
                let (value, nodes) = handlers.requests.on_find_value(sender, request.key).await;
                let response = FindValueResponse {
                    found: value.is_some(),
                    value,
                    nodes,
                };
                self.respond(&rpc_id, MessageType::FindValueRes, &response, src)
                    .await;
            }
            MessageType::JoinReq => {
                let Ok(request) = message.payload_as() else {
                    self.reject_join(&rpc_id, "malformed join request", src).await;
                    return;
                };
                match handlers.admission.on_join_request(sender, request).await {
                    Ok(challenge) => {
                        self.respond(&rpc_id, MessageType::JoinChallenge, &challenge, src)
                            .await;
                    }
                    Err(rejection) => {
                        self.reject_join(&rpc_id, &rejection.to_string(), src).await;
                    }
                }
            }
            MessageType::JoinRes => {
                let Ok(response) = message.payload_as() else {
                    self.reject_join(&rpc_id, "malformed join response", src).await;
                    return;
                };
                match handlers.admission.on_join_response(sender, response).await {
                    Ok(JoinResponseOutcome::Accepted(ack)) => {
                        self.respond(&rpc_id, MessageType::JoinAck, &ack, src).await;
                    }
                    Ok(JoinResponseOutcome::SpaceChallenge(challenge)) => {
                        self.respond(&rpc_id, MessageType::PosChallenge, &challenge, src)
                            .await;
                    }
                    Err(rejection) => {
                        self.reject_join(&rpc_id, &rejection.to_string(), src).await;
                    }
                }
            }
            MessageType::PosProof => {
                let Some(proof_handler) = handlers.proof.as_ref() else {
                    self.reject_join(&rpc_id, "proof-of-space not supported", src)
                        .await;
                    return;
                };
                let Ok(proof) = message.payload_as() else {
                    self.reject_join(&rpc_id, "malformed proof payload", src).await;
                    return;
                };
                match proof_handler.on_pos_proof(sender, proof).await {
                    Ok(ack) => {
                        self.respond(&rpc_id, MessageType::JoinAck, &ack, src).await;
                    }
                    Err(rejection) => {
                        self.reject_join(&rpc_id, &rejection.to_string(), src).await;
                    }
                }
            }
            // Response types were already routed; nothing else reaches here.
            other => {
                debug!(msg_type = %other, from = %src, "request type without handler");
            }
        }
    }

    async fn reject_join(&self, rpc_id: &str, reason: &str, to: SocketAddr) {
        let ack = JoinAckPayload {
            success: false,
            message: reason.to_string(),
        };
        self.respond(rpc_id, MessageType::JoinAck, &ack, to).await;
    }

    async fn respond<P: Serialize>(
        &self,
        rpc_id: &str,
        msg_type: MessageType,
        payload: &P,
        to: SocketAddr,
    ) {
        let message = match Message::new(msg_type, self.self_id, rpc_id, payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "failed to build response message");
                return;
            }
        };
        if let Err(e) = self.send_message(&message, to).await {
            debug!(to = %to, error = %e, "failed to send response");
        }
    }

    async fn send_message(&self, message: &Message, to: SocketAddr) -> Result<(), RpcError> {
        let bytes = messages::encode(message).map_err(|e| RpcError::Decode(e.to_string()))?;
        self.socket
            .send_to(&bytes, to)
            .await
            .map_err(|e| RpcError::Io(e.to_string()))?;
        Ok(())
    }

    /// Issue a request and wait for the correlated response.
    ///
    /// The mailbox is registered before the send so a fast responder cannot
    /// race the registration, and unregistered on every exit path.
    pub async fn request<P: Serialize>(
        &self,
        to: SocketAddr,
        msg_type: MessageType,
        payload: &P,
        timeout: Duration,
    ) -> Result<Message, RpcError> {
        let rpc_id = new_rpc_id();
        let message = Message::new(msg_type, self.self_id, rpc_id.clone(), payload)?;

        let (tx, mut rx) = mpsc::channel(1);
        {
            let mut mailboxes = self.mailboxes.write().expect("mailbox lock poisoned");
            mailboxes.insert(rpc_id.clone(), tx);
        }

        let send_result = self.send_message(&message, to).await;
        let outcome = match send_result {
            Ok(()) => match tokio::time::timeout(timeout, rx.recv()).await {
                Ok(Some(response)) => Ok(response),
                Ok(None) => Err(RpcError::Timeout),
                Err(_) => Err(RpcError::Timeout),
            },
            Err(e) => Err(e),
        };

        {
            let mut mailboxes = self.mailboxes.write().expect("mailbox lock poisoned");
            mailboxes.remove(&rpc_id);
        }
        outcome
    }

    /// `request` for a routine RPC, asserting the response type.
    async fn call<P: Serialize>(
        &self,
        to: SocketAddr,
        msg_type: MessageType,
        payload: &P,
        expected: MessageType,
    ) -> Result<Message, RpcError> {
        let response = self.request(to, msg_type, payload, RPC_TIMEOUT).await?;
        if response.msg_type != expected {
            return Err(RpcError::Protocol {
                expected,
                got: response.msg_type,
            });
        }
        Ok(response)
    }

    /// `request` with the handshake step timeout. The admission state
    /// machine matches on the response type itself, so none is asserted.
    pub async fn handshake_step<P: Serialize>(
        &self,
        to: SocketAddr,
        msg_type: MessageType,
        payload: &P,
    ) -> Result<Message, RpcError> {
        self.request(to, msg_type, payload, HANDSHAKE_STEP_TIMEOUT)
            .await
    }
}

#[async_trait]
impl DhtRpc for UdpTransport {
    async fn ping(&self, to: &Contact) -> Result<(), RpcError> {
        let request = PingRequest { timestamp: now_ms() };
        let response = self
            .call(to.addr(), MessageType::Ping, &request, MessageType::PingRes)
            .await?;
        response.payload_as::<PingResponse>()?;
        Ok(())
    }

    async fn find_node(&self, to: &Contact, target: PeerId) -> Result<Vec<Contact>, RpcError> {
        let request = FindNodeRequest { target_id: target };
        let response = self
            .call(
                to.addr(),
                MessageType::FindNode,
                &request,
                MessageType::FindNodeRes,
            )
            .await?;
        let decoded: FindNodeResponse = response.payload_as()?;
        Ok(decoded.nodes)
    }

    async fn find_value(
        &self,
        to: &Contact,
        key: PeerId,
    ) -> Result<(Option<Vec<u8>>, Vec<Contact>), RpcError> {
        let request = FindValueRequest { key };
        let response = self
            .call(
                to.addr(),
                MessageType::FindValue,
                &request,
                MessageType::FindValueRes,
            )
            .await?;
        let decoded: FindValueResponse = response.payload_as()?;
        if decoded.found {
            match decoded.value {
                Some(value) => Ok((Some(value), decoded.nodes)),
                None => Err(RpcError::Decode(
                    "find-value response marked found but carries no value".into(),
                )),
            }
        } else {
            Ok((None, decoded.nodes))
        }
    }

    async fn store(&self, to: &Contact, key: PeerId, value: Vec<u8>) -> Result<bool, RpcError> {
        let request = StoreRequest { key, value };
        let response = self
            .call(
                to.addr(),
                MessageType::Store,
                &request,
                MessageType::StoreRes,
            )
            .await?;
        let decoded: StoreResponse = response.payload_as()?;
        Ok(decoded.success)
    }
}
