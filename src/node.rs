//! # High-Level Node API
//!
//! A [`Node`] wires the components together and is the single entry point
//! applications use:
//!
//! ```ignore
//! let config = NodeConfig::new("127.0.0.1:8080".parse()?, "data");
//! let node = Node::start(config).await?;
//!
//! // Genesis nodes just serve; everyone else joins through a bootstrap peer.
//! node.join_network("127.0.0.1:8081".parse()?).await?;
//!
//! let key = PeerId::for_key(b"file-hash-42");
//! node.store(key, b"http://blob/42".to_vec()).await?;
//! let (value, hops) = node.find_value(key).await?;
//! ```
//!
//! ## Startup sequence
//!
//! load-or-generate identity → verify identity (abort on mismatch) → bind
//! the datagram socket → generate-or-load the plot (abort on corruption) →
//! install handlers and serve. Joining is a separate, explicit step.
//!
//! ## Wiring
//!
//! The transport holds the node behind handler capability traits; the node
//! holds the transport behind the [`DhtRpc`](crate::protocols::DhtRpc)
//! capability. Neither owns the other, and the admission server decides
//! accept/reject while the node performs the routing-table insertions.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::admission::{self, AdmissionServer, JoinError, JoinRejection};
use crate::config::NodeConfig;
use crate::dht::{Dht, DhtStatus, LookupError, StoreReport};
use crate::identity::{now_ms, Contact, Keypair, PeerId};
use crate::messages::{
    JoinAckPayload, JoinChallengePayload, JoinRequestPayload, JoinResponsePayload, PingResponse,
    PosProofPayload,
};
use crate::pos::{Plot, Proof};
use crate::protocols::{
    AdmissionHandler, HandlerSet, JoinResponseOutcome, ProofHandler, RequestHandler,
};
use crate::transport::UdpTransport;

/// Read-only status snapshot exposed to collaborators (HTTP facade etc.).
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub peer_id: String,
    pub addr: SocketAddr,
    pub stored_keys: usize,
    pub known_peers: usize,
    /// `(bucket_index, contact_count)` for non-empty buckets.
    pub bucket_occupancy: Vec<(usize, usize)>,
}

pub struct Node {
    keypair: Keypair,
    config: NodeConfig,
    transport: Arc<UdpTransport>,
    dht: Dht<UdpTransport>,
    admission: AdmissionServer,
    plot: Option<Plot>,
}

impl Node {
    /// Bring a node up to the point of serving traffic. Identity or plot
    /// failures abort startup; joining the overlay is a separate call.
    pub async fn start(config: NodeConfig) -> Result<Arc<Self>> {
        let (keypair, _generated) = Keypair::load_or_generate(&config.data_dir)?;
        let peer_id = keypair.peer_id();
        keypair
            .verify_identity(peer_id)
            .context("identity verification failed")?;
        info!(peer = %peer_id, "identity verified");

        let transport = UdpTransport::bind(config.bind, peer_id).await?;
        let self_contact = Contact::new(peer_id, transport.local_addr());

        let plot = match &config.pos {
            Some(params) => {
                let params = params.clone();
                let data_dir = config.data_dir.clone();
                let plot = tokio::task::spawn_blocking(move || {
                    Plot::generate_or_load(peer_id, &data_dir, &params)
                })
                .await
                .context("plot generation task failed")?
                .context("proof-of-space plot unavailable")?;
                info!(path = %plot.path().display(), "proof-of-space ready");
                Some(plot)
            }
            None => {
                info!("proof-of-space disabled, admission stops at signature");
                None
            }
        };

        let dht = Dht::new(
            self_contact.clone(),
            Arc::clone(&transport),
            config.republish_interval,
        );
        let proof_timeout = config
            .pos
            .as_ref()
            .map(|p| p.proof_timeout)
            .unwrap_or(crate::config::POS_PROOF_TIMEOUT);
        let admission = AdmissionServer::new(crate::config::PENDING_CHALLENGE_TTL, proof_timeout);

        let node = Arc::new(Self {
            keypair,
            config,
            transport: Arc::clone(&transport),
            dht,
            admission,
            plot,
        });

        let handlers = HandlerSet {
            requests: node.clone(),
            admission: node.clone(),
            proof: node
                .plot
                .is_some()
                .then(|| node.clone() as Arc<dyn ProofHandler>),
        };
        Arc::clone(&transport).spawn_listener(handlers);
        info!(addr = %transport.local_addr(), "node serving");
        Ok(node)
    }

    pub fn peer_id(&self) -> PeerId {
        self.dht.self_id()
    }

    pub fn contact(&self) -> Contact {
        self.dht.self_contact()
    }

    pub fn addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Place a value on the overlay. Succeeds with zero remote replicas
    /// (the value is at least locally present, timer armed).
    pub async fn store(&self, key: PeerId, value: Vec<u8>) -> StoreReport {
        self.dht.store(key, value).await
    }

    /// Retrieve a value. Local hits report zero hops.
    pub async fn find_value(&self, key: PeerId) -> Result<(Vec<u8>, u32), LookupError> {
        self.dht.find_value(key).await
    }

    /// Delete a locally held key and stop its republication.
    pub async fn remove(&self, key: &PeerId) -> bool {
        self.dht.remove(key).await
    }

    /// Run the admission handshake against a bootstrap peer, then insert it
    /// and crawl toward our own id to populate nearby buckets.
    pub async fn join_network(&self, bootstrap: SocketAddr) -> Result<Contact, JoinError> {
        let bootstrap_contact = admission::join_network(
            &self.transport,
            &self.keypair,
            self.plot.as_ref(),
            bootstrap,
        )
        .await?;

        self.dht.routing().update(bootstrap_contact.clone());
        let near = self.dht.node_lookup(self.peer_id()).await;
        info!(
            bootstrap = &bootstrap_contact.id.to_hex()[..16],
            nearby = near.len(),
            "joined overlay"
        );
        Ok(bootstrap_contact)
    }

    /// Read-only status snapshot; never mutates state.
    pub async fn status(&self) -> NodeStatus {
        let DhtStatus {
            stored_keys,
            known_peers,
            bucket_occupancy,
        } = self.dht.status().await;
        NodeStatus {
            peer_id: self.peer_id().to_hex(),
            addr: self.transport.local_addr(),
            stored_keys,
            known_peers,
            bucket_occupancy,
        }
    }

    fn space_challenge_bits(&self) -> u32 {
        self.config
            .pos
            .as_ref()
            .map(|p| p.prefix_bits)
            .unwrap_or(crate::config::CHALLENGE_PREFIX_BITS)
    }
}

#[async_trait]
impl RequestHandler for Node {
    async fn on_ping(&self, sender: Contact) -> PingResponse {
        self.dht.handle_ping(sender);
        PingResponse { timestamp: now_ms() }
    }

    async fn on_find_node(&self, sender: Contact, target: PeerId) -> Vec<Contact> {
        self.dht.handle_find_node(sender, target)
    }

    async fn on_store(&self, sender: Contact, key: PeerId, value: Vec<u8>) -> bool {
        self.dht.handle_store(sender, key, value).await;
        true
    }

    async fn on_find_value(
        &self,
        sender: Contact,
        key: PeerId,
    ) -> (Option<Vec<u8>>, Vec<Contact>) {
        self.dht.handle_find_value(sender, key).await
    }
}

#[async_trait]
impl AdmissionHandler for Node {
    async fn on_join_request(
        &self,
        sender: Contact,
        request: JoinRequestPayload,
    ) -> Result<JoinChallengePayload, JoinRejection> {
        debug!(
            claimed = &request.peer_id.to_hex()[..16],
            from = %sender.addr(),
            "join request"
        );
        self.admission.begin_join(&request).await
    }

    async fn on_join_response(
        &self,
        sender: Contact,
        response: JoinResponsePayload,
    ) -> Result<JoinResponseOutcome, JoinRejection> {
        self.admission
            .verify_signature(sender.id, &response)
            .await?;

        if self.plot.is_some() {
            let challenge = self
                .admission
                .issue_space_challenge(sender.id, self.space_challenge_bits())
                .await?;
            return Ok(JoinResponseOutcome::SpaceChallenge(challenge));
        }

        // No space gate installed: the signature is the whole admission.
        self.admission.complete(&sender.id).await;
        self.dht.routing().update(sender.clone());
        info!(peer = &sender.id.to_hex()[..16], "peer admitted (signature only)");
        Ok(JoinResponseOutcome::Accepted(JoinAckPayload {
            success: true,
            message: "welcome to the overlay".to_string(),
        }))
    }
}

#[async_trait]
impl ProofHandler for Node {
    async fn on_pos_proof(
        &self,
        sender: Contact,
        proof: PosProofPayload,
    ) -> Result<JoinAckPayload, JoinRejection> {
        let proof = Proof::from_payload(&proof);
        self.admission.verify_space_proof(sender.id, &proof).await?;

        self.dht.routing().update(sender.clone());
        info!(peer = &sender.id.to_hex()[..16], "peer admitted");
        Ok(JoinAckPayload {
            success: true,
            message: "welcome to the overlay".to_string(),
        })
    }
}
