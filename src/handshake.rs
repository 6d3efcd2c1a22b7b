//! Handshaking with the bootstrap nodes.
//!
//! Every node is contacted concurrently under one global deadline. Each node
//! answers with its keys and its view of the network; the client keeps the
//! per-node answers for encryption and derives the network configuration by
//! majority.
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use futures::future::{join_all, try_join_all};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::{
    attestation::{AttestationVerifier, NodeAttestation},
    config::{ClientConfig, HandshakePolicy},
    error::{CodecError, Error, Result},
    protocol::{
        most_common, new_request_id, random_hex, Endpoint, NodeReply, NodeTransport, NodeUrl,
        RequestItem,
    },
};

/// What a node reports about itself and the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawHandshakeResponse {
    #[serde(alias = "serverPubKey")]
    pub server_public_key: String,
    #[serde(alias = "subnetPubKey")]
    pub subnet_public_key: String,
    #[serde(alias = "networkPubKey")]
    pub network_public_key: String,
    #[serde(alias = "networkPubKeySet")]
    pub network_public_key_set: String,
    #[serde(default)]
    pub hd_root_pubkeys: Vec<String>,
    #[serde(default)]
    pub latest_blockhash: Option<String>,
    /// The node's X25519 key for end to end encryption, hex encoded.
    pub node_identity_key: String,
    #[serde(default)]
    pub node_version: Option<String>,
    #[serde(default)]
    pub epoch: Option<u64>,
    #[serde(default)]
    pub attestation: Option<NodeAttestation>,
}

/// Network parameters agreed on by the majority of nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusConfig {
    pub subnet_public_key: String,
    pub network_public_key: String,
    pub network_public_key_set: String,
    pub hd_root_pubkeys: Vec<String>,
    pub latest_blockhash: Option<String>,
    pub epoch: Option<u64>,
}

impl ConsensusConfig {
    /// Take the most common value of each field, the first one seen on ties.
    pub fn from_responses<'a>(
        responses: impl Iterator<Item = &'a RawHandshakeResponse> + Clone,
    ) -> Option<Self> {
        Some(Self {
            subnet_public_key: most_common(responses.clone().map(|r| &r.subnet_public_key))?
                .clone(),
            network_public_key: most_common(responses.clone().map(|r| &r.network_public_key))?
                .clone(),
            network_public_key_set: most_common(
                responses.clone().map(|r| &r.network_public_key_set),
            )?
            .clone(),
            hd_root_pubkeys: most_common(responses.clone().map(|r| &r.hd_root_pubkeys))?.clone(),
            latest_blockhash: most_common(
                responses.clone().filter_map(|r| r.latest_blockhash.as_ref()),
            )
            .cloned(),
            epoch: most_common(responses.filter_map(|r| r.epoch.as_ref())).copied(),
        })
    }
}

/// The outcome of a handshake: immutable, replaced wholesale on refresh.
#[derive(Debug, Clone)]
pub struct HandshakeResult {
    pub server_keys: BTreeMap<NodeUrl, RawHandshakeResponse>,
    pub connected_nodes: BTreeSet<NodeUrl>,
    pub consensus_config: Option<ConsensusConfig>,
    pub threshold: usize,
    pub epoch: u64,
    pub request_id: String,
}

impl HandshakeResult {
    pub fn consensus(&self) -> Result<&ConsensusConfig> {
        self.consensus_config
            .as_ref()
            .ok_or_else(|| Error::NotReady("no consensus network configuration".to_string()))
    }
}

/// The number of shares needed given how many nodes are connected.
pub fn threshold_for(connected: usize, minimum_threshold: usize) -> usize {
    minimum_threshold.max(2 * connected / 3)
}

struct NodeHandshake<'a> {
    transport: &'a dyn NodeTransport,
    verifier: Option<&'a dyn AttestationVerifier>,
    config: &'a ClientConfig,
    request_id: &'a str,
    epoch: u64,
    connected: &'a AtomicUsize,
}

impl NodeHandshake<'_> {
    async fn run(&self, url: &NodeUrl) -> Result<RawHandshakeResponse> {
        let challenge = random_hex(&mut OsRng, 64);
        let handshake_key = PublicKey::from(&StaticSecret::random_from_rng(OsRng));
        let request = RequestItem {
            target_url: url.clone(),
            endpoint: Endpoint::Handshake,
            path: self.config.endpoints.path(Endpoint::Handshake),
            payload: json!({
                "clientPublicKey": hex::encode(handshake_key.as_bytes()),
                "challenge": challenge,
            }),
            request_id: self.request_id.to_string(),
            epoch: self.epoch,
            version: self.config.version.clone(),
        };

        let body = match NodeReply::from_body(self.transport.send(&request).await?) {
            NodeReply::Success(body) => body,
            NodeReply::Failure(summary) => {
                return Err(Error::Node {
                    url: url.clone(),
                    summary,
                })
            }
        };
        let response: RawHandshakeResponse = serde_json::from_value(body).map_err(|e| {
            CodecError::Malformed(format!("handshake response from {}: {}", url, e))
        })?;

        if self.config.required_attestation {
            let attestation = response.attestation.as_ref().ok_or_else(|| {
                Error::InvalidNodeAttestation {
                    url: url.clone(),
                    reason: "missing attestation in handshake response".to_string(),
                }
            })?;
            let verifier = self.verifier.ok_or_else(|| {
                Error::Config("attestation is required but no verifier is configured".to_string())
            })?;
            verifier
                .verify(attestation, &challenge, url)
                .map_err(|e| Error::InvalidNodeAttestation {
                    url: url.clone(),
                    reason: e.to_string(),
                })?;
        }

        self.connected.fetch_add(1, Ordering::SeqCst);
        Ok(response)
    }
}

/// Handshake with every bootstrap node.
///
/// Under [`HandshakePolicy::Quorum`] individual node failures are tolerated
/// as long as `max(minimum_threshold, floor(2n / 3))` nodes connect. Under
/// [`HandshakePolicy::Strict`] the first failure aborts. Attestation failures
/// abort under either policy. Hitting the deadline fails the whole handshake.
pub async fn handshake(
    transport: Arc<dyn NodeTransport>,
    verifier: Option<Arc<dyn AttestationVerifier>>,
    config: &ClientConfig,
    epoch: u64,
) -> Result<HandshakeResult> {
    config.validate()?;
    let request_id = new_request_id();
    let total = config.bootstrap_urls.len();
    let connected = AtomicUsize::new(0);
    let node = NodeHandshake {
        transport: transport.as_ref(),
        verifier: verifier.as_deref(),
        config,
        request_id: &request_id,
        epoch,
        connected: &connected,
    };
    let node = &node;

    let run_all = async {
        match config.handshake_policy {
            HandshakePolicy::Quorum => Ok(join_all(
                config
                    .bootstrap_urls
                    .iter()
                    .map(|url| async move { (url.clone(), node.run(url).await) }),
            )
            .await),
            HandshakePolicy::Strict => {
                try_join_all(config.bootstrap_urls.iter().map(|url| async move {
                    node.run(url).await.map(|r| (url.clone(), Ok(r)))
                }))
                .await
            }
        }
    };
    let outcomes: Vec<(NodeUrl, Result<RawHandshakeResponse>)> =
        tokio::time::timeout(config.abort_timeout(), run_all)
            .await
            .map_err(|_| Error::HandshakeTimeout {
                timeout_ms: config.abort_timeout_ms,
                connected: connected.load(Ordering::SeqCst),
                total,
            })??;

    let mut server_keys = BTreeMap::new();
    let mut node_errors = BTreeMap::new();
    for (url, outcome) in outcomes {
        match outcome {
            Ok(response) => {
                server_keys.insert(url, response);
            }
            Err(e @ Error::InvalidNodeAttestation { .. }) => return Err(e),
            Err(e) => {
                warn!(request_id = %request_id, %url, error = %e, "handshake with node failed");
                node_errors.insert(url, e.summary());
            }
        }
    }

    let required = threshold_for(total, config.minimum_threshold);
    if server_keys.len() < required {
        return Err(Error::InsufficientHandshakes {
            connected: server_keys.len(),
            total,
            required,
            node_errors,
        });
    }

    let connected_nodes: BTreeSet<NodeUrl> = server_keys.keys().cloned().collect();
    let consensus_config = ConsensusConfig::from_responses(server_keys.values());
    let threshold = threshold_for(connected_nodes.len(), config.minimum_threshold);
    let epoch = consensus_config
        .as_ref()
        .and_then(|c| c.epoch)
        .unwrap_or(epoch);
    info!(
        request_id = %request_id,
        connected = connected_nodes.len(),
        total,
        threshold,
        epoch,
        "handshake complete"
    );

    Ok(HandshakeResult {
        server_keys,
        connected_nodes,
        consensus_config,
        threshold,
        epoch,
        request_id,
    })
}
