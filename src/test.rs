use std::{
    collections::HashMap,
    error::Error,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use blstrs::{G1Affine, G1Projective};
use chrono::Utc;
use ff::Field;
use group::Group;
use k256::Secp256k1;
use rand_core::OsRng;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::{
    auth::{
        AuthContext, AuthMethod, AuthMethodType, ResourceAbilityRequest, SessionKeyPair,
        SessionSigningTemplate, WalletAuthenticator,
    },
    combine::{bls, ecdsa::deal_signature_shares, SigningScheme},
    compat::SigningCurve,
    e2ee::{open, seal, EncryptedPayload},
    error::TransportError,
    external::{LocalWallet, MemoryStore},
    handshake::threshold_for,
    ops::{
        identity_param, pkp_address, ActionSource, DecryptParams, EncryptParams, ExecuteJsParams,
        PkpAuthenticator, PkpSignParams, ResponseStrategy,
    },
    protocol::{Endpoint, NodeTransport, NodeUrl, Participant, RequestItem},
    Client, ClientConfig,
};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Behavior {
    Honest,
    /// Answers operations only after a delay.
    Slow(Duration),
    /// Reports a failure for every operation.
    Failing,
    /// Reports a failure for every operation, inside the encrypted reply.
    FailingInside,
    /// Handshakes, then becomes unreachable.
    RefusesOperations,
}

struct SimNode {
    url: NodeUrl,
    participant: Participant,
    identity: StaticSecret,
    behavior: Behavior,
}

/// A network of nodes living in this process.
///
/// Shares of each request are dealt once, by whichever node sees the request
/// first, and then handed out to every node.
struct SimNetwork {
    nodes: Vec<SimNode>,
    threshold: usize,
    pkp_secret: k256::Scalar,
    bls_secret: blstrs::Scalar,
    dealt: Mutex<HashMap<String, Vec<Value>>>,
    forget_client_key: AtomicBool,
    handshakes: AtomicUsize,
    requests: Mutex<HashMap<Endpoint, usize>>,
}

impl SimNetwork {
    fn new(behaviors: &[Behavior]) -> Self {
        let nodes = behaviors
            .iter()
            .enumerate()
            .map(|(i, behavior)| SimNode {
                url: NodeUrl::from(format!("http://node{}:7470", i)),
                participant: Participant::from(i as u32),
                identity: StaticSecret::random_from_rng(OsRng),
                behavior: *behavior,
            })
            .collect();
        Self {
            nodes,
            threshold: threshold_for(behaviors.len(), 3),
            pkp_secret: k256::Scalar::random(&mut OsRng),
            bls_secret: blstrs::Scalar::random(&mut OsRng),
            dealt: Mutex::new(HashMap::new()),
            forget_client_key: AtomicBool::new(false),
            handshakes: AtomicUsize::new(0),
            requests: Mutex::new(HashMap::new()),
        }
    }

    fn honest(n: usize) -> Self {
        Self::new(&vec![Behavior::Honest; n])
    }

    fn urls(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.url.to_string()).collect()
    }

    fn participants(&self) -> Vec<Participant> {
        self.nodes.iter().map(|n| n.participant).collect()
    }

    fn pkp_public_key(&self) -> String {
        let point = k256::AffinePoint::from(k256::ProjectivePoint::GENERATOR * self.pkp_secret);
        hex::encode(Secp256k1::encode_point(&point, true))
    }

    fn bls_public_key(&self) -> String {
        hex::encode(G1Affine::from(G1Projective::generator() * self.bls_secret).to_compressed())
    }

    fn requests_to(&self, endpoint: Endpoint) -> usize {
        self.requests
            .lock()
            .unwrap()
            .get(&endpoint)
            .copied()
            .unwrap_or_default()
    }

    /// This node's share of whatever was dealt for `key`.
    fn share(&self, key: String, node: &SimNode, deal: impl FnOnce() -> Vec<Value>) -> Value {
        let mut dealt = self.dealt.lock().unwrap();
        let shares = dealt.entry(key).or_insert_with(deal);
        shares
            .get(u32::from(node.participant) as usize)
            .cloned()
            .unwrap_or(Value::Null)
    }

    fn ecdsa_share(&self, request_id: &str, node: &SimNode, prehash: &[u8]) -> Result<Value, String> {
        let share = self.share(format!("{}:ecdsa:{}", request_id, hex::encode(prehash)), node, || {
            deal_signature_shares::<Secp256k1>(
                &mut OsRng,
                &self.pkp_secret,
                prehash,
                &self.participants(),
                self.threshold,
                SigningScheme::EcdsaK256Sha256,
            )
            .into_iter()
            .flatten()
            .map(|s| serde_json::to_value(s).unwrap_or_default())
            .collect()
        });
        if share.is_null() {
            return Err("could not deal signature shares".to_string());
        }
        Ok(share)
    }

    fn bls_share(&self, request_id: &str, node: &SimNode, message: &[u8]) -> Value {
        self.share(format!("{}:bls:{}", request_id, hex::encode(message)), node, || {
            bls::deal_bls_shares(
                &mut OsRng,
                &self.bls_secret,
                message,
                &self.participants(),
                self.threshold,
            )
            .into_iter()
            .map(|s| serde_json::to_value(s).unwrap_or_default())
            .collect()
        })
    }

    fn handshake(&self, node: &SimNode) -> Value {
        self.handshakes.fetch_add(1, Ordering::SeqCst);
        let bls_key = self.bls_public_key();
        json!({
            "serverPublicKey": hex::encode(PublicKey::from(&node.identity).as_bytes()),
            "subnetPublicKey": bls_key,
            "networkPublicKey": bls_key,
            "networkPublicKeySet": bls_key,
            "hdRootPubkeys": [self.pkp_public_key()],
            "latestBlockhash": "0x6e1a7b4c",
            "nodeIdentityKey": hex::encode(PublicKey::from(&node.identity).as_bytes()),
            "nodeVersion": "sim",
            "epoch": 12,
        })
    }

    /// Check the session signature a request carries was made for this node.
    fn check_session_sig(node: &SimNode, request: &Value) -> Result<(), String> {
        let signed = request["authSig"]["signedMessage"]
            .as_str()
            .ok_or("missing session signature")?;
        let template: SessionSigningTemplate =
            serde_json::from_str(signed).map_err(|e| e.to_string())?;
        if template.node_address != node.url.as_str() {
            return Err(format!("session signature is for {}", template.node_address));
        }
        Ok(())
    }

    fn operation(
        &self,
        node: &SimNode,
        endpoint: Endpoint,
        request_id: &str,
        request: &Value,
    ) -> Result<Value, String> {
        match endpoint {
            Endpoint::PkpSign => {
                Self::check_session_sig(node, request)?;
                let to_sign: Vec<u8> =
                    serde_json::from_value(request["toSign"].clone()).map_err(|e| e.to_string())?;
                let prehash = match request["bypassAutoHashing"].as_bool() {
                    Some(true) => to_sign,
                    _ => Sha256::digest(&to_sign).to_vec(),
                };
                Ok(json!({ "signatureShare": self.ecdsa_share(request_id, node, &prehash)? }))
            }
            Endpoint::EncryptionSign => {
                Self::check_session_sig(node, request)?;
                let hash = request["dataToEncryptHash"].as_str().unwrap_or_default();
                let identity = identity_param(&request["accessControlConditions"], hash)
                    .map_err(|e| e.to_string())?;
                Ok(json!({ "signatureShare": self.bls_share(request_id, node, identity.as_bytes()) }))
            }
            Endpoint::ExecuteJs => {
                Self::check_session_sig(node, request)?;
                let mut signed_data = json!({});
                if let Some(to_sign) = request["jsParams"].get("toSign") {
                    let prehash: Vec<u8> =
                        serde_json::from_value(to_sign.clone()).map_err(|e| e.to_string())?;
                    signed_data["sig1"] = self.ecdsa_share(request_id, node, &prehash)?;
                }
                Ok(json!({
                    "signedData": signed_data,
                    "response": "{\"ok\":true}",
                    "logs": format!("ran on {}", node.url),
                }))
            }
            Endpoint::SignSessionKey => {
                let message = request["siweMessage"].as_str().ok_or("missing siwe message")?;
                let share = self.bls_share(request_id, node, message.as_bytes());
                Ok(json!({
                    "signatureShare": {
                        "ProofOfPossession": {
                            "identifier": share["shareId"],
                            "value": share["value"],
                            "verifyingShare": share["verifyingShare"],
                        }
                    },
                    "siweMessage": message,
                }))
            }
            Endpoint::Handshake => Ok(self.handshake(node)),
        }
    }

    fn answer(&self, node: &SimNode, item: &RequestItem) -> Result<Value, String> {
        let payload: EncryptedPayload =
            serde_json::from_value(item.payload.clone()).map_err(|e| e.to_string())?;
        let EncryptedPayload::V1(v1) = &payload;
        let client_key = v1.verification_key;
        let request: Value = open(&node.identity, &payload)
            .map_err(|e| e.to_string())
            .and_then(|b| serde_json::from_slice(&b).map_err(|e| e.to_string()))?;
        let outcome = match node.behavior {
            Behavior::FailingInside => Err("denied".to_string()),
            _ => self.operation(node, item.endpoint, &item.request_id, &request),
        };
        let reply = match outcome {
            Ok(data) => json!({"success": true, "data": data}),
            Err(message) => json!({"success": false, "error": {"name": "NodeError", "message": message}}),
        };
        let bytes = serde_json::to_vec(&reply).map_err(|e| e.to_string())?;
        let sealed = seal(&mut OsRng, &node.identity, &client_key, &bytes).map_err(|e| e.to_string())?;
        serde_json::to_value(sealed).map_err(|e| e.to_string())
    }
}

#[async_trait]
impl NodeTransport for SimNetwork {
    async fn send(&self, request: &RequestItem) -> Result<Value, TransportError> {
        let node = self
            .nodes
            .iter()
            .find(|n| n.url == request.target_url)
            .ok_or_else(|| TransportError::Network("unknown host".to_string()))?;
        if request.endpoint == Endpoint::Handshake {
            return Ok(self.handshake(node));
        }
        *self
            .requests
            .lock()
            .unwrap()
            .entry(request.endpoint)
            .or_default() += 1;

        match node.behavior {
            Behavior::Honest | Behavior::FailingInside => {}
            Behavior::Slow(delay) => tokio::time::sleep(delay).await,
            Behavior::Failing => {
                return Ok(json!({"success": false, "error": {"name": "NodeError", "message": "boom"}}))
            }
            Behavior::RefusesOperations => {
                return Err(TransportError::Network("connection refused".to_string()))
            }
        }
        if node.participant == Participant::from(0u32)
            && self.forget_client_key.swap(false, Ordering::SeqCst)
        {
            return Ok(json!({
                "success": false,
                "error": {
                    "name": "NodeError",
                    "message": "No secret key found for verification key: 00",
                }
            }));
        }
        self.answer(node, request).map_err(TransportError::Decode)
    }
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn client(network: &Arc<SimNetwork>) -> Result<Client, Box<dyn Error>> {
    let mut config = ClientConfig::new(network.urls());
    config.retry_backoff_ms = 0;
    Ok(Client::builder(config)
        .transport(network.clone())
        .storage(Arc::new(MemoryStore::new()))
        .build()?)
}

fn resources() -> Vec<ResourceAbilityRequest> {
    vec![ResourceAbilityRequest {
        resource: "lit-pkp://*".to_string(),
        ability: "pkp-signing".to_string(),
    }]
}

fn wallet_auth() -> AuthContext {
    AuthContext::new(
        SessionKeyPair::generate(&mut OsRng),
        resources(),
        Utc::now() + chrono::Duration::hours(1),
        Arc::new(WalletAuthenticator::new(Arc::new(LocalWallet::random()), "localhost")),
    )
}

fn sign_params(network: &SimNetwork, auth_context: AuthContext) -> PkpSignParams {
    PkpSignParams {
        pub_key: network.pkp_public_key(),
        to_sign: b"hello world".to_vec(),
        signing_scheme: SigningScheme::EcdsaK256Sha256,
        auth_context,
        chain: "ethereum".to_string(),
        user_max_price: None,
        bypass_auto_hashing: false,
    }
}

fn conditions() -> Value {
    json!([{
        "conditionType": "evmBasic",
        "contractAddress": "",
        "standardContractType": "",
        "chain": "ethereum",
        "method": "",
        "parameters": [":userAddress"],
        "returnValueTest": {"comparator": "=", "value": "0x50e2dac5e78b5905cb09495547452cee64426db2"},
    }])
}

#[tokio::test]
async fn test_pkp_sign() -> Result<(), Box<dyn Error>> {
    init_logging();
    let network = Arc::new(SimNetwork::honest(3));
    let client = client(&network)?;
    let handshake = client.connect().await?;
    assert_eq!(handshake.threshold, 3);
    assert_eq!(handshake.epoch, 12);

    let signature = client.pkp_sign(sign_params(&network, wallet_auth())).await?;
    assert_eq!(signature.signed_data, hex::encode(Sha256::digest(b"hello world")));
    assert!(crate::combine::same_public_key(
        SigningScheme::EcdsaK256Sha256,
        &signature.verifying_key,
        &network.pkp_public_key()
    ));
    assert_eq!(network.requests_to(Endpoint::PkpSign), 3);
    Ok(())
}

#[tokio::test]
async fn test_pkp_sign_prehashed() -> Result<(), Box<dyn Error>> {
    let network = Arc::new(SimNetwork::honest(3));
    let client = client(&network)?;
    client.connect().await?;

    let digest = Sha256::digest(b"already hashed").to_vec();
    let mut params = sign_params(&network, wallet_auth());
    params.to_sign = digest.clone();
    params.bypass_auto_hashing = true;
    let signature = client.pkp_sign(params).await?;
    assert_eq!(signature.signed_data, hex::encode(digest));

    let mut params = sign_params(&network, wallet_auth());
    params.bypass_auto_hashing = true;
    let err = client.pkp_sign(params).await.unwrap_err();
    assert_eq!(err.kind(), "InvalidInput");
    Ok(())
}

#[tokio::test]
async fn test_encrypt_then_decrypt() -> Result<(), Box<dyn Error>> {
    init_logging();
    let network = Arc::new(SimNetwork::honest(4));
    let client = client(&network)?;
    client.connect().await?;

    let encrypted = client
        .encrypt(EncryptParams {
            data: b"attack at dawn".to_vec(),
            access_control_conditions: conditions(),
        })
        .await?;
    // Encryption never touches the nodes.
    assert_eq!(network.requests_to(Endpoint::EncryptionSign), 0);

    let plaintext = client
        .decrypt(DecryptParams {
            ciphertext: encrypted.ciphertext,
            data_to_encrypt_hash: encrypted.data_to_encrypt_hash,
            access_control_conditions: conditions(),
            auth_context: wallet_auth(),
            chain: "ethereum".to_string(),
            user_max_price: None,
        })
        .await?;
    assert_eq!(plaintext, b"attack at dawn");
    Ok(())
}

#[tokio::test]
async fn test_rejected_conditions_are_not_sent() -> Result<(), Box<dyn Error>> {
    let network = Arc::new(SimNetwork::honest(3));
    let client = client(&network)?;
    client.connect().await?;
    let err = client
        .encrypt(EncryptParams {
            data: b"x".to_vec(),
            access_control_conditions: json!([{"chain": "ethereum"}, {"chain": "ethereum"}]),
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "AccessControl");
    Ok(())
}

#[tokio::test]
async fn test_execute_js() -> Result<(), Box<dyn Error>> {
    let network = Arc::new(SimNetwork::honest(3));
    let client = client(&network)?;
    client.connect().await?;

    let digest = Sha256::digest(b"from an action").to_vec();
    let out = client
        .execute_js(ExecuteJsParams {
            source: ActionSource::Code("Lit.Actions.signEcdsa({ toSign, sigName: 'sig1' })".to_string()),
            js_params: Some(json!({ "toSign": digest })),
            auth_context: wallet_auth(),
            response_strategy: ResponseStrategy::MostCommon,
            user_max_price: None,
        })
        .await?;
    assert!(out.success);
    assert_eq!(out.response, json!({"ok": true}));
    assert!(out.logs.starts_with("ran on"));
    let sig = &out.signatures["sig1"];
    assert_eq!(sig.signed_data, hex::encode(&digest));
    assert_eq!(sig.signature.len(), 128);
    Ok(())
}

#[tokio::test]
async fn test_session_key_from_pkp() -> Result<(), Box<dyn Error>> {
    init_logging();
    let network = Arc::new(SimNetwork::honest(3));
    let client = client(&network)?;
    client.connect().await?;

    let authenticator = PkpAuthenticator::new(
        client.clone(),
        network.pkp_public_key(),
        vec![AuthMethod {
            auth_method_type: AuthMethodType::EthWallet,
            access_token: "{\"sig\":\"0x00\"}".to_string(),
        }],
    )
    .into_arc();
    let auth_context = AuthContext::new(
        SessionKeyPair::generate(&mut OsRng),
        resources(),
        Utc::now() + chrono::Duration::hours(1),
        authenticator,
    );

    client
        .pkp_sign(sign_params(&network, auth_context.clone()))
        .await?;
    assert_eq!(network.requests_to(Endpoint::SignSessionKey), 3);

    // The delegation is cached, and only the signing itself goes out again.
    client.pkp_sign(sign_params(&network, auth_context)).await?;
    assert_eq!(network.requests_to(Endpoint::SignSessionKey), 3);
    assert_eq!(network.requests_to(Endpoint::PkpSign), 6);
    Ok(())
}

#[tokio::test]
async fn test_session_key_signature_verifies() -> Result<(), Box<dyn Error>> {
    let network = Arc::new(SimNetwork::honest(3));
    let client = client(&network)?;
    client.connect().await?;

    let session_key = SessionKeyPair::generate(&mut OsRng);
    let auth_sig = client
        .sign_session_key(crate::ops::SignSessionKeyParams {
            session_key_uri: session_key.uri(),
            pkp_public_key: network.pkp_public_key(),
            auth_methods: vec![AuthMethod {
                auth_method_type: AuthMethodType::GoogleJwt,
                access_token: "jwt".to_string(),
            }],
            resources: resources(),
            expiration: Utc::now() + chrono::Duration::hours(1),
            statement: "Lit Protocol session".to_string(),
            user_max_price: None,
        })
        .await?;
    assert_eq!(auth_sig.address, pkp_address(&network.pkp_public_key())?);
    assert_eq!(auth_sig.algo.as_deref(), Some("LIT_BLS"));
    assert!(auth_sig.signed_message.contains(&session_key.uri()));

    let sig: Value = serde_json::from_str(&auth_sig.sig)?;
    let sig = bls::decode_signature(sig["ProofOfPossession"].as_str().unwrap_or_default())
        .ok_or("not a G2 point")?;
    let public_key = bls::decode_public_key(&network.bls_public_key())?;
    assert!(bls::verify(&public_key, auth_sig.signed_message.as_bytes(), &sig));
    Ok(())
}

#[tokio::test]
async fn test_operations_need_a_connection() -> Result<(), Box<dyn Error>> {
    let network = Arc::new(SimNetwork::honest(3));
    let client = client(&network)?;
    assert!(!client.is_ready().await);
    let err = client
        .pkp_sign(sign_params(&network, wallet_auth()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "NotReady");
    assert_eq!(network.handshakes.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn test_forgotten_key_triggers_one_refresh() -> Result<(), Box<dyn Error>> {
    let network = Arc::new(SimNetwork::honest(3));
    let client = client(&network)?;
    client.connect().await?;
    assert_eq!(network.handshakes.load(Ordering::SeqCst), 3);

    network.forget_client_key.store(true, Ordering::SeqCst);
    client.pkp_sign(sign_params(&network, wallet_auth())).await?;
    assert_eq!(network.handshakes.load(Ordering::SeqCst), 6);
    assert_eq!(network.requests_to(Endpoint::PkpSign), 6);
    Ok(())
}

#[tokio::test]
async fn test_quorum_does_not_wait_for_stragglers() -> Result<(), Box<dyn Error>> {
    let slow = Behavior::Slow(Duration::from_secs(30));
    let network = Arc::new(SimNetwork::new(&[
        Behavior::Honest,
        slow,
        Behavior::Honest,
        slow,
        Behavior::Honest,
    ]));
    let client = client(&network)?;
    assert_eq!(client.connect().await?.threshold, 3);

    let signature = tokio::time::timeout(
        Duration::from_secs(5),
        client.pkp_sign(sign_params(&network, wallet_auth())),
    )
    .await??;
    assert_eq!(signature.sig_type, SigningScheme::EcdsaK256Sha256);
    Ok(())
}

#[tokio::test]
async fn test_too_many_failures() -> Result<(), Box<dyn Error>> {
    let network = Arc::new(SimNetwork::new(&[
        Behavior::Honest,
        Behavior::Failing,
        Behavior::RefusesOperations,
        Behavior::Failing,
        Behavior::Honest,
    ]));
    let client = client(&network)?;
    client.connect().await?;

    let err = client
        .pkp_sign(sign_params(&network, wallet_auth()))
        .await
        .unwrap_err();
    match &err {
        crate::Error::OperationFailed {
            operation, source, ..
        } => {
            assert_eq!(operation, "pkp-sign");
            assert_eq!(source.kind(), "AggregatedNodeError");
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(err.summary().message, "boom");
    let node_errors = err.node_errors().ok_or("no node errors")?;
    assert_eq!(node_errors.len(), 3);
    assert_eq!(node_errors[&NodeUrl::from("http://node2:7470")].name, "NetworkError");
    // Nothing in the failure suggests a stale view, so there is no retry.
    assert_eq!(network.requests_to(Endpoint::PkpSign), 5);
    Ok(())
}

#[tokio::test]
async fn test_failures_inside_replies_fail_the_operation() -> Result<(), Box<dyn Error>> {
    let network = Arc::new(SimNetwork::new(&[Behavior::FailingInside; 3]));
    let client = client(&network)?;
    client.connect().await?;

    let err = client
        .execute_js(ExecuteJsParams {
            source: ActionSource::Code("Lit.Actions.setResponse({ response: 'ok' })".to_string()),
            js_params: None,
            auth_context: wallet_auth(),
            response_strategy: ResponseStrategy::MostCommon,
            user_max_price: None,
        })
        .await
        .unwrap_err();
    match &err {
        crate::Error::OperationFailed {
            operation, source, ..
        } => {
            assert_eq!(operation, "execute-js");
            assert_eq!(source.kind(), "AggregatedNodeError");
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(err.summary().message, "denied");
    assert_eq!(err.node_errors().map(|m| m.len()), Some(3));
    assert_eq!(network.requests_to(Endpoint::ExecuteJs), 3);
    Ok(())
}

#[tokio::test]
async fn test_too_few_successes_inside_replies() -> Result<(), Box<dyn Error>> {
    let network = Arc::new(SimNetwork::new(&[
        Behavior::Honest,
        Behavior::FailingInside,
        Behavior::FailingInside,
        Behavior::FailingInside,
        Behavior::Honest,
    ]));
    let client = client(&network)?;
    assert_eq!(client.connect().await?.threshold, 3);

    // Any three replies hold at most two successes.
    let err = client
        .pkp_sign(sign_params(&network, wallet_auth()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "OperationFailed");
    assert_eq!(err.summary().message, "denied");
    let node_errors = err.node_errors().ok_or("no node errors")?;
    assert!(!node_errors.is_empty());
    assert!(node_errors.values().all(|e| e.message == "denied"));
    // Refusals are not a stale view of the network.
    assert_eq!(network.handshakes.load(Ordering::SeqCst), 5);
    Ok(())
}
