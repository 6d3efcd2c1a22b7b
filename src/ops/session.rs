use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::OperationContext;
use crate::{
    auth::{AuthMethod, AuthRequest, AuthSig, Authenticator, ResourceAbilityRequest},
    client::Client,
    combine::{bls, BlsSignatureShare},
    compat::{eth_address, SigningCurve},
    error::{Error, Result},
    external::{format_address, load_value, store_value},
    jit::Product,
    protocol::{most_common, Endpoint, NodeUrl, Participant},
};

const OPERATION: &str = "sign-session-key";

#[derive(Debug, Clone)]
pub struct SignSessionKeyParams {
    /// The `lit:session:` uri of the session key being delegated.
    pub session_key_uri: String,
    pub pkp_public_key: String,
    pub auth_methods: Vec<AuthMethod>,
    pub resources: Vec<ResourceAbilityRequest>,
    pub expiration: DateTime<Utc>,
    pub statement: String,
    pub user_max_price: Option<u128>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SignSessionKeyRequest<'a> {
    pub session_key: &'a str,
    pub auth_methods: &'a [AuthMethod],
    pub pkp_public_key: &'a str,
    pub siwe_message: &'a str,
    pub curve_type: &'static str,
    pub epoch: u64,
    pub node_set: &'a [NodeUrl],
    pub max_price: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ProofOfPossessionShare {
    pub identifier: Participant,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verifying_share: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum SessionSignatureShare {
    ProofOfPossession(ProofOfPossessionShare),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SignSessionKeyResponse {
    pub signature_share: SessionSignatureShare,
    pub siwe_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedAuthSig {
    auth_sig: AuthSig,
    expiration: DateTime<Utc>,
}

/// Re-serialize JSON text in a canonical way, unescaping it first if needed.
///
/// Anything that is not JSON is returned as is.
pub(crate) fn normalize_and_stringify(input: &str) -> String {
    let mut current = input.to_string();
    loop {
        if !current.starts_with('{') && !current.starts_with('[') {
            return current;
        }
        if let Ok(value) = serde_json::from_str::<Value>(&current) {
            return value.to_string();
        }
        let unescaped = unescape_once(&current);
        if unescaped == current {
            return current;
        }
        current = unescaped;
    }
}

fn unescape_once(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match (c, chars.clone().next()) {
            ('\\', Some(next)) => {
                out.push(next);
                chars.next();
            }
            _ => out.push(c),
        }
    }
    out
}

/// The Ethereum address controlled by a PKP.
pub fn pkp_address(pkp_public_key: &str) -> Result<String> {
    let bytes = crate::serde::decode_hex(pkp_public_key)
        .map_err(|e| Error::InvalidInput(format!("pkp public key: {}", e)))?;
    let point = k256::Secp256k1::decode_point(&bytes)
        .ok_or_else(|| Error::InvalidInput("pkp public key is not a secp256k1 point".to_string()))?;
    Ok(format_address(&eth_address(&point)))
}

fn cache_key(params: &SignSessionKeyParams) -> String {
    format!("lit-session-key:{}:{}", params.pkp_public_key, params.session_key_uri)
}

impl Client {
    /// Have the nodes sign a session key on behalf of a PKP.
    ///
    /// The result is cached in the configured storage until it expires.
    pub async fn sign_session_key(&self, params: SignSessionKeyParams) -> Result<AuthSig> {
        if params.auth_methods.is_empty() {
            return Err(Error::InvalidInput("at least one auth method is required".to_string()));
        }
        let address = pkp_address(&params.pkp_public_key)?;
        if let Some(storage) = &self.storage {
            if let Some(cached) = load_value::<CachedAuthSig>(storage.as_ref(), &cache_key(&params)).await? {
                if cached.expiration > Utc::now() {
                    debug!(pkp = %params.pkp_public_key, "using cached session key signature");
                    return Ok(cached.auth_sig);
                }
            }
        }

        let (p, a) = (&params, address.as_str());
        let auth_sig = self
            .run_operation(OPERATION, Product::SignSessionKey, move |ctx| {
                self.sign_session_key_once(ctx, p, a)
            })
            .await?;

        if let Some(storage) = &self.storage {
            let cached = CachedAuthSig {
                auth_sig: auth_sig.clone(),
                expiration: params.expiration,
            };
            store_value(storage.as_ref(), &cache_key(&params), &cached).await?;
        }
        Ok(auth_sig)
    }

    async fn sign_session_key_once(
        &self,
        ctx: OperationContext,
        params: &SignSessionKeyParams,
        address: &str,
    ) -> Result<AuthSig> {
        let consensus = ctx.handshake.consensus()?;
        let network_key = bls::decode_public_key(&consensus.network_public_key)?;
        let request = AuthRequest {
            session_key_uri: params.session_key_uri.clone(),
            resources: params.resources.clone(),
            expiration: params.expiration,
            statement: params.statement.clone(),
            nonce: ctx.latest_blockhash(),
        };
        let siwe_message = request
            .siwe_message(&self.config.siwe_domain, address, Utc::now())
            .to_string();

        let max_prices = ctx
            .jit
            .pricing(Product::SignSessionKey, params.user_max_price, ctx.threshold())
            .max_prices()?;
        let node_set = ctx.node_set();
        let requests = self.build_requests(&ctx, Endpoint::SignSessionKey, |url| {
            let max_price = max_prices
                .iter()
                .find(|p| &p.url == url)
                .map(|p| p.max_price)
                .unwrap_or_default();
            Ok(SignSessionKeyRequest {
                session_key: &params.session_key_uri,
                auth_methods: &params.auth_methods,
                pkp_public_key: &params.pkp_public_key,
                siwe_message: &siwe_message,
                curve_type: "BLS",
                epoch: ctx.handshake.epoch,
                node_set: &node_set,
                max_price: max_price.to_string(),
            })
        })?;

        let responses: Vec<(NodeUrl, SignSessionKeyResponse)> =
            self.send_requests(&ctx, OPERATION, requests).await?;
        let messages: Vec<&str> = responses.iter().map(|(_, r)| r.siwe_message.as_str()).collect();
        let signed_message = most_common(&messages)
            .map(|m| normalize_and_stringify(m))
            .ok_or_else(|| Error::NoValidShares("no session key signature shares".to_string()))?;
        let shares: Vec<BlsSignatureShare> = responses
            .iter()
            .filter(|(_, r)| normalize_and_stringify(&r.siwe_message) == signed_message)
            .map(|(_, r)| {
                let SessionSignatureShare::ProofOfPossession(share) = &r.signature_share;
                BlsSignatureShare {
                    share_id: share.identifier,
                    value: share.value.clone(),
                    verifying_share: share.verifying_share.clone(),
                }
            })
            .collect();

        let signature = bls::combine_bls_shares(&shares, &network_key, signed_message.as_bytes(), ctx.threshold())?;
        info!(request_id = %ctx.request_id, "session key signed");
        Ok(AuthSig {
            sig: json!({ "ProofOfPossession": bls::encode_signature(&signature) }).to_string(),
            derived_via: "lit.bls".to_string(),
            signed_message,
            address: address.to_string(),
            algo: Some("LIT_BLS".to_string()),
        })
    }
}

/// Delegates a session key from a PKP, by having the nodes sign for it.
pub struct PkpAuthenticator {
    client: Client,
    pkp_public_key: String,
    auth_methods: Vec<AuthMethod>,
    user_max_price: Option<u128>,
}

impl PkpAuthenticator {
    pub fn new(client: Client, pkp_public_key: impl Into<String>, auth_methods: Vec<AuthMethod>) -> Self {
        Self {
            client,
            pkp_public_key: pkp_public_key.into(),
            auth_methods,
            user_max_price: None,
        }
    }

    pub fn with_user_max_price(mut self, max_price: u128) -> Self {
        self.user_max_price = Some(max_price);
        self
    }

    pub fn into_arc(self) -> Arc<dyn Authenticator> {
        Arc::new(self)
    }
}

#[async_trait]
impl Authenticator for PkpAuthenticator {
    async fn authenticate(&self, request: &AuthRequest) -> Result<AuthSig> {
        self.client
            .sign_session_key(SignSessionKeyParams {
                session_key_uri: request.session_key_uri.clone(),
                pkp_public_key: self.pkp_public_key.clone(),
                auth_methods: self.auth_methods.clone(),
                resources: request.resources.clone(),
                expiration: request.expiration,
                statement: request.statement.clone(),
                user_max_price: self.user_max_price,
            })
            .await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_normalize_and_stringify() {
        assert_eq!(normalize_and_stringify("plain text"), "plain text");
        assert_eq!(normalize_and_stringify("{\"a\": 1}"), "{\"a\":1}");
        assert_eq!(normalize_and_stringify(r#"{\"a\":\"b\"}"#), r#"{"a":"b"}"#);
        assert_eq!(normalize_and_stringify("{broken"), "{broken");
    }

    #[test]
    fn test_pkp_address() {
        // The public key of the secret key 1.
        let g = "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";
        assert_eq!(
            pkp_address(g).unwrap(),
            "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf"
        );
        assert!(pkp_address("0x05").is_err());
    }

    #[test]
    fn test_share_wire_format() {
        let share: SessionSignatureShare = serde_json::from_value(json!({
            "ProofOfPossession": {"identifier": 2, "value": "ab"}
        }))
        .unwrap();
        let SessionSignatureShare::ProofOfPossession(share) = share;
        assert_eq!(share.identifier, Participant::from(2u32));
    }
}
