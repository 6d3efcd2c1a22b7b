//! Authorizing requests to the nodes.
//!
//! Every request carries a session signature: a fresh ed25519 session key
//! signs, for each node separately, a template naming the node and the most
//! it may charge. The template embeds capabilities proving the session key
//! was delegated by an account, either an externally owned wallet or a PKP.
use std::{collections::BTreeMap, fmt, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use ed25519_dalek::{Signer, SigningKey};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    external::MessageSigner,
    jit::NodeMaxPrice,
    protocol::NodeUrl,
    serde::decode_hex,
};

/// The ways a PKP can be authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum AuthMethodType {
    EthWallet,
    LitAction,
    WebAuthn,
    Discord,
    Google,
    GoogleJwt,
    AppleJwt,
    StytchOtp,
    StytchEmailFactorOtp,
    StytchSmsFactorOtp,
    StytchWhatsAppFactorOtp,
    StytchTotpFactorOtp,
}

const AUTH_METHOD_TYPES: [(AuthMethodType, u32, &str); 12] = [
    (AuthMethodType::EthWallet, 1, "EthWallet"),
    (AuthMethodType::LitAction, 2, "LitAction"),
    (AuthMethodType::WebAuthn, 3, "WebAuthn"),
    (AuthMethodType::Discord, 4, "Discord"),
    (AuthMethodType::Google, 5, "Google"),
    (AuthMethodType::GoogleJwt, 6, "GoogleJwt"),
    (AuthMethodType::AppleJwt, 8, "AppleJwt"),
    (AuthMethodType::StytchOtp, 9, "StytchOtp"),
    (AuthMethodType::StytchEmailFactorOtp, 10, "StytchEmailFactorOtp"),
    (AuthMethodType::StytchSmsFactorOtp, 11, "StytchSmsFactorOtp"),
    (AuthMethodType::StytchWhatsAppFactorOtp, 12, "StytchWhatsAppFactorOtp"),
    (AuthMethodType::StytchTotpFactorOtp, 13, "StytchTotpFactorOtp"),
];

impl AuthMethodType {
    pub fn id(self) -> u32 {
        AUTH_METHOD_TYPES
            .iter()
            .find(|(t, _, _)| *t == self)
            .map(|(_, id, _)| *id)
            .unwrap_or_default()
    }

    pub fn name(self) -> &'static str {
        AUTH_METHOD_TYPES
            .iter()
            .find(|(t, _, _)| *t == self)
            .map(|(_, _, name)| *name)
            .unwrap_or_default()
    }

    pub fn from_id(id: u32) -> Option<Self> {
        AUTH_METHOD_TYPES
            .iter()
            .find(|(_, i, _)| *i == id)
            .map(|(t, _, _)| *t)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        AUTH_METHOD_TYPES
            .iter()
            .find(|(_, _, n)| *n == name)
            .map(|(t, _, _)| *t)
    }
}

impl From<AuthMethodType> for u32 {
    fn from(t: AuthMethodType) -> Self {
        t.id()
    }
}

impl TryFrom<u32> for AuthMethodType {
    type Error = String;

    fn try_from(id: u32) -> std::result::Result<Self, Self::Error> {
        Self::from_id(id).ok_or_else(|| format!("unknown auth method type {}", id))
    }
}

/// A credential proving control of a PKP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthMethod {
    pub auth_method_type: AuthMethodType,
    pub access_token: String,
}

/// A signature over a message, with enough context to check it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSig {
    pub sig: String,
    pub derived_via: String,
    pub signed_message: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algo: Option<String>,
}

/// What a session is allowed to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAbilityRequest {
    /// A resource uri, like `lit-pkp://*`.
    pub resource: String,
    pub ability: String,
}

/// An ed25519 key pair living for one session.
pub struct SessionKeyPair {
    signing_key: SigningKey,
}

impl SessionKeyPair {
    pub fn generate(rng: &mut impl CryptoRngCore) -> Self {
        Self {
            signing_key: SigningKey::generate(rng),
        }
    }

    pub fn from_secret_hex(secret: &str) -> Result<Self> {
        let bytes: [u8; 32] = decode_hex(secret)
            .ok()
            .and_then(|b| b.get(..32).and_then(|b| b.try_into().ok()))
            .ok_or_else(|| Error::InvalidInput("session secret key must be 32 bytes of hex".to_string()))?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&bytes),
        })
    }

    pub fn public_key(&self) -> String {
        hex::encode(self.signing_key.verifying_key().as_bytes())
    }

    /// The uri nodes know this session key by.
    pub fn uri(&self) -> String {
        format!("lit:session:{}", self.public_key())
    }

    pub fn sign(&self, message: &[u8]) -> String {
        hex::encode(self.signing_key.sign(message).to_bytes())
    }
}

impl fmt::Debug for SessionKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeyPair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// A Sign-In with Ethereum message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiweMessage {
    pub domain: String,
    pub address: String,
    pub statement: String,
    pub uri: String,
    pub chain_id: u64,
    pub nonce: String,
    pub issued_at: DateTime<Utc>,
    pub expiration_time: DateTime<Utc>,
    pub resources: Vec<String>,
}

impl fmt::Display for SiweMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} wants you to sign in with your Ethereum account:", self.domain)?;
        writeln!(f, "{}", self.address)?;
        writeln!(f)?;
        writeln!(f, "{}", self.statement)?;
        writeln!(f)?;
        writeln!(f, "URI: {}", self.uri)?;
        writeln!(f, "Version: 1")?;
        writeln!(f, "Chain ID: {}", self.chain_id)?;
        writeln!(f, "Nonce: {}", self.nonce)?;
        writeln!(f, "Issued At: {}", self.issued_at.to_rfc3339_opts(SecondsFormat::Millis, true))?;
        write!(
            f,
            "Expiration Time: {}",
            self.expiration_time.to_rfc3339_opts(SecondsFormat::Millis, true)
        )?;
        if !self.resources.is_empty() {
            write!(f, "\nResources:")?;
            for r in &self.resources {
                write!(f, "\n- {}", r)?;
            }
        }
        Ok(())
    }
}

/// The parameters an account is asked to delegate a session key for.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub session_key_uri: String,
    pub resources: Vec<ResourceAbilityRequest>,
    pub expiration: DateTime<Utc>,
    pub statement: String,
    /// A recent block hash, used as the nonce.
    pub nonce: String,
}

impl AuthRequest {
    pub fn siwe_message(&self, domain: &str, address: &str, now: DateTime<Utc>) -> SiweMessage {
        SiweMessage {
            domain: domain.to_string(),
            address: address.to_string(),
            statement: self.statement.clone(),
            uri: self.session_key_uri.clone(),
            chain_id: 1,
            nonce: self.nonce.clone(),
            issued_at: now,
            expiration_time: self.expiration,
            resources: self
                .resources
                .iter()
                .map(|r| format!("{}#{}", r.resource, r.ability))
                .collect(),
        }
    }
}

/// Produces the capability delegating a session key to an account.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, request: &AuthRequest) -> Result<AuthSig>;
}

/// Delegates a session key from an externally owned wallet.
pub struct WalletAuthenticator {
    signer: Arc<dyn MessageSigner>,
    domain: String,
}

impl WalletAuthenticator {
    pub fn new(signer: Arc<dyn MessageSigner>, domain: impl Into<String>) -> Self {
        Self {
            signer,
            domain: domain.into(),
        }
    }
}

#[async_trait]
impl Authenticator for WalletAuthenticator {
    async fn authenticate(&self, request: &AuthRequest) -> Result<AuthSig> {
        let address = self.signer.address();
        let message = request.siwe_message(&self.domain, &address, Utc::now()).to_string();
        let sig = self.signer.sign_message(message.as_bytes()).await?;
        Ok(AuthSig {
            sig,
            derived_via: "web3.eth.personal.sign".to_string(),
            signed_message: message,
            address,
            algo: None,
        })
    }
}

/// Everything needed to authorize requests on a user's behalf.
#[derive(Clone)]
pub struct AuthContext {
    pub session_key: Arc<SessionKeyPair>,
    pub resources: Vec<ResourceAbilityRequest>,
    pub expiration: DateTime<Utc>,
    pub statement: String,
    /// Extra capabilities, such as payment delegations.
    pub capability_auth_sigs: Vec<AuthSig>,
    pub authenticator: Arc<dyn Authenticator>,
}

impl fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthContext")
            .field("session_key", &self.session_key)
            .field("resources", &self.resources)
            .field("expiration", &self.expiration)
            .finish_non_exhaustive()
    }
}

impl AuthContext {
    pub fn new(
        session_key: SessionKeyPair,
        resources: Vec<ResourceAbilityRequest>,
        expiration: DateTime<Utc>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            session_key: Arc::new(session_key),
            resources,
            expiration,
            statement: "Lit Protocol session".to_string(),
            capability_auth_sigs: Vec::new(),
            authenticator,
        }
    }

    pub fn auth_request(&self, nonce: &str) -> AuthRequest {
        AuthRequest {
            session_key_uri: self.session_key.uri(),
            resources: self.resources.clone(),
            expiration: self.expiration,
            statement: self.statement.clone(),
            nonce: nonce.to_string(),
        }
    }
}

/// The message a session key signs for one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSigningTemplate {
    pub session_key: String,
    pub resource_ability_requests: Vec<ResourceAbilityRequest>,
    pub capabilities: Vec<AuthSig>,
    pub issued_at: String,
    pub expiration: String,
    pub node_address: String,
    pub max_price: String,
}

pub type SessionSigs = BTreeMap<NodeUrl, AuthSig>;

/// Sign one session template per node.
///
/// `capability` is the account's delegation to the session key; it is
/// appended after the context's extra capabilities.
pub fn session_sigs(
    auth: &AuthContext,
    capability: AuthSig,
    max_prices: &[NodeMaxPrice],
    issued_at: DateTime<Utc>,
) -> Result<SessionSigs> {
    let mut capabilities = auth.capability_auth_sigs.clone();
    capabilities.push(capability);
    let public_key = auth.session_key.public_key();

    let mut out = SessionSigs::new();
    for price in max_prices {
        let template = SessionSigningTemplate {
            session_key: public_key.clone(),
            resource_ability_requests: auth.resources.clone(),
            capabilities: capabilities.clone(),
            issued_at: issued_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            expiration: auth.expiration.to_rfc3339_opts(SecondsFormat::Millis, true),
            node_address: price.url.to_string(),
            max_price: price.max_price.to_string(),
        };
        let signed_message = serde_json::to_string(&template)
            .map_err(|e| Error::InvalidInput(format!("session template: {}", e)))?;
        out.insert(
            price.url.clone(),
            AuthSig {
                sig: auth.session_key.sign(signed_message.as_bytes()),
                derived_via: "litSessionSignViaNacl".to_string(),
                signed_message,
                address: public_key.clone(),
                algo: Some("ed25519".to_string()),
            },
        );
    }
    Ok(out)
}
