//! The entry point: a handle on a connected network.
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use crate::{
    attestation::AttestationVerifier,
    config::ClientConfig,
    error::{Error, Result},
    external::{AccessControlValidator, ChainRegistry, KeyValueStore, StructuralValidator},
    handshake::{handshake, HandshakeResult},
    protocol::{HttpTransport, NodeTransport},
};

/// A client of a threshold network.
///
/// Cloning is cheap, and clones share the same view of the network. The
/// handshake result is swapped wholesale on refresh; operations in flight keep
/// the one they started with.
#[derive(Clone)]
pub struct Client {
    pub(crate) config: Arc<ClientConfig>,
    pub(crate) transport: Arc<dyn NodeTransport>,
    pub(crate) verifier: Option<Arc<dyn AttestationVerifier>>,
    pub(crate) registry: Option<Arc<dyn ChainRegistry>>,
    pub(crate) validator: Arc<dyn AccessControlValidator>,
    pub(crate) storage: Option<Arc<dyn KeyValueStore>>,
    handshake: Arc<RwLock<Option<Arc<HandshakeResult>>>>,
}

pub struct ClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn NodeTransport>>,
    verifier: Option<Arc<dyn AttestationVerifier>>,
    registry: Option<Arc<dyn ChainRegistry>>,
    validator: Option<Arc<dyn AccessControlValidator>>,
    storage: Option<Arc<dyn KeyValueStore>>,
}

impl ClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            transport: None,
            verifier: None,
            registry: None,
            validator: None,
            storage: None,
        }
    }

    /// Replace the default HTTP transport.
    pub fn transport(mut self, transport: Arc<dyn NodeTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn attestation_verifier(mut self, verifier: Arc<dyn AttestationVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Without a registry, every node is assumed to charge nothing.
    pub fn chain_registry(mut self, registry: Arc<dyn ChainRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn access_control_validator(mut self, validator: Arc<dyn AccessControlValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn KeyValueStore>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn build(self) -> Result<Client> {
        self.config.validate()?;
        if self.config.required_attestation && self.verifier.is_none() {
            return Err(Error::Config(
                "attestation is required but no verifier is configured".to_string(),
            ));
        }
        Ok(Client {
            config: Arc::new(self.config),
            transport: self
                .transport
                .unwrap_or_else(|| Arc::new(HttpTransport::new())),
            verifier: self.verifier,
            registry: self.registry,
            validator: self
                .validator
                .unwrap_or_else(|| Arc::new(StructuralValidator)),
            storage: self.storage,
            handshake: Arc::new(RwLock::new(None)),
        })
    }
}

impl Client {
    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Handshake with the network, replacing any previous view of it.
    pub async fn connect(&self) -> Result<Arc<HandshakeResult>> {
        let epoch = match self.handshake.read().await.as_ref() {
            Some(current) => current.epoch,
            None => self.config.epoch,
        };
        let result = Arc::new(
            handshake(
                self.transport.clone(),
                self.verifier.clone(),
                &self.config,
                epoch,
            )
            .await?,
        );
        *self.handshake.write().await = Some(result.clone());
        Ok(result)
    }

    /// Handshake again after a failure, recording why.
    pub async fn refresh(&self, reason: &str) -> Result<()> {
        info!(reason, "refreshing handshake");
        self.connect().await.map(|_| ())
    }

    /// The current view of the network, if connected.
    pub async fn handshake_result(&self) -> Option<Arc<HandshakeResult>> {
        self.handshake.read().await.clone()
    }

    pub async fn is_ready(&self) -> bool {
        self.handshake.read().await.is_some()
    }

    pub(crate) async fn require_handshake(&self) -> Result<Arc<HandshakeResult>> {
        self.handshake_result().await.ok_or_else(|| {
            Error::NotReady("call connect() before running operations".to_string())
        })
    }
}
