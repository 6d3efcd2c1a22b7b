//! Client configuration.
//!
//! Configuration is plain data: it can be built in code, read from a TOML or
//! JSON file, and overridden from the environment.
use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    protocol::{Endpoint, NodeUrl},
};

/// How the handshake treats individual node failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakePolicy {
    /// Any node failure aborts the handshake.
    Strict,
    /// Node failures are tolerated as long as enough nodes connect.
    #[default]
    Quorum,
}

/// A path on the node API together with the version header sent with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub path: String,
    pub version: String,
}

impl EndpointConfig {
    fn new(path: &str, version: &str) -> Self {
        Self {
            path: path.to_string(),
            version: version.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub handshake: EndpointConfig,
    pub sign_session_key: EndpointConfig,
    pub execute_js: EndpointConfig,
    pub pkp_sign: EndpointConfig,
    pub encryption_sign: EndpointConfig,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            handshake: EndpointConfig::new("/web/handshake", "/"),
            sign_session_key: EndpointConfig::new("/web/sign_session_key", "/v2"),
            execute_js: EndpointConfig::new("/web/execute", "/v2"),
            pkp_sign: EndpointConfig::new("/web/pkp/sign", "/v2"),
            encryption_sign: EndpointConfig::new("/web/encryption/sign", "/v2"),
        }
    }
}

impl Endpoints {
    pub fn get(&self, endpoint: Endpoint) -> &EndpointConfig {
        match endpoint {
            Endpoint::Handshake => &self.handshake,
            Endpoint::SignSessionKey => &self.sign_session_key,
            Endpoint::ExecuteJs => &self.execute_js,
            Endpoint::PkpSign => &self.pkp_sign,
            Endpoint::EncryptionSign => &self.encryption_sign,
        }
    }

    /// The full path for an endpoint, version suffix included.
    pub fn path(&self, endpoint: Endpoint) -> String {
        let e = self.get(endpoint);
        match e.version.trim_end_matches('/') {
            "" => e.path.clone(),
            v => format!("{}{}", e.path, v),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// The nodes to handshake with.
    pub bootstrap_urls: Vec<NodeUrl>,
    /// A floor on the signing threshold, whatever the number of connected nodes.
    pub minimum_threshold: usize,
    /// Global deadline for the handshake, in milliseconds.
    pub abort_timeout_ms: u64,
    /// Require every node to present a verifiable attestation.
    pub required_attestation: bool,
    pub handshake_policy: HandshakePolicy,
    /// Delay before retrying after a recoverable failure, in milliseconds.
    pub retry_backoff_ms: u64,
    /// The epoch to use until a handshake reports one.
    pub epoch: u64,
    /// Client version sent to the nodes.
    pub version: String,
    /// The domain named in Sign-In with Ethereum messages.
    pub siwe_domain: String,
    pub endpoints: Endpoints,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bootstrap_urls: Vec::new(),
            minimum_threshold: 3,
            abort_timeout_ms: 20_000,
            required_attestation: false,
            handshake_policy: HandshakePolicy::default(),
            retry_backoff_ms: 1_000,
            epoch: 0,
            version: env!("CARGO_PKG_VERSION").to_string(),
            siwe_domain: "localhost".to_string(),
            endpoints: Endpoints::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(bootstrap_urls: impl IntoIterator<Item = impl Into<NodeUrl>>) -> Self {
        Self {
            bootstrap_urls: bootstrap_urls.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn abort_timeout(&self) -> Duration {
        Duration::from_millis(self.abort_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Load a configuration file, picking the format from its extension.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        let config: Self = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => {
                toml::from_str(&content).map_err(|e| Error::Config(format!("invalid TOML: {}", e)))?
            }
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("invalid JSON: {}", e)))?,
            _ => return Err(Error::Config("unsupported file format".to_string())),
        };
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from `LIT_QUORUM_*` environment variables.
    pub fn merge_with_env(&mut self) -> Result<()> {
        if let Ok(urls) = std::env::var("LIT_QUORUM_BOOTSTRAP_URLS") {
            self.bootstrap_urls = urls
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(NodeUrl::from)
                .collect();
        }
        if let Ok(s) = std::env::var("LIT_QUORUM_MINIMUM_THRESHOLD") {
            self.minimum_threshold = s
                .parse()
                .map_err(|_| Error::Config("invalid LIT_QUORUM_MINIMUM_THRESHOLD".to_string()))?;
        }
        if let Ok(s) = std::env::var("LIT_QUORUM_ABORT_TIMEOUT_MS") {
            self.abort_timeout_ms = s
                .parse()
                .map_err(|_| Error::Config("invalid LIT_QUORUM_ABORT_TIMEOUT_MS".to_string()))?;
        }
        if let Ok(s) = std::env::var("LIT_QUORUM_REQUIRED_ATTESTATION") {
            self.required_attestation = s
                .parse()
                .map_err(|_| Error::Config("invalid LIT_QUORUM_REQUIRED_ATTESTATION".to_string()))?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.bootstrap_urls.is_empty() {
            return Err(Error::Config("at least one bootstrap url is required".to_string()));
        }
        if self.minimum_threshold == 0 {
            return Err(Error::Config("minimum threshold cannot be 0".to_string()));
        }
        if self.minimum_threshold > self.bootstrap_urls.len() {
            return Err(Error::Config(format!(
                "minimum threshold {} exceeds the {} bootstrap urls",
                self.minimum_threshold,
                self.bootstrap_urls.len()
            )));
        }
        let mut urls = self.bootstrap_urls.clone();
        urls.sort();
        urls.dedup();
        if urls.len() != self.bootstrap_urls.len() {
            return Err(Error::Config("bootstrap urls contain duplicates".to_string()));
        }
        if self.abort_timeout_ms == 0 {
            return Err(Error::Config("abort timeout cannot be 0".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::error::Error;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::new(["http://a:1", "http://b:1", "http://c:1"]);
        assert_eq!(config.abort_timeout(), Duration::from_secs(20));
        assert_eq!(config.minimum_threshold, 3);
        assert_eq!(config.handshake_policy, HandshakePolicy::Quorum);
        assert!(config.validate().is_ok());
        assert_eq!(config.endpoints.path(Endpoint::PkpSign), "/web/pkp/sign/v2");
        assert_eq!(config.endpoints.path(Endpoint::Handshake), "/web/handshake");
    }

    #[test]
    fn test_from_toml() -> Result<(), Box<dyn Error>> {
        let config: ClientConfig = toml::from_str(
            r#"
            bootstrap_urls = ["https://n1:7470", "https://n2:7470"]
            minimum_threshold = 2
            handshake_policy = "strict"

            [endpoints.execute_js]
            path = "/web/execute"
            version = "/v3"
            "#,
        )?;
        config.validate()?;
        assert_eq!(config.bootstrap_urls.len(), 2);
        assert_eq!(config.handshake_policy, HandshakePolicy::Strict);
        assert_eq!(config.endpoints.path(Endpoint::ExecuteJs), "/web/execute/v3");
        assert_eq!(config.endpoints.path(Endpoint::PkpSign), "/web/pkp/sign/v2");
        assert_eq!(config.abort_timeout_ms, 20_000);
        Ok(())
    }

    #[test]
    fn test_rejects_bad_thresholds() {
        let mut config = ClientConfig::new(["http://a:1", "http://b:1"]);
        assert!(config.validate().is_err());
        config.minimum_threshold = 0;
        assert!(config.validate().is_err());
        config.minimum_threshold = 2;
        assert!(config.validate().is_ok());
        config.bootstrap_urls.push(NodeUrl::from("http://a:1"));
        assert!(config.validate().is_err());
    }
}
