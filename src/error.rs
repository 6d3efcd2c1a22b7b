//! Errors produced by the client.
//!
//! Node failures never escape raw: each one is summarized into a
//! [`NodeErrorSummary`] at the point it is observed, and aggregate failures
//! carry the summaries keyed by node.
use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::NodeUrl;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A normalized description of one node's failure.
///
/// Equality and hashing cover every field, which is what the dispatcher uses
/// to find the most common failure in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeErrorSummary {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl NodeErrorSummary {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            code: None,
            status: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Build a summary from the `error` member of a failure envelope.
    ///
    /// Nodes are not consistent about the shape of this member, so this
    /// accepts a bare string as well as an object with any of the usual keys.
    pub fn from_node_value(value: &serde_json::Value) -> Self {
        use serde_json::Value;

        let text = |v: Option<&Value>| -> Option<String> {
            match v? {
                Value::String(s) => Some(s.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            }
        };

        match value {
            Value::Object(map) => {
                let name = text(map.get("name"))
                    .or_else(|| text(map.get("errorKind")))
                    .unwrap_or_else(|| "NodeError".to_string());
                let message = text(map.get("message"))
                    .or_else(|| text(map.get("shortMessage")))
                    .or_else(|| text(map.get("details")))
                    .or_else(|| text(map.get("error")))
                    .unwrap_or_else(|| value.to_string());
                let code = text(map.get("code")).or_else(|| text(map.get("errorCode")));
                let status = map
                    .get("status")
                    .and_then(Value::as_u64)
                    .and_then(|s| u16::try_from(s).ok());
                Self {
                    name,
                    message,
                    code,
                    status,
                }
            }
            Value::String(s) => Self::new("NodeError", s.clone()),
            Value::Null => Self::new("NodeError", "node reported failure without details"),
            other => Self::new("NodeError", other.to_string()),
        }
    }
}

impl fmt::Display for NodeErrorSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code {})", code)?;
        }
        Ok(())
    }
}

/// Failures talking to a single node.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("fetch failed: {0}")]
    Network(String),
    #[error("node answered with http status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("could not decode node response: {0}")]
    Decode(String),
}

impl From<&TransportError> for NodeErrorSummary {
    fn from(e: &TransportError) -> Self {
        match e {
            TransportError::Network(_) => {
                NodeErrorSummary::new("NetworkError", e.to_string()).with_code("network_error")
            }
            TransportError::Status { status, .. } => {
                NodeErrorSummary::new("HttpError", e.to_string()).with_status(*status)
            }
            TransportError::Decode(_) => NodeErrorSummary::new("DecodeError", e.to_string()),
        }
    }
}

/// Failures of the per-node encryption layer.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("No secret key found for verification key: {0}")]
    UnknownVerificationKey(String),
    #[error("no key material for node {0}")]
    UnknownNode(NodeUrl),
    #[error("could not open payload: {0}")]
    Open(String),
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Failures verifying a node's attestation.
#[derive(Debug, Clone, Error)]
pub enum AttestationError {
    #[error("unsupported attestation type {0}")]
    UnsupportedType(String),
    #[error("attestation nonce does not match the challenge")]
    ChallengeMismatch,
    #[error("report data does not match the attested fields")]
    ReportDataMismatch,
    #[error("report signature is invalid: {0}")]
    BadSignature(String),
    #[error("release {0} is not allowed")]
    UnknownRelease(String),
    #[error("malformed attestation: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("client is not ready: {0}")]
    NotReady(String),
    #[error("handshake timed out after {timeout_ms}ms: connected to {connected} of {total} nodes")]
    HandshakeTimeout {
        timeout_ms: u64,
        connected: usize,
        total: usize,
    },
    #[error("node attestation failed verification for {url}: {reason}")]
    InvalidNodeAttestation { url: NodeUrl, reason: String },
    #[error("handshake reached {connected} of {total} nodes, {required} required")]
    InsufficientHandshakes {
        connected: usize,
        total: usize,
        required: usize,
        node_errors: BTreeMap<NodeUrl, NodeErrorSummary>,
    },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(
        "batch {request_id}: not enough successful responses ({success_count}) from \
         {total_requests} attempts, and no errors were reported. Minimum required: {min_success_count}"
    )]
    InsufficientSuccessNoError {
        request_id: String,
        success_count: usize,
        failure_count: usize,
        min_success_count: usize,
        total_requests: usize,
    },
    #[error("batch {request_id}: {representative}")]
    AggregatedNodeError {
        request_id: String,
        representative: NodeErrorSummary,
        node_errors: BTreeMap<NodeUrl, NodeErrorSummary>,
    },
    #[error("no valid shares: {0}")]
    NoValidShares(String),
    #[error("signature verification failed: {0}")]
    SignatureVerificationFailed(String),
    #[error("\"{operation}\" failed for request {request_id}: {source}")]
    OperationFailed {
        operation: String,
        request_id: String,
        #[source]
        source: Box<Error>,
    },
    #[error("node {url} failed: {summary}")]
    Node {
        url: NodeUrl,
        summary: NodeErrorSummary,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("access control conditions rejected ({status}): {message}")]
    AccessControl { status: u16, message: String },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("chain registry error: {0}")]
    Chain(String),
}

impl Error {
    /// A stable name for this kind of error.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotReady(_) => "NotReady",
            Error::HandshakeTimeout { .. } => "HandshakeTimeout",
            Error::InvalidNodeAttestation { .. } => "InvalidNodeAttestation",
            Error::InsufficientHandshakes { .. } => "InsufficientHandshakes",
            Error::InvalidInput(_) => "InvalidInput",
            Error::InsufficientSuccessNoError { .. } => "InsufficientSuccessNoError",
            Error::AggregatedNodeError { .. } => "AggregatedNodeError",
            Error::NoValidShares(_) => "NoValidShares",
            Error::SignatureVerificationFailed(_) => "SignatureVerificationFailed",
            Error::OperationFailed { .. } => "OperationFailed",
            Error::Node { .. } => "NodeError",
            Error::Transport(_) => "NetworkError",
            Error::Codec(_) => "CodecError",
            Error::AccessControl { .. } => "AccessControl",
            Error::Config(_) => "Config",
            Error::Storage(_) => "Storage",
            Error::Chain(_) => "Chain",
        }
    }

    /// The per-node failures behind an aggregate error, if any.
    pub fn node_errors(&self) -> Option<&BTreeMap<NodeUrl, NodeErrorSummary>> {
        match self {
            Error::AggregatedNodeError { node_errors, .. }
            | Error::InsufficientHandshakes { node_errors, .. } => Some(node_errors),
            Error::OperationFailed { source, .. } => source.node_errors(),
            _ => None,
        }
    }

    /// Summarize this error the way a node failure would be summarized.
    pub fn summary(&self) -> NodeErrorSummary {
        match self {
            Error::Transport(e) => e.into(),
            Error::Node { summary, .. } => summary.clone(),
            Error::AggregatedNodeError { representative, .. } => representative.clone(),
            Error::OperationFailed { source, .. } => source.summary(),
            _ => NodeErrorSummary::new(self.kind(), self.to_string()),
        }
    }

    pub(crate) fn operation_failed(
        operation: &str,
        request_id: &str,
        source: Error,
    ) -> Self {
        Error::OperationFailed {
            operation: operation.to_string(),
            request_id: request_id.to_string(),
            source: Box::new(source),
        }
    }
}
