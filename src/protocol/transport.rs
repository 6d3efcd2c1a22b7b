//! Moving request bodies to nodes and bringing responses back.
use async_trait::async_trait;
use serde_json::Value;
use tracing::trace;

use crate::{error::TransportError, protocol::RequestItem};

/// Something able to deliver a request to a single node.
///
/// Implementations only move bytes: envelope interpretation and error
/// summarization happen in the dispatcher.
#[async_trait]
pub trait NodeTransport: Send + Sync {
    async fn send(&self, request: &RequestItem) -> Result<Value, TransportError>;
}

/// JSON over HTTP(S).
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeTransport for HttpTransport {
    async fn send(&self, request: &RequestItem) -> Result<Value, TransportError> {
        let url = request.url();
        trace!(request_id = %request.request_id, %url, "sending node request");
        let response = self
            .client
            .post(&url)
            .header("X-Request-Id", &request.request_id)
            .header("X-Lit-SDK-Version", &request.version)
            .header("X-Lit-SDK-Type", "Rust")
            .header("X-Epoch", request.epoch.to_string())
            .json(&request.payload)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        match (status.is_success(), serde_json::from_str::<Value>(&text)) {
            (true, Ok(body)) => Ok(body),
            (true, Err(e)) => Err(TransportError::Decode(e.to_string())),
            // Failure envelopes often come with an error status; keep them so
            // the node's own error description survives.
            (false, Ok(body)) if body.get("success").is_some() => Ok(body),
            (false, _) => Err(TransportError::Status {
                status: status.as_u16(),
                body: text,
            }),
        }
    }
}
