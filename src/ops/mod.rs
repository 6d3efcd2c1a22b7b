//! The operations a client can run against the network.
//!
//! Every operation goes through the same steps: take the current handshake
//! and derive a fresh [`JitContext`], build one encrypted request per
//! connected node, dispatch them until a threshold succeed, decrypt the
//! answers, then combine and verify the shares. The whole sequence is retried
//! once, against a refreshed handshake, on recognized transient failures.
use std::{future::Future, sync::Arc};

use chrono::Utc;
use rand_core::OsRng;
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::{
    auth::{session_sigs, AuthContext, SessionSigs},
    client::Client,
    e2ee::{decrypt_batch, encrypt_for_node, parse},
    error::{CodecError, Error, Result},
    external::fetch_node_prices,
    handshake::HandshakeResult,
    jit::{JitContext, Product},
    protocol::{dispatch, new_request_id, Endpoint, NodeUrl, RequestItem},
    retry::execute_with_handshake,
};

pub mod decrypt;
pub mod execute;
pub mod pkp_sign;
pub mod session;

pub use decrypt::{identity_param, DecryptParams, EncryptParams, EncryptResponse};
pub use execute::{ActionSource, ExecuteJsParams, ExecuteJsResponse, ResponseStrategy};
pub use pkp_sign::PkpSignParams;
pub use session::{pkp_address, PkpAuthenticator, SignSessionKeyParams};

/// The state one attempt of an operation runs against.
pub(crate) struct OperationContext {
    pub handshake: Arc<HandshakeResult>,
    pub jit: JitContext,
    pub request_id: String,
}

impl OperationContext {
    pub fn threshold(&self) -> usize {
        self.handshake.threshold
    }

    pub fn node_set(&self) -> Vec<NodeUrl> {
        self.handshake.connected_nodes.iter().cloned().collect()
    }

    pub fn latest_blockhash(&self) -> String {
        self.handshake
            .consensus_config
            .as_ref()
            .and_then(|c| c.latest_blockhash.clone())
            .unwrap_or_default()
    }
}

impl Client {
    async fn operation_context(&self, product: Product) -> Result<OperationContext> {
        let handshake = self.require_handshake().await?;
        let prices = match &self.registry {
            Some(registry) => fetch_node_prices(registry.as_ref(), product).await?,
            None => Vec::new(),
        };
        let jit = JitContext::new(&mut OsRng, &handshake, prices)?;
        Ok(OperationContext {
            handshake,
            jit,
            request_id: new_request_id(),
        })
    }

    /// Run an operation with a fresh context, retrying once after a refresh.
    pub(crate) async fn run_operation<T, F, Fut>(&self, operation: &str, product: Product, runner: F) -> Result<T>
    where
        F: FnMut(OperationContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        execute_with_handshake(
            operation,
            self.config.retry_backoff(),
            || self.operation_context(product),
            |label| async move { self.refresh(&label).await },
            runner,
        )
        .await
    }

    /// Sign a session template for every connected node.
    pub(crate) async fn session_sigs(
        &self,
        ctx: &OperationContext,
        auth: &AuthContext,
        product: Product,
        user_max_price: Option<u128>,
    ) -> Result<SessionSigs> {
        let capability = auth
            .authenticator
            .authenticate(&auth.auth_request(&ctx.latest_blockhash()))
            .await?;
        let max_prices = ctx
            .jit
            .pricing(product, user_max_price, ctx.threshold())
            .max_prices()?;
        session_sigs(auth, capability, &max_prices, Utc::now())
    }

    /// Encrypt one payload per connected node.
    pub(crate) fn build_requests<P, F>(
        &self,
        ctx: &OperationContext,
        endpoint: Endpoint,
        mut payload_for: F,
    ) -> Result<Vec<RequestItem>>
    where
        P: Serialize,
        F: FnMut(&NodeUrl) -> Result<P>,
    {
        let path = self.config.endpoints.path(endpoint);
        ctx.handshake
            .connected_nodes
            .iter()
            .map(|url| -> Result<RequestItem> {
                let payload = payload_for(url)?;
                let encrypted = encrypt_for_node(&mut OsRng, &payload, url, &ctx.jit)?;
                Ok(RequestItem {
                    target_url: url.clone(),
                    endpoint,
                    path: path.clone(),
                    payload: serde_json::to_value(encrypted).map_err(CodecError::from)?,
                    request_id: ctx.request_id.clone(),
                    epoch: ctx.handshake.epoch,
                    version: self.config.version.clone(),
                })
            })
            .collect()
    }

    /// Dispatch requests to a threshold of nodes and decrypt their answers.
    pub(crate) async fn send_requests<R: DeserializeOwned>(
        &self,
        ctx: &OperationContext,
        operation: &str,
        requests: Vec<RequestItem>,
    ) -> Result<Vec<(NodeUrl, R)>> {
        if requests.is_empty() {
            return Err(Error::InvalidInput(format!("no requests generated for {}", operation)));
        }
        debug!(request_id = %ctx.request_id, operation, nodes = requests.len(), "dispatching");
        let batch = dispatch(
            self.transport.clone(),
            requests,
            &ctx.request_id,
            ctx.threshold(),
        )
        .await;
        decrypt_batch(
            batch,
            &ctx.jit,
            operation,
            &ctx.request_id,
            ctx.threshold(),
            |url, data| Ok((url.clone(), parse(url, data)?)),
        )
    }
}

/// Look up the session signature addressed to a node.
pub(crate) fn session_sig_for<'a>(sigs: &'a SessionSigs, url: &NodeUrl) -> Result<&'a crate::auth::AuthSig> {
    sigs.get(url)
        .ok_or_else(|| Error::InvalidInput(format!("no session signature for {}", url)))
}
