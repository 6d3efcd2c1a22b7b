use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use super::{session_sig_for, OperationContext};
use crate::{
    auth::{AuthContext, AuthSig},
    client::Client,
    combine::{combine_signature_shares, EcdsaSignatureShare, Signature},
    error::{Error, Result},
    jit::Product,
    protocol::{least_common, most_common, Endpoint, NodeUrl},
};

const OPERATION: &str = "execute-js";

/// Which node response to report when nodes disagree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResponseStrategy {
    #[default]
    MostCommon,
    LeastCommon,
}

#[derive(Debug, Clone)]
pub enum ActionSource {
    Code(String),
    IpfsId(String),
}

#[derive(Debug, Clone)]
pub struct ExecuteJsParams {
    pub source: ActionSource,
    pub js_params: Option<Value>,
    pub auth_context: AuthContext,
    pub response_strategy: ResponseStrategy,
    pub user_max_price: Option<u128>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteJsResponse {
    pub success: bool,
    pub signatures: BTreeMap<String, Signature>,
    /// The action's response, parsed as JSON when it is JSON.
    pub response: Value,
    pub logs: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ExecuteJsRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipfs_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub js_params: Option<&'a Value>,
    pub auth_sig: &'a AuthSig,
    pub node_set: &'a [NodeUrl],
    pub epoch: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ExecuteJsNodeResponse {
    #[serde(default)]
    pub signed_data: BTreeMap<String, EcdsaSignatureShare>,
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub logs: String,
}

fn parse_response(response: &str) -> Value {
    serde_json::from_str(response).unwrap_or_else(|_| Value::String(response.to_string()))
}

/// Combine the per-node answers of one execution.
fn combine_responses(
    responses: Vec<(NodeUrl, ExecuteJsNodeResponse)>,
    strategy: ResponseStrategy,
    request_id: &str,
    threshold: usize,
) -> Result<ExecuteJsResponse> {
    if responses.len() < threshold {
        return Err(Error::InsufficientSuccessNoError {
            request_id: request_id.to_string(),
            success_count: responses.len(),
            failure_count: 0,
            min_success_count: threshold,
            total_requests: responses.len(),
        });
    }
    let logs = responses
        .first()
        .map(|(_, r)| r.logs.clone())
        .unwrap_or_default();

    let mut shares: BTreeMap<String, Vec<EcdsaSignatureShare>> = BTreeMap::new();
    for (_, r) in &responses {
        for (name, share) in &r.signed_data {
            shares.entry(name.clone()).or_default().push(share.clone());
        }
    }
    let mut signatures = BTreeMap::new();
    for (name, shares) in shares {
        if shares.len() < threshold {
            return Err(Error::NoValidShares(format!(
                "no valid lit action shares to combine for {}: {} of {}",
                name,
                shares.len(),
                threshold
            )));
        }
        signatures.insert(name, combine_signature_shares(&shares, request_id, threshold)?);
    }

    let texts: Vec<&str> = responses.iter().map(|(_, r)| r.response.as_str()).collect();
    let chosen = match strategy {
        ResponseStrategy::MostCommon => most_common(&texts),
        ResponseStrategy::LeastCommon => least_common(&texts),
    };
    if let Some(chosen) = chosen {
        if texts.iter().any(|t| t != chosen) {
            warn!(request_id, ?strategy, "nodes disagree on the action response");
        }
    }

    Ok(ExecuteJsResponse {
        success: true,
        signatures,
        response: chosen.map(|t| parse_response(t)).unwrap_or(Value::Null),
        logs,
    })
}

impl Client {
    /// Run a Lit Action on the nodes.
    pub async fn execute_js(&self, params: ExecuteJsParams) -> Result<ExecuteJsResponse> {
        let code = match &params.source {
            ActionSource::Code(code) if code.trim().is_empty() => {
                return Err(Error::InvalidInput("the action code is empty".to_string()))
            }
            ActionSource::Code(code) => Some(STANDARD.encode(code)),
            ActionSource::IpfsId(_) => None,
        };
        let (params, code) = (&params, code.as_deref());
        self.run_operation(OPERATION, Product::LitAction, move |ctx| {
            self.execute_js_once(ctx, params, code)
        })
        .await
    }

    async fn execute_js_once(
        &self,
        ctx: OperationContext,
        params: &ExecuteJsParams,
        code: Option<&str>,
    ) -> Result<ExecuteJsResponse> {
        let sigs = self
            .session_sigs(&ctx, &params.auth_context, Product::LitAction, params.user_max_price)
            .await?;
        let node_set = ctx.node_set();
        let ipfs_id = match &params.source {
            ActionSource::IpfsId(id) => Some(id.as_str()),
            ActionSource::Code(_) => None,
        };
        let requests = self.build_requests(&ctx, Endpoint::ExecuteJs, |url| {
            Ok(ExecuteJsRequest {
                code: code.map(str::to_string),
                ipfs_id,
                js_params: params.js_params.as_ref(),
                auth_sig: session_sig_for(&sigs, url)?,
                node_set: &node_set,
                epoch: ctx.handshake.epoch,
            })
        })?;

        let responses: Vec<(NodeUrl, ExecuteJsNodeResponse)> =
            self.send_requests(&ctx, OPERATION, requests).await?;
        let out = combine_responses(responses, params.response_strategy, &ctx.request_id, ctx.threshold())?;
        info!(request_id = %ctx.request_id, signatures = out.signatures.len(), "lit action executed");
        Ok(out)
    }
}
