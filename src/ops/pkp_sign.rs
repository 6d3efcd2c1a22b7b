use serde::{Deserialize, Serialize};
use tracing::info;

use super::{session_sig_for, OperationContext};
use crate::{
    auth::{AuthContext, AuthSig},
    client::Client,
    combine::{combine_signature_shares, same_public_key, EcdsaSignatureShare, Signature, SigningScheme},
    error::{Error, Result},
    jit::Product,
    protocol::{Endpoint, NodeUrl},
};

const OPERATION: &str = "pkp-sign";

#[derive(Debug, Clone)]
pub struct PkpSignParams {
    /// The PKP's public key, hex encoded.
    pub pub_key: String,
    pub to_sign: Vec<u8>,
    pub signing_scheme: SigningScheme,
    pub auth_context: AuthContext,
    pub chain: String,
    pub user_max_price: Option<u128>,
    /// Sign `to_sign` as is, which must then be a 32 byte digest.
    pub bypass_auto_hashing: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PkpSignRequest<'a> {
    pub to_sign: &'a [u8],
    pub signing_scheme: SigningScheme,
    pub pubkey: &'a str,
    pub auth_sig: &'a AuthSig,
    pub node_set: &'a [NodeUrl],
    pub chain: &'a str,
    pub bypass_auto_hashing: bool,
    pub epoch: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PkpSignResponse {
    pub signature_share: EcdsaSignatureShare,
}

impl Client {
    /// Sign with a PKP.
    pub async fn pkp_sign(&self, params: PkpSignParams) -> Result<Signature> {
        if params.bypass_auto_hashing && params.to_sign.len() != 32 {
            return Err(Error::InvalidInput(format!(
                "bypassing hashing requires a 32 byte digest, got {} bytes",
                params.to_sign.len()
            )));
        }
        if params.to_sign.is_empty() {
            return Err(Error::InvalidInput("nothing to sign".to_string()));
        }
        let params = &params;
        self.run_operation(OPERATION, Product::Sign, move |ctx| self.pkp_sign_once(ctx, params))
            .await
    }

    async fn pkp_sign_once(&self, ctx: OperationContext, params: &PkpSignParams) -> Result<Signature> {
        let sigs = self
            .session_sigs(&ctx, &params.auth_context, Product::Sign, params.user_max_price)
            .await?;
        let node_set = ctx.node_set();
        let requests = self.build_requests(&ctx, Endpoint::PkpSign, |url| {
            Ok(PkpSignRequest {
                to_sign: &params.to_sign,
                signing_scheme: params.signing_scheme,
                pubkey: &params.pub_key,
                auth_sig: session_sig_for(&sigs, url)?,
                node_set: &node_set,
                chain: &params.chain,
                bypass_auto_hashing: params.bypass_auto_hashing,
                epoch: ctx.handshake.epoch,
            })
        })?;

        let responses: Vec<(NodeUrl, PkpSignResponse)> = self.send_requests(&ctx, OPERATION, requests).await?;
        let shares: Vec<EcdsaSignatureShare> = responses
            .into_iter()
            .map(|(_, r)| r.signature_share)
            .filter(|s| s.sig_type == params.signing_scheme)
            .collect();
        let signature = combine_signature_shares(&shares, &ctx.request_id, ctx.threshold())?;
        if !same_public_key(params.signing_scheme, &signature.verifying_key, &params.pub_key) {
            return Err(Error::SignatureVerificationFailed(format!(
                "nodes signed with {} instead of the requested key",
                signature.verifying_key
            )));
        }
        info!(request_id = %ctx.request_id, scheme = ?params.signing_scheme, "pkp signature combined");
        Ok(signature)
    }
}
