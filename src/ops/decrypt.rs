use base64::{engine::general_purpose::STANDARD, Engine};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::info;

use super::{session_sig_for, OperationContext};
use crate::{
    auth::{AuthContext, AuthSig},
    client::Client,
    combine::{bls, combine_decryption_shares, BlsSignatureShare},
    error::{Error, Result},
    jit::Product,
    protocol::{Endpoint, NodeUrl},
};

const OPERATION: &str = "decrypt";

#[derive(Debug, Clone)]
pub struct DecryptParams {
    /// The ciphertext, base64 encoded, as returned by [`Client::encrypt`].
    pub ciphertext: String,
    pub data_to_encrypt_hash: String,
    pub access_control_conditions: Value,
    pub auth_context: AuthContext,
    pub chain: String,
    pub user_max_price: Option<u128>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptParams {
    pub data: Vec<u8>,
    pub access_control_conditions: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptResponse {
    pub ciphertext: String,
    pub data_to_encrypt_hash: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DecryptRequest<'a> {
    pub ciphertext: &'a str,
    pub data_to_encrypt_hash: &'a str,
    pub access_control_conditions: &'a Value,
    pub auth_sig: &'a AuthSig,
    pub chain: &'a str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DecryptResponse {
    pub signature_share: BlsSignatureShare,
}

/// The identity data is encrypted to: the conditions and the data's hash.
pub fn identity_param(access_control_conditions: &Value, data_to_encrypt_hash: &str) -> Result<String> {
    let conditions = serde_json::to_vec(access_control_conditions)
        .map_err(|e| Error::InvalidInput(format!("access control conditions: {}", e)))?;
    Ok(format!(
        "lit-accesscontrolcondition://{}/{}",
        hex::encode(Sha256::digest(conditions)),
        data_to_encrypt_hash
    ))
}

impl Client {
    /// Encrypt data so that only holders of the conditions can decrypt it.
    ///
    /// This runs locally, against the subnet key from the last handshake.
    pub async fn encrypt(&self, params: EncryptParams) -> Result<EncryptResponse> {
        self.validator
            .validate(&params.access_control_conditions)
            .into_result()?;
        let handshake = self.require_handshake().await?;
        let public_key = bls::decode_public_key(&handshake.consensus()?.subnet_public_key)?;

        let data_to_encrypt_hash = hex::encode(Sha256::digest(&params.data));
        let identity = identity_param(&params.access_control_conditions, &data_to_encrypt_hash)?;
        let ciphertext = bls::encrypt(&mut OsRng, &public_key, identity.as_bytes(), &params.data)?;
        Ok(EncryptResponse {
            ciphertext: STANDARD.encode(ciphertext.to_bytes()),
            data_to_encrypt_hash,
        })
    }

    /// Decrypt data the caller's conditions grant access to.
    pub async fn decrypt(&self, params: DecryptParams) -> Result<Vec<u8>> {
        self.validator
            .validate(&params.access_control_conditions)
            .into_result()?;
        let identity = identity_param(&params.access_control_conditions, &params.data_to_encrypt_hash)?;
        let ciphertext = STANDARD
            .decode(&params.ciphertext)
            .map_err(|e| Error::InvalidInput(format!("ciphertext is not base64: {}", e)))?;
        let (params, identity, ciphertext) = (&params, identity.as_str(), ciphertext.as_slice());
        self.run_operation(OPERATION, Product::Decryption, move |ctx| {
            self.decrypt_once(ctx, params, identity, ciphertext)
        })
        .await
    }

    async fn decrypt_once(
        &self,
        ctx: OperationContext,
        params: &DecryptParams,
        identity: &str,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        let sigs = self
            .session_sigs(&ctx, &params.auth_context, Product::Decryption, params.user_max_price)
            .await?;
        let requests = self.build_requests(&ctx, Endpoint::EncryptionSign, |url| {
            Ok(DecryptRequest {
                ciphertext: &params.ciphertext,
                data_to_encrypt_hash: &params.data_to_encrypt_hash,
                access_control_conditions: &params.access_control_conditions,
                auth_sig: session_sig_for(&sigs, url)?,
                chain: &params.chain,
            })
        })?;

        let responses: Vec<(NodeUrl, DecryptResponse)> = self.send_requests(&ctx, OPERATION, requests).await?;
        let shares: Vec<BlsSignatureShare> = responses.into_iter().map(|(_, r)| r.signature_share).collect();
        let plaintext = combine_decryption_shares(
            &ctx.handshake.consensus()?.subnet_public_key,
            identity.as_bytes(),
            ciphertext,
            &shares,
            ctx.threshold(),
        )?;
        info!(request_id = %ctx.request_id, "decrypted");
        Ok(plaintext)
    }
}
