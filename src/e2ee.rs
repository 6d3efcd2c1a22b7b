//! End to end encryption between the client and each node.
//!
//! Both sides hold an X25519 key. A payload is encrypted with
//! XChaCha20-Poly1305 under a key derived from the Diffie-Hellman secret, and
//! carries the sender's public key so the receiver knows which of its secrets
//! to open it with.
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    Key, XChaCha20Poly1305, XNonce,
};
use chrono::{DateTime, SubsecRound, Utc};
use hkdf::Hkdf;
use rand_core::CryptoRngCore;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256, Sha512};
use tracing::warn;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::{
    error::{CodecError, Error, Result},
    jit::JitContext,
    protocol::{
        dispatch::{most_common_error, NodeResponse},
        BatchResult, NodeReply, NodeUrl,
    },
    serde::{hex_bytes, hex_key},
};

const VERSION: u8 = 1;
const KDF_INFO: &[u8] = b"lit-quorum e2ee v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadV1 {
    /// The sender's public key.
    #[serde(with = "hex_key")]
    pub verification_key: [u8; 32],
    #[serde(with = "hex_bytes")]
    pub ciphertext_and_tag: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub random: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptedPayload {
    V1(PayloadV1),
}

fn aad(random: &[u8], created_at: &DateTime<Utc>, recipient: &[u8; 32], sender: &[u8; 32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + random.len() + 8 + 64);
    out.push(VERSION);
    out.extend_from_slice(random);
    out.extend_from_slice(&(created_at.timestamp().max(0) as u64).to_be_bytes());
    out.extend_from_slice(recipient);
    out.extend_from_slice(sender);
    out
}

fn cipher(secret: &StaticSecret, their_public: &[u8; 32], salt: &[u8]) -> XChaCha20Poly1305 {
    let shared = secret.diffie_hellman(&PublicKey::from(*their_public));
    let mut key = Zeroizing::new([0u8; 32]);
    // 32 bytes is always a valid HKDF-SHA256 output length.
    let _ = Hkdf::<Sha256>::new(Some(salt), shared.as_bytes()).expand(KDF_INFO, &mut key[..]);
    XChaCha20Poly1305::new(Key::from_slice(&key[..]))
}

/// Encrypt bytes for the holder of `recipient`.
pub fn seal(
    rng: &mut impl CryptoRngCore,
    sender: &StaticSecret,
    recipient: &[u8; 32],
    plaintext: &[u8],
) -> Result<EncryptedPayload, CodecError> {
    let mut random = vec![0u8; 16];
    rng.fill_bytes(&mut random);
    let created_at = Utc::now().trunc_subsecs(0);
    let verification_key = PublicKey::from(sender).to_bytes();

    let aad = aad(&random, &created_at, recipient, &verification_key);
    let nonce = Sha512::digest(&aad);
    let ciphertext_and_tag = cipher(sender, recipient, &random)
        .encrypt(
            XNonce::from_slice(&nonce[..24]),
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|_| CodecError::Open("encryption failed".to_string()))?;

    Ok(EncryptedPayload::V1(PayloadV1 {
        verification_key,
        ciphertext_and_tag,
        random,
        created_at,
    }))
}

/// Decrypt a payload addressed to `recipient`.
pub fn open(recipient: &StaticSecret, payload: &EncryptedPayload) -> Result<Vec<u8>, CodecError> {
    let EncryptedPayload::V1(p) = payload;
    let my_public = PublicKey::from(recipient).to_bytes();
    let aad = aad(&p.random, &p.created_at, &my_public, &p.verification_key);
    let nonce = Sha512::digest(&aad);
    cipher(recipient, &p.verification_key, &p.random)
        .decrypt(
            XNonce::from_slice(&nonce[..24]),
            Payload {
                msg: &p.ciphertext_and_tag,
                aad: &aad,
            },
        )
        .map_err(|_| CodecError::Open("authentication failed".to_string()))
}

/// Encrypt a request body for one node of the context.
pub fn encrypt_for_node(
    rng: &mut impl CryptoRngCore,
    request: &impl Serialize,
    url: &NodeUrl,
    jit: &JitContext,
) -> Result<EncryptedPayload> {
    let keys = jit
        .key_set
        .get(url)
        .ok_or_else(|| CodecError::UnknownNode(url.clone()))?;
    let plaintext = serde_json::to_vec(request).map_err(CodecError::from)?;
    Ok(seal(
        rng,
        keys.client_secret(),
        &keys.node_public_key,
        &plaintext,
    )?)
}

fn decrypt_response(body: Value, jit: &JitContext) -> Result<Value, CodecError> {
    let payload: EncryptedPayload = serde_json::from_value(body)?;
    let EncryptedPayload::V1(p) = &payload;
    let keys = jit
        .key_set
        .by_node_key(&p.verification_key)
        .ok_or_else(|| CodecError::UnknownVerificationKey(hex::encode(p.verification_key)))?;
    let plaintext = open(keys.client_secret(), &payload)?;
    Ok(serde_json::from_slice(&plaintext)?)
}

/// Decrypt every response of a successful batch.
///
/// A failed batch is never decrypted: its error is wrapped as a failure of
/// `operation`. Responses that decrypt to a failure envelope don't count
/// towards `min_success_count`; when too few responses are left, the failure
/// carries the most common inner error along with every failing node's error.
pub fn decrypt_batch<T, F>(
    batch: BatchResult<NodeResponse>,
    jit: &JitContext,
    operation: &str,
    request_id: &str,
    min_success_count: usize,
    mut unwrap: F,
) -> Result<Vec<T>>
where
    F: FnMut(&NodeUrl, Value) -> Result<T>,
{
    let responses = match batch {
        BatchResult::Success { values } => values,
        BatchResult::Failure { error } => {
            return Err(Error::operation_failed(operation, request_id, error))
        }
    };

    let total_requests = responses.len();
    let mut out = Vec::with_capacity(total_requests);
    let mut failures = Vec::new();
    for NodeResponse { url, body } in responses {
        let plaintext = decrypt_response(body, jit)?;
        match NodeReply::from_envelope(plaintext) {
            NodeReply::Success(data) => out.push(unwrap(&url, data)?),
            NodeReply::Failure(summary) => {
                warn!(request_id, operation, %url, error = %summary, "node returned a failed result");
                failures.push((url, summary));
            }
        }
    }
    if out.len() >= min_success_count {
        return Ok(out);
    }

    let representative = most_common_error(&failures).cloned();
    let error = match representative {
        Some(representative) => Error::AggregatedNodeError {
            request_id: request_id.to_string(),
            representative,
            node_errors: failures.into_iter().collect(),
        },
        None => Error::InsufficientSuccessNoError {
            request_id: request_id.to_string(),
            success_count: out.len(),
            failure_count: 0,
            min_success_count,
            total_requests,
        },
    };
    Err(Error::operation_failed(operation, request_id, error))
}

/// Deserialize a decrypted response into its wire type.
pub fn parse<T: DeserializeOwned>(url: &NodeUrl, data: Value) -> Result<T> {
    serde_json::from_value(data).map_err(|e| {
        Error::Codec(CodecError::Malformed(format!("response from {}: {}", url, e)))
    })
}
