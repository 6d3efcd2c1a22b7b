//! BLS signatures over BLS12-381, and the identity based encryption built on them.
//!
//! Public keys live in G1 and signatures in G2. A signature on an identity
//! doubles as the decryption key for messages encrypted to that identity,
//! which is how access controlled decryption works: the network only signs
//! the identity once the access conditions are satisfied.
use blstrs::{pairing, Compress, G1Affine, G1Projective, G2Affine, G2Projective, Gt, Scalar};
use group::{prime::PrimeCurveAffine, Group};
use rand_chacha::ChaCha20Rng;
use rand_core::{CryptoRngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::{
    error::{Error, Result},
    participants::ParticipantList,
    protocol::Participant,
    serde::decode_hex,
};

pub const DST_SIG: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_POP_";

const PUBLIC_KEY_LEN: usize = 48;
const SIGNATURE_LEN: usize = 96;
const SIGMA_LEN: usize = 32;
const GT_COMPRESSED_LEN: usize = 288;

/// One node's share of a BLS signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlsSignatureShare {
    pub share_id: Participant,
    /// The compressed G2 point, hex encoded.
    pub value: String,
    /// The node's public key share, when the node reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verifying_share: Option<String>,
}

pub fn hash_to_g2(message: &[u8]) -> G2Projective {
    G2Projective::hash_to_curve(message, DST_SIG, &[])
}

pub fn decode_public_key(s: &str) -> Result<G1Affine> {
    let bytes = decode_hex(s).map_err(|e| Error::InvalidInput(format!("bls public key: {}", e)))?;
    let bytes: [u8; PUBLIC_KEY_LEN] = bytes
        .try_into()
        .map_err(|_| Error::InvalidInput("bls public keys are 48 bytes".to_string()))?;
    Option::from(G1Affine::from_compressed(&bytes))
        .ok_or_else(|| Error::InvalidInput("bls public key is not a G1 point".to_string()))
}

pub fn decode_signature(s: &str) -> Option<G2Affine> {
    let bytes: [u8; SIGNATURE_LEN] = decode_hex(s).ok()?.try_into().ok()?;
    Option::from(G2Affine::from_compressed(&bytes))
}

pub fn encode_signature(sig: &G2Affine) -> String {
    hex::encode(sig.to_compressed())
}

/// Check a signature against a public key.
pub fn verify(public_key: &G1Affine, message: &[u8], sig: &G2Affine) -> bool {
    if bool::from(sig.is_identity()) || bool::from(public_key.is_identity()) {
        return false;
    }
    let h = G2Affine::from(hash_to_g2(message));
    pairing(public_key, &h) == pairing(&G1Affine::generator(), sig)
}

fn interpolate(points: &[(Participant, G2Affine)]) -> Option<G2Affine> {
    let ids: Vec<Participant> = points.iter().map(|(p, _)| *p).collect();
    let participants = ParticipantList::new(&ids)?;
    let mut out = G2Projective::identity();
    for (p, sig) in points {
        out += G2Projective::from(sig) * participants.lagrange::<Scalar>(*p)?;
    }
    Some(out.into())
}

/// A share is bad when the node told us its key share and the two disagree.
fn share_is_bad(share: &BlsSignatureShare, sig: &G2Affine, message: &[u8]) -> bool {
    match share.verifying_share.as_deref().map(decode_public_key) {
        Some(Ok(vk)) => !verify(&vk, message, sig),
        Some(Err(_)) => true,
        None => false,
    }
}

/// Combine BLS signature shares into a signature valid under `public_key`.
///
/// Shares are checked against their verifying shares when present, and
/// bad ones are left out. If the combination still fails to verify, a
/// combination with each single share left out is tried, as long as the
/// threshold can still be met.
pub fn combine_bls_shares(
    shares: &[BlsSignatureShare],
    public_key: &G1Affine,
    message: &[u8],
    threshold: usize,
) -> Result<G2Affine> {
    let mut points: Vec<(Participant, G2Affine)> = Vec::with_capacity(shares.len());
    let mut bad = Vec::new();
    for share in shares {
        if points.iter().any(|(p, _)| *p == share.share_id) {
            warn!(share_id = ?share.share_id, "ignoring duplicate bls share");
            continue;
        }
        match decode_signature(&share.value) {
            Some(sig) if !share_is_bad(share, &sig, message) => points.push((share.share_id, sig)),
            _ => bad.push(share.share_id),
        }
    }
    if !bad.is_empty() {
        warn!(?bad, "ignoring invalid bls shares");
    }
    if points.len() < threshold || points.is_empty() {
        return Err(Error::NoValidShares(format!(
            "{} valid bls shares, {} required",
            points.len(),
            threshold
        )));
    }

    if let Some(sig) = interpolate(&points).filter(|s| verify(public_key, message, s)) {
        return Ok(sig);
    }
    if points.len() > threshold {
        for i in 0..points.len() {
            let mut subset = points.clone();
            let (dropped, _) = subset.remove(i);
            if let Some(sig) = interpolate(&subset).filter(|s| verify(public_key, message, s)) {
                warn!(share_id = ?dropped, "combined bls signature without an invalid share");
                return Ok(sig);
            }
        }
    }
    Err(Error::SignatureVerificationFailed(format!(
        "combined bls signature from shares {:?} does not verify",
        points.iter().map(|(p, _)| *p).collect::<Vec<_>>()
    )))
}

/// A ciphertext for the identity based scheme.
///
/// Serialized as `u || v || w`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IbeCiphertext {
    u: G1Affine,
    v: [u8; SIGMA_LEN],
    w: Vec<u8>,
}

impl IbeCiphertext {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PUBLIC_KEY_LEN + SIGMA_LEN + self.w.len());
        out.extend_from_slice(&self.u.to_compressed());
        out.extend_from_slice(&self.v);
        out.extend_from_slice(&self.w);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PUBLIC_KEY_LEN + SIGMA_LEN {
            return Err(Error::InvalidInput("ciphertext is too short".to_string()));
        }
        let (u, rest) = bytes.split_at(PUBLIC_KEY_LEN);
        let (v, w) = rest.split_at(SIGMA_LEN);
        let mut u_bytes = [0u8; PUBLIC_KEY_LEN];
        u_bytes.copy_from_slice(u);
        let u = Option::from(G1Affine::from_compressed(&u_bytes))
            .ok_or_else(|| Error::InvalidInput("ciphertext header is not a G1 point".to_string()))?;
        let mut v_bytes = [0u8; SIGMA_LEN];
        v_bytes.copy_from_slice(v);
        Ok(Self {
            u,
            v: v_bytes,
            w: w.to_vec(),
        })
    }
}

fn gt_mask(gid: &Gt) -> Result<[u8; SIGMA_LEN]> {
    if gid.compress().is_none() {
        return Err(Error::InvalidInput(
            "pairing output outside the cyclotomic subgroup".to_string(),
        ));
    }
    let mut bytes = Vec::with_capacity(GT_COMPRESSED_LEN);
    (*gid)
        .write_compressed(&mut bytes)
        .map_err(|e| Error::InvalidInput(format!("pairing output: {}", e)))?;
    let mut hasher = Sha256::new();
    hasher.update(b"h2");
    hasher.update(&bytes);
    Ok(hasher.finalize().into())
}

/// Derive the encryption randomness from sigma and the message.
fn h3(sigma: &[u8], message: &[u8]) -> Scalar {
    let mut hasher = Sha256::new();
    hasher.update(b"h3");
    hasher.update(sigma);
    hasher.update(message);
    let mut rng = ChaCha20Rng::from_seed(hasher.finalize().into());
    <Scalar as ff::Field>::random(&mut rng)
}

/// Expand sigma into a mask of `len` bytes.
fn h4(sigma: &[u8], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut counter = 0u32;
    while out.len() < len {
        let mut hasher = Sha256::new();
        hasher.update(b"h4");
        hasher.update(sigma);
        hasher.update(counter.to_be_bytes());
        out.extend_from_slice(&hasher.finalize());
        counter += 1;
    }
    out.truncate(len);
    out
}

fn xor(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b).map(|(x, y)| x ^ y).collect()
}

/// Encrypt a message to an identity under the network's public key.
pub fn encrypt(
    rng: &mut impl CryptoRngCore,
    public_key: &G1Affine,
    identity: &[u8],
    message: &[u8],
) -> Result<IbeCiphertext> {
    let mut sigma = [0u8; SIGMA_LEN];
    rng.fill_bytes(&mut sigma);
    let r = h3(&sigma, message);
    let u = G1Affine::from(G1Projective::generator() * r);
    let r_pk = G1Affine::from(G1Projective::from(public_key) * r);
    let gid = pairing(&r_pk, &G2Affine::from(hash_to_g2(identity)));
    let mut v = [0u8; SIGMA_LEN];
    v.copy_from_slice(&xor(&sigma, &gt_mask(&gid)?));
    let w = xor(message, &h4(&sigma, message.len()));
    Ok(IbeCiphertext { u, v, w })
}

/// Decrypt with the network's signature on the identity.
pub fn decrypt(identity_key: &G2Affine, ciphertext: &IbeCiphertext) -> Result<Vec<u8>> {
    let gid = pairing(&ciphertext.u, identity_key);
    let sigma = xor(&ciphertext.v, &gt_mask(&gid)?);
    let message = xor(&ciphertext.w, &h4(&sigma, ciphertext.w.len()));
    let r = h3(&sigma, &message);
    if G1Affine::from(G1Projective::generator() * r) != ciphertext.u {
        return Err(Error::SignatureVerificationFailed(
            "decryption key does not open the ciphertext".to_string(),
        ));
    }
    Ok(message)
}

/// Open a ciphertext with decryption shares from the nodes.
///
/// The shares are signatures on `identity` under the subnet key; combined,
/// they form the identity's decryption key.
pub fn combine_decryption_shares(
    subnet_public_key: &str,
    identity: &[u8],
    ciphertext: &[u8],
    shares: &[BlsSignatureShare],
    threshold: usize,
) -> Result<Vec<u8>> {
    let public_key = decode_public_key(subnet_public_key)?;
    let ciphertext = IbeCiphertext::from_bytes(ciphertext)?;
    let key = combine_bls_shares(shares, &public_key, identity, threshold)?;
    decrypt(&key, &ciphertext)
}

/// Deal BLS signature shares for a message, as a local network would.
pub fn deal_bls_shares(
    rng: &mut impl CryptoRngCore,
    secret_key: &Scalar,
    message: &[u8],
    participants: &[Participant],
    threshold: usize,
) -> Vec<BlsSignatureShare> {
    let f = crate::math::Polynomial::extend_random(rng, threshold, secret_key);
    let h = hash_to_g2(message);
    participants
        .iter()
        .map(|p| {
            let sk_i = f.evaluate(&p.scalar::<Scalar>());
            BlsSignatureShare {
                share_id: *p,
                value: encode_signature(&G2Affine::from(h * sk_i)),
                verifying_share: Some(hex::encode(
                    G1Affine::from(G1Projective::generator() * sk_i).to_compressed(),
                )),
            }
        })
        .collect()
}
