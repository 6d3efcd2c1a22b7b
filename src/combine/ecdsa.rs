use elliptic_curve::{scalar::IsHigh, Field, Group};
use k256::Secp256k1;
use p256::NistP256;
use serde::{Deserialize, Serialize};
use subtle::ConditionallySelectable;
use tracing::{debug, warn};

use crate::{
    compat::{self, SigningCurve},
    error::{Error, Result},
    participants::ParticipantList,
    protocol::{most_common, Participant},
    serde::decode_hex,
};

/// The signature schemes nodes can produce shares for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SigningScheme {
    EcdsaK256Sha256,
    EcdsaP256Sha256,
}

impl SigningScheme {
    pub fn curve_name(self) -> &'static str {
        match self {
            SigningScheme::EcdsaK256Sha256 => Secp256k1::NAME,
            SigningScheme::EcdsaP256Sha256 => NistP256::NAME,
        }
    }
}

/// One node's share of an ECDSA signature.
///
/// `signature_share` is the node's point on the polynomial whose value at
/// zero is the signature's `s`; every other field is common to all shares
/// of the same signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EcdsaSignatureShare {
    pub share_id: Participant,
    pub sig_type: SigningScheme,
    pub signature_share: String,
    pub big_r: String,
    pub public_key: String,
    /// The digest that was signed, hex encoded.
    pub digest: String,
}

impl EcdsaSignatureShare {
    fn agreement(&self) -> (SigningScheme, &str, &str, &str) {
        (self.sig_type, &self.big_r, &self.public_key, &self.digest)
    }
}

/// A complete signature, ready to be used outside the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signature {
    /// `r || s`, hex encoded.
    pub signature: String,
    /// The uncompressed public key, hex encoded.
    pub verifying_key: String,
    pub signed_data: String,
    pub recovery_id: u8,
    pub sig_type: SigningScheme,
}

/// Represents a signature with the entire first point kept around.
#[derive(Clone)]
pub struct FullSignature<C: SigningCurve> {
    /// This is the entire first point.
    pub big_r: C::AffinePoint,
    /// This is the second scalar, normalized to be in the lower range.
    pub s: C::Scalar,
}

impl<C: SigningCurve> FullSignature<C> {
    #[must_use]
    pub fn verify(&self, public_key: &C::AffinePoint, msg_hash: &C::Scalar) -> bool {
        let r: C::Scalar = compat::x_coordinate::<C>(&self.big_r);
        if r.is_zero().into() || self.s.is_zero().into() {
            return false;
        }
        let Some(s_inv) = Option::<C::Scalar>::from(self.s.invert()) else {
            return false;
        };
        let reproduced = (C::ProjectivePoint::generator() * (*msg_hash * s_inv))
            + (C::ProjectivePoint::from(*public_key) * (r * s_inv));
        compat::x_coordinate::<C>(&reproduced.into()) == r
    }
}

struct Parsed<C: SigningCurve> {
    big_r: C::AffinePoint,
    public_key: C::AffinePoint,
    prehash: Vec<u8>,
    msg_hash: C::Scalar,
    points: Vec<(Participant, C::Scalar)>,
}

fn parse<C: SigningCurve>(shares: &[&EcdsaSignatureShare]) -> Result<Parsed<C>> {
    let Some(first) = shares.first() else {
        return Err(Error::NoValidShares("no signature shares".to_string()));
    };
    let decode = |what: &str, s: &str| {
        decode_hex(s).map_err(|e| Error::InvalidInput(format!("{} is not hex: {}", what, e)))
    };
    let big_r = C::decode_point(&decode("big_r", &first.big_r)?)
        .ok_or_else(|| Error::InvalidInput(format!("big_r is not a {} point", C::NAME)))?;
    let public_key = C::decode_point(&decode("public key", &first.public_key)?)
        .ok_or_else(|| Error::InvalidInput(format!("public key is not a {} point", C::NAME)))?;
    let prehash = decode("digest", &first.digest)?;
    let msg_hash = C::scalar_from_prehash(&prehash)
        .ok_or_else(|| Error::InvalidInput("digest must be 32 bytes".to_string()))?;

    let mut points: Vec<(Participant, C::Scalar)> = Vec::with_capacity(shares.len());
    for share in shares {
        if points.iter().any(|(p, _)| *p == share.share_id) {
            warn!(share_id = ?share.share_id, "ignoring duplicate signature share");
            continue;
        }
        match decode_hex(&share.signature_share)
            .ok()
            .and_then(|b| C::decode_scalar(&b))
        {
            Some(s) => points.push((share.share_id, s)),
            None => warn!(share_id = ?share.share_id, "ignoring malformed signature share"),
        }
    }

    Ok(Parsed {
        big_r,
        public_key,
        prehash,
        msg_hash,
        points,
    })
}

/// Interpolate the shares at zero.
fn interpolate<C: SigningCurve>(points: &[(Participant, C::Scalar)]) -> Option<C::Scalar> {
    let ids: Vec<Participant> = points.iter().map(|(p, _)| *p).collect();
    let participants = ParticipantList::new(&ids)?;
    let mut s = C::Scalar::ZERO;
    for (p, s_i) in points {
        s += participants.lagrange::<C::Scalar>(*p)? * s_i;
    }
    Some(s)
}

/// Try to produce a verified signature from exactly these points.
fn finish<C: SigningCurve>(parsed: &Parsed<C>, points: &[(Participant, C::Scalar)]) -> Option<(FullSignature<C>, u8)> {
    let mut s = interpolate::<C>(points)?;

    // Low s form.
    let high = s.is_high();
    s.conditional_assign(&(-s), high);
    let sig = FullSignature::<C> {
        big_r: parsed.big_r,
        s,
    };
    if !sig.verify(&parsed.public_key, &parsed.msg_hash) {
        return None;
    }

    // Negating s mirrors R, which flips the parity the verifier will see.
    let recovery_id = (compat::y_is_odd::<C>(&parsed.big_r) ^ bool::from(high)) as u8;
    if let Some(expected) = C::signer_id(&parsed.public_key) {
        let r = compat::x_coordinate::<C>(&parsed.big_r);
        let recovered = C::recover_signer_id(&parsed.prehash, &r, &sig.s, recovery_id);
        if recovered.as_ref() != Some(&expected) {
            warn!(curve = C::NAME, "signature does not recover the expected signer");
            return None;
        }
    }
    Some((sig, recovery_id))
}

fn combine_on<C: SigningCurve>(
    shares: &[&EcdsaSignatureShare],
    scheme: SigningScheme,
    request_id: &str,
    threshold: usize,
) -> Result<Signature> {
    let parsed = parse::<C>(shares)?;
    if parsed.points.len() < threshold {
        return Err(Error::NoValidShares(format!(
            "only {} usable signature shares for request {}, {} required",
            parsed.points.len(),
            request_id,
            threshold
        )));
    }

    let mut found = finish::<C>(&parsed, &parsed.points);
    // With shares to spare, a single bad share can be left out.
    if found.is_none() && parsed.points.len() > threshold {
        for i in 0..parsed.points.len() {
            let mut subset = parsed.points.clone();
            let (dropped, _) = subset.remove(i);
            if let Some(out) = finish::<C>(&parsed, &subset) {
                warn!(request_id, share_id = ?dropped, "combined without an invalid share");
                found = Some(out);
                break;
            }
        }
    }
    let Some((sig, recovery_id)) = found else {
        return Err(Error::SignatureVerificationFailed(format!(
            "{} signature for request {} does not verify",
            C::NAME,
            request_id
        )));
    };

    let r = compat::x_coordinate::<C>(&sig.big_r);
    let mut signature = C::encode_scalar(&r);
    signature.extend(C::encode_scalar(&sig.s));
    debug!(request_id, curve = C::NAME, shares = parsed.points.len(), "combined signature");
    Ok(Signature {
        signature: hex::encode(signature),
        verifying_key: hex::encode(C::encode_point(&parsed.public_key, false)),
        signed_data: hex::encode(&parsed.prehash),
        recovery_id,
        sig_type: scheme,
    })
}

/// Combine ECDSA signature shares into a verified signature.
///
/// Shares are interpolated by share id, so arrival order does not matter.
/// Shares that disagree with the majority on the nonce point, key, digest
/// or scheme are ignored. Fewer than `threshold` usable shares is a
/// [`Error::NoValidShares`]; a result that does not verify is a
/// [`Error::SignatureVerificationFailed`].
pub fn combine_signature_shares(
    shares: &[EcdsaSignatureShare],
    request_id: &str,
    threshold: usize,
) -> Result<Signature> {
    if shares.len() < threshold || shares.is_empty() {
        return Err(Error::NoValidShares(format!(
            "The total number of valid signatures shares {} does not meet the threshold of {}",
            shares.len(),
            threshold
        )));
    }

    let agreements: Vec<_> = shares.iter().map(EcdsaSignatureShare::agreement).collect();
    let Some(&majority) = most_common(&agreements) else {
        return Err(Error::NoValidShares("no signature shares".to_string()));
    };
    let agreeing: Vec<&EcdsaSignatureShare> = shares
        .iter()
        .filter(|s| s.agreement() == majority)
        .collect();
    if agreeing.len() < shares.len() {
        warn!(
            request_id,
            dissenting = shares.len() - agreeing.len(),
            "ignoring signature shares that disagree with the majority"
        );
    }

    let scheme = majority.0;
    match scheme {
        SigningScheme::EcdsaK256Sha256 => combine_on::<Secp256k1>(&agreeing, scheme, request_id, threshold),
        SigningScheme::EcdsaP256Sha256 => combine_on::<NistP256>(&agreeing, scheme, request_id, threshold),
    }
}

/// Whether two hex encoded keys are the same point, whatever their encoding.
pub fn same_public_key(scheme: SigningScheme, a: &str, b: &str) -> bool {
    fn normalize<C: SigningCurve>(s: &str) -> Option<Vec<u8>> {
        let point = C::decode_point(&decode_hex(s).ok()?)?;
        Some(C::encode_point(&point, true))
    }
    let (a, b) = match scheme {
        SigningScheme::EcdsaK256Sha256 => (normalize::<Secp256k1>(a), normalize::<Secp256k1>(b)),
        SigningScheme::EcdsaP256Sha256 => (normalize::<NistP256>(a), normalize::<NistP256>(b)),
    };
    a.is_some() && a == b
}

/// Deal shares of a signature, the way a network of nodes would produce them.
///
/// Only meant for local networks, tests and benchmarks: the dealer knows the
/// secret key.
pub fn deal_signature_shares<C: SigningCurve>(
    rng: &mut impl rand_core::CryptoRngCore,
    secret_key: &C::Scalar,
    prehash: &[u8],
    participants: &[Participant],
    threshold: usize,
    scheme: SigningScheme,
) -> Option<Vec<EcdsaSignatureShare>> {
    use crate::math::Polynomial;

    let msg_hash = C::scalar_from_prehash(prehash)?;
    let public_key: C::AffinePoint = (C::ProjectivePoint::generator() * *secret_key).into();

    // A presignature: k shared by g, k * x shared by h, and R = k^-1 * G.
    let g = Polynomial::<C::Scalar>::random(&mut *rng, threshold);
    let k = g.evaluate_zero();
    let big_r: C::AffinePoint =
        (C::ProjectivePoint::generator() * Option::<C::Scalar>::from(k.invert())?).into();
    let h = Polynomial::<C::Scalar>::extend_random(&mut *rng, threshold, &(k * secret_key));
    let r = compat::x_coordinate::<C>(&big_r);

    Some(
        participants
            .iter()
            .map(|p| {
                let x = p.scalar::<C::Scalar>();
                let s_i = msg_hash * g.evaluate(&x) + r * h.evaluate(&x);
                EcdsaSignatureShare {
                    share_id: *p,
                    sig_type: scheme,
                    signature_share: hex::encode(C::encode_scalar(&s_i)),
                    big_r: hex::encode(C::encode_point(&big_r, true)),
                    public_key: hex::encode(C::encode_point(&public_key, true)),
                    digest: hex::encode(prehash),
                }
            })
            .collect(),
    )
}
