use elliptic_curve::{
    ops::Reduce,
    sec1::{FromEncodedPoint, ToEncodedPoint},
    PrimeField,
};
use k256::{
    ecdsa::{RecoveryId, Signature, VerifyingKey},
    AffinePoint, EncodedPoint, FieldBytes, Scalar, Secp256k1, U256,
};
use sha3::{Digest, Keccak256};

use super::SigningCurve;

/// The Ethereum address of a secp256k1 public key.
pub fn eth_address(point: &AffinePoint) -> [u8; 20] {
    let encoded = point.to_encoded_point(false);
    let hash = Keccak256::digest(&encoded.as_bytes()[1..]);
    let mut out = [0u8; 20];
    out.copy_from_slice(&hash[12..]);
    out
}

impl SigningCurve for Secp256k1 {
    const NAME: &'static str = "Secp256k1";

    fn decode_point(bytes: &[u8]) -> Option<AffinePoint> {
        let encoded = EncodedPoint::from_bytes(bytes).ok()?;
        Option::from(AffinePoint::from_encoded_point(&encoded))
    }

    fn encode_point(point: &AffinePoint, compress: bool) -> Vec<u8> {
        point.to_encoded_point(compress).as_bytes().to_vec()
    }

    fn decode_scalar(bytes: &[u8]) -> Option<Scalar> {
        if bytes.len() != 32 {
            return None;
        }
        Option::from(Scalar::from_repr(*FieldBytes::from_slice(bytes)))
    }

    fn encode_scalar(scalar: &Scalar) -> Vec<u8> {
        scalar.to_repr().to_vec()
    }

    fn scalar_from_prehash(prehash: &[u8]) -> Option<Scalar> {
        if prehash.len() != 32 {
            return None;
        }
        Some(<Scalar as Reduce<U256>>::reduce_bytes(FieldBytes::from_slice(
            prehash,
        )))
    }

    fn signer_id(public_key: &AffinePoint) -> Option<Vec<u8>> {
        Some(eth_address(public_key).to_vec())
    }

    fn recover_signer_id(prehash: &[u8], r: &Scalar, s: &Scalar, recovery_id: u8) -> Option<Vec<u8>> {
        let signature = Signature::from_scalars(*r, *s).ok()?;
        let recovery_id = RecoveryId::from_byte(recovery_id)?;
        let key = VerifyingKey::recover_from_prehash(prehash, &signature, recovery_id).ok()?;
        Some(eth_address(key.as_affine()).to_vec())
    }
}
