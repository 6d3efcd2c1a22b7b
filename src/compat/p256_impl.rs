use elliptic_curve::{
    ops::Reduce,
    sec1::{FromEncodedPoint, ToEncodedPoint},
    PrimeField,
};
use p256::{AffinePoint, EncodedPoint, FieldBytes, NistP256, Scalar, U256};

use super::SigningCurve;

impl SigningCurve for NistP256 {
    const NAME: &'static str = "NistP256";

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
}
