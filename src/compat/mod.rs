use elliptic_curve::{ops::Reduce, point::AffineCoordinates, Curve, CurveArithmetic, PrimeCurve};

mod k256_impl;
mod p256_impl;

/// Represents a curve that nodes produce ECDSA signature shares over.
///
/// The bulk of the trait are the bounds requiring a curve according
/// to RustCrypto's traits.
///
/// Beyond that, we need a name for logs, a way to move points and scalars
/// through the wire encoding nodes use, and optionally a way to identify
/// the signer from a signature.
pub trait SigningCurve: PrimeCurve + CurveArithmetic {
    const NAME: &'static str;

    /// Decode a SEC1 encoded point, compressed or not.
    fn decode_point(bytes: &[u8]) -> Option<Self::AffinePoint>;

    /// SEC1 encode a point.
    fn encode_point(point: &Self::AffinePoint, compress: bool) -> Vec<u8>;

    /// Decode a big endian scalar, rejecting values out of range.
    fn decode_scalar(bytes: &[u8]) -> Option<Self::Scalar>;

    fn encode_scalar(scalar: &Self::Scalar) -> Vec<u8>;

    /// Interpret a message digest as a scalar.
    fn scalar_from_prehash(prehash: &[u8]) -> Option<Self::Scalar>;

    /// An identifier for the owner of a public key, if this curve has one.
    fn signer_id(_public_key: &Self::AffinePoint) -> Option<Vec<u8>> {
        None
    }

    /// Recover the identifier of whoever produced a signature.
    fn recover_signer_id(
        _prehash: &[u8],
        _r: &Self::Scalar,
        _s: &Self::Scalar,
        _recovery_id: u8,
    ) -> Option<Vec<u8>> {
        None
    }
}

/// Get the x coordinate of a point, as a scalar
pub(crate) fn x_coordinate<C: SigningCurve>(point: &C::AffinePoint) -> C::Scalar {
    <C::Scalar as Reduce<<C as Curve>::Uint>>::reduce_bytes(&point.x())
}

/// Whether the y coordinate of a point is odd, as used for recovery ids.
pub(crate) fn y_is_odd<C: SigningCurve>(point: &C::AffinePoint) -> bool {
    point.y_is_odd().into()
}

pub use k256_impl::eth_address;
