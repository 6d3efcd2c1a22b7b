//! Turning the shares nodes return into complete signatures.
//!
//! Nodes never see a full signature. Each answers with a share, and the
//! client interpolates any threshold of them at zero, then verifies the
//! result before handing it out.
pub mod bls;
pub mod ecdsa;

pub use bls::{combine_bls_shares, combine_decryption_shares, BlsSignatureShare, IbeCiphertext};
pub use ecdsa::{
    combine_signature_shares, same_public_key, EcdsaSignatureShare, FullSignature, Signature,
    SigningScheme,
};
