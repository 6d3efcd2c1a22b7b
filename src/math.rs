//! Polynomials over a prime field, for dealing Shamir shares.
//!
//! The client never deals shares itself on a live network, but local networks
//! and the benchmarks need a trusted dealer.
use ff::PrimeField;
use rand_core::CryptoRngCore;

/// Represents a polynomial with coefficients in a prime field.
#[derive(Debug, Clone)]
pub struct Polynomial<F: PrimeField> {
    /// The coefficients of our polynomial, from 0..size-1.
    coefficients: Vec<F>,
}

impl<F: PrimeField> Polynomial<F> {
    /// Generate a random polynomial with a certain number of coefficients.
    pub fn random(rng: &mut impl CryptoRngCore, size: usize) -> Self {
        let coefficients = (0..size).map(|_| F::random(&mut *rng)).collect();
        Self { coefficients }
    }

    /// Extend a constant to a random polynomial of a certain size.
    ///
    /// This is useful if you want the polynomial to have a certain value, but
    /// otherwise be random.
    pub fn extend_random(rng: &mut impl CryptoRngCore, size: usize, constant: &F) -> Self {
        let mut coefficients = Vec::with_capacity(size);
        coefficients.push(*constant);
        for _ in 1..size {
            coefficients.push(F::random(&mut *rng));
        }
        Self { coefficients }
    }

    /// Evaluate this polynomial at 0.
    ///
    /// This is much more efficient than evaluating at other points.
    pub fn evaluate_zero(&self) -> F {
        self.coefficients.first().copied().unwrap_or(F::ZERO)
    }

    /// Evaluate this polynomial at a specific point.
    pub fn evaluate(&self, x: &F) -> F {
        let mut out = F::ZERO;
        for c in self.coefficients.iter().rev() {
            out = out * x + c;
        }
        out
    }
}
