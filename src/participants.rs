//! This module holds some utilities for working with share holders.
//!
//! Combining shares means interpolating a polynomial at zero, for which we
//! need a canonical, duplicate free list of who contributed.

use std::collections::HashMap;

use ff::PrimeField;

use crate::protocol::Participant;

/// Represents a sorted list of participants.
///
/// The order is canonical, which makes any computation over the list
/// independent of the order in which shares arrived.
#[derive(Debug, Clone)]
pub struct ParticipantList {
    participants: Vec<Participant>,
    /// This maps each participant to their index in the vector above.
    indices: HashMap<Participant, usize>,
}

impl ParticipantList {
    /// Create a participant list from a slice of participants.
    ///
    /// This will return None if the participants have duplicates.
    pub fn new(participants: &[Participant]) -> Option<Self> {
        let mut out = participants.to_owned();
        out.sort();

        let indices: HashMap<_, _> = out.iter().enumerate().map(|(p, x)| (*x, p)).collect();

        if indices.len() < out.len() {
            return None;
        }

        Some(Self {
            participants: out,
            indices,
        })
    }

    /// Check if this list has a given participant.
    pub fn contains(&self, participant: Participant) -> bool {
        self.indices.contains_key(&participant)
    }

    /// Get the lagrange coefficient at zero for a participant, relative to this list.
    ///
    /// Returns None if the participant is not part of the list.
    pub fn lagrange<F: PrimeField>(&self, p: Participant) -> Option<F> {
        if !self.contains(p) {
            return None;
        }
        let p_scalar: F = p.scalar();

        let mut num = F::ONE;
        let mut denom = F::ONE;
        for q in self.others(p) {
            let q_scalar: F = q.scalar();
            num *= q_scalar;
            denom *= q_scalar - p_scalar;
        }

        Option::from(denom.invert()).map(|inv: F| num * inv)
    }

    /// Iterate over the other participants
    pub fn others(&self, me: Participant) -> impl Iterator<Item = Participant> + '_ {
        self.participants.iter().filter(move |x| **x != me).copied()
    }
}

#[cfg(test)]
mod test {
    use ff::Field;
    use k256::Scalar;
    use rand_core::OsRng;

    use super::*;
    use crate::math::Polynomial;

    #[test]
    fn test_duplicates_rejected() {
        let ps: Vec<Participant> = vec![1u32.into(), 0u32.into(), 1u32.into()];
        assert!(ParticipantList::new(&ps).is_none());
    }

    #[test]
    fn test_lagrange_interpolates_the_secret() {
        let secret = Scalar::random(&mut OsRng);
        let f = Polynomial::extend_random(&mut OsRng, 3, &secret);

        let ps: Vec<Participant> = vec![4u32.into(), 0u32.into(), 2u32.into()];
        let list = ParticipantList::new(&ps).unwrap();
        let mut acc = Scalar::ZERO;
        for p in ps {
            acc += list.lagrange::<Scalar>(p).unwrap() * f.evaluate(&p.scalar());
        }
        assert_eq!(acc, secret);
        assert!(list.lagrange::<Scalar>(7u32.into()).is_none());
    }
}
