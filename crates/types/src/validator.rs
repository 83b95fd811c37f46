//! Validators and the weighted validator set.
//!
//! Proposer selection is a deterministic weighted round-robin: every round
//! each validator's priority grows by its voting power, the highest priority
//! becomes proposer, and the proposer pays the total voting power back. Over
//! time each validator proposes proportionally to its power.

use kestrel_crypto::PublicKey;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{Address, H256};

/// One member of the validator set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    /// Address derived from the public key
    pub address: Address,
    /// Ed25519 consensus key
    pub pub_key: PublicKey,
    /// Voting power (weight in quorum arithmetic)
    pub voting_power: u64,
    /// Rotating proposer priority
    pub proposer_priority: i64,
}

impl Validator {
    /// Create a validator with zero initial priority.
    pub fn new(pub_key: PublicKey, voting_power: u64) -> Self {
        Self {
            address: Address::from_pub_key(&pub_key),
            pub_key,
            voting_power,
            proposer_priority: 0,
        }
    }
}

/// The ordered, weighted validator set for one height.
///
/// Validators are sorted by address so every node derives the same indices
/// and the same proposer rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSet {
    /// Members in address order
    pub validators: Vec<Validator>,
    total_voting_power: u64,
}

impl ValidatorSet {
    /// Build a set from members, sorting by address.
    pub fn new(mut validators: Vec<Validator>) -> Self {
        validators.sort_by(|a, b| a.address.cmp(&b.address));
        let total_voting_power = validators.iter().map(|v| v.voting_power).sum();
        Self {
            validators,
            total_voting_power,
        }
    }

    /// Number of validators.
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Sum of all voting power.
    pub fn total_voting_power(&self) -> u64 {
        self.total_voting_power
    }

    /// Whether `power` strictly exceeds two thirds of the total.
    pub fn has_two_thirds(&self, power: u64) -> bool {
        (power as u128) * 3 > (self.total_voting_power as u128) * 2
    }

    /// Whether `power` strictly exceeds one third of the total.
    pub fn has_one_third(&self, power: u64) -> bool {
        (power as u128) * 3 > self.total_voting_power as u128
    }

    /// Look up a validator and its index by address.
    pub fn get_by_address(&self, address: &Address) -> Option<(u32, &Validator)> {
        self.validators
            .binary_search_by(|v| v.address.cmp(address))
            .ok()
            .map(|i| (i as u32, &self.validators[i]))
    }

    /// Look up a validator by index.
    pub fn get_by_index(&self, index: u32) -> Option<&Validator> {
        self.validators.get(index as usize)
    }

    /// Whether `address` belongs to the set.
    pub fn has_address(&self, address: &Address) -> bool {
        self.get_by_address(address).is_some()
    }

    /// The current proposer: the validator with the highest priority,
    /// ties broken by address order.
    pub fn proposer(&self) -> &Validator {
        self.validators
            .iter()
            .max_by(|a, b| {
                a.proposer_priority
                    .cmp(&b.proposer_priority)
                    .then_with(|| b.address.cmp(&a.address))
            })
            .expect("validator set is never empty")
    }

    /// Advance the proposer rotation by `times` rounds.
    ///
    /// Each pass adds every validator's power to its priority, then the
    /// proposer pays back the total power.
    pub fn increment_proposer_priority(&mut self, times: i32) {
        debug_assert!(!self.validators.is_empty());
        for _ in 0..times {
            for v in &mut self.validators {
                v.proposer_priority = v
                    .proposer_priority
                    .saturating_add(v.voting_power as i64);
            }
            let total = self.total_voting_power as i64;
            let proposer_address = self.proposer().address;
            let proposer = self
                .validators
                .iter_mut()
                .find(|v| v.address == proposer_address)
                .expect("proposer is a member");
            proposer.proposer_priority = proposer.proposer_priority.saturating_sub(total);
            trace!(proposer = %proposer_address, "advanced proposer rotation");
        }
    }

    /// Hash committing to the members and their powers.
    pub fn hash(&self) -> H256 {
        let entries: Vec<(Address, u64)> = self
            .validators
            .iter()
            .map(|v| (v.address, v.voting_power))
            .collect();
        let bytes = serde_json::to_vec(&entries).expect("serialization cannot fail");
        H256::keccak256(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_crypto::Keypair;

    fn set_of(powers: &[u64]) -> ValidatorSet {
        let validators = powers
            .iter()
            .enumerate()
            .map(|(i, &p)| Validator::new(Keypair::from_seed(&[i as u8 + 1; 32]).public_key(), p))
            .collect();
        ValidatorSet::new(validators)
    }

    #[test]
    fn test_two_thirds_threshold_is_strict() {
        let vals = set_of(&[1, 1, 1]);
        assert!(!vals.has_two_thirds(2)); // 2*3 = 6 == 3*2, not strictly greater
        assert!(vals.has_two_thirds(3));

        let vals = set_of(&[1, 1, 1, 1]);
        assert!(!vals.has_two_thirds(2));
        assert!(vals.has_two_thirds(3));
    }

    #[test]
    fn test_equal_power_rotation_is_fair() {
        let mut vals = set_of(&[1, 1, 1, 1]);
        let mut seen = std::collections::HashMap::new();
        for _ in 0..8 {
            vals.increment_proposer_priority(1);
            *seen.entry(vals.proposer().address).or_insert(0u32) += 1;
        }
        // Four validators, eight rounds: everyone proposes exactly twice.
        assert_eq!(seen.len(), 4);
        assert!(seen.values().all(|&n| n == 2));
    }

    #[test]
    fn test_weighted_rotation_favors_power() {
        let mut vals = set_of(&[3, 1, 1]);
        let heavy = vals
            .validators
            .iter()
            .find(|v| v.voting_power == 3)
            .unwrap()
            .address;

        let mut heavy_count = 0;
        for _ in 0..50 {
            vals.increment_proposer_priority(1);
            if vals.proposer().address == heavy {
                heavy_count += 1;
            }
        }
        // 3 of 5 total power: expect 30 of 50 rounds.
        assert_eq!(heavy_count, 30);
    }

    #[test]
    fn test_rotation_by_k_equals_k_single_steps() {
        let mut a = set_of(&[5, 2, 1]);
        let mut b = a.clone();

        a.increment_proposer_priority(3);
        for _ in 0..3 {
            b.increment_proposer_priority(1);
        }
        assert_eq!(a, b);
    }

    #[test]
    fn test_lookup_by_address_and_index() {
        let vals = set_of(&[1, 2, 3]);
        for (i, v) in vals.validators.iter().enumerate() {
            let (idx, found) = vals.get_by_address(&v.address).unwrap();
            assert_eq!(idx as usize, i);
            assert_eq!(found.address, v.address);
            assert_eq!(vals.get_by_index(idx).unwrap().address, v.address);
        }
        assert!(!vals.has_address(&Address::new([0xff; 20])));
    }

    #[test]
    fn test_hash_changes_with_membership() {
        let a = set_of(&[1, 1]);
        let b = set_of(&[1, 2]);
        assert_ne!(a.hash(), b.hash());
    }
}
