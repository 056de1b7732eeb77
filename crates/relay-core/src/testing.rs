//! Deterministic BLS test chain.
//!
//! Signs rounds exactly the way a beacon network would, so tests on every
//! layer exercise real signature verification instead of a stub verifier.

use crate::types::round::*;
use crate::verification::signature::{round_digest, BlsVerifier, ROUND_SIGNATURE_DST};
use blst::min_pk::SecretKey;
use std::ops::RangeInclusive;

pub struct TestChain {
    chain_id: String,
    secret_key: SecretKey,
}

impl TestChain {
    pub fn new(chain_id: &str) -> Self {
        Self::with_seed(chain_id, [42u8; 32])
    }

    /// A chain with a different key. Rounds it signs fail verification
    /// against any other seed's verifier.
    pub fn with_seed(chain_id: &str, seed: [u8; 32]) -> Self {
        let secret_key = SecretKey::key_gen(&seed, &[]).expect("32-byte seed is valid ikm");
        Self {
            chain_id: chain_id.to_string(),
            secret_key,
        }
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    pub fn public_key(&self) -> BlsPublicKey {
        BlsPublicKey(self.secret_key.sk_to_pk().compress())
    }

    pub fn info(&self) -> ChainInfo {
        ChainInfo {
            hash: self.chain_id.clone(),
            public_key: self.public_key(),
            period: 3,
            genesis_time: 1_600_000_000,
        }
    }

    pub fn verifier(&self) -> BlsVerifier {
        BlsVerifier::new(&self.public_key()).expect("test key is valid")
    }

    /// Signature chained into round 1.
    pub fn genesis_seed(&self) -> Vec<u8> {
        randomness_from_signature(self.chain_id.as_bytes()).to_vec()
    }

    /// Sign a single round on top of the given previous signature.
    pub fn sign(&self, number: u64, previous_signature: &[u8]) -> Round {
        let digest = round_digest(&self.chain_id, number, previous_signature);
        let signature = self
            .secret_key
            .sign(&digest, ROUND_SIGNATURE_DST, &[])
            .compress()
            .to_vec();
        Round {
            round: number,
            randomness: randomness_from_signature(&signature).to_vec(),
            signature,
            previous_signature: previous_signature.to_vec(),
        }
    }

    /// Round `number`, correctly chained from round 1.
    pub fn round(&self, number: u64) -> Round {
        if number == 0 {
            return self.sign(0, &self.genesis_seed());
        }
        self.rounds(number..=number).remove(0)
    }

    /// Consecutive chained rounds covering `range`.
    pub fn rounds(&self, range: RangeInclusive<u64>) -> Vec<Round> {
        let mut previous = self.genesis_seed();
        let mut out = Vec::new();
        for number in 1..=*range.end() {
            let round = self.sign(number, &previous);
            previous = round.signature.clone();
            if range.contains(&number) {
                out.push(round);
            }
        }
        out
    }
}
