use crate::types::round::*;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Domain separation tag for beacon round signatures (signatures on G2).
pub const ROUND_SIGNATURE_DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_NUL_";

/// Reasons a round is refused by the validator.
/// Each variant is a specific, loggable failure; none is ever sent to watchers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("Round {round} is not newer than last accepted round {last_accepted}")]
    NotNewer { round: u64, last_accepted: u64 },

    #[error("Round {round} has empty randomness")]
    EmptyRandomness { round: u64 },

    #[error("Round {round} has a {field} of {got} bytes, expected {expected}")]
    InvalidLength {
        round: u64,
        field: &'static str,
        got: usize,
        expected: usize,
    },

    #[error("Round {round} randomness does not match its signature")]
    RandomnessMismatch { round: u64 },

    #[error("Round {round} signature does not verify for chain {chain}")]
    InvalidSignature { round: u64, chain: String },

    #[error("Invalid chain public key: {0}")]
    InvalidPublicKey(String),
}

/// The verification capability used by the validator.
///
/// Implementations only answer "does this signature verify for this chain";
/// sequencing and format checks live in the validator.
pub trait RoundVerifier: Send + Sync {
    fn verify(&self, chain_id: &str, round: &Round) -> Result<(), RejectReason>;
}

/// Compute the message signed for a round.
///
/// digest = SHA256(chain_id || previous_signature || round_be64)
///
/// Binding the chain identifier means a round signed for one chain never
/// verifies on another chain's topic.
pub fn round_digest(chain_id: &str, round: u64, previous_signature: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(chain_id.as_bytes());
    hasher.update(previous_signature);
    hasher.update(round.to_be_bytes());
    let mut output = [0u8; 32];
    output.copy_from_slice(&hasher.finalize());
    output
}

/// Verifies round signatures against a chain's BLS12-381 group key.
/// Uses the blst library for the pairing check.
pub struct BlsVerifier {
    public_key: blst::min_pk::PublicKey,
}

impl BlsVerifier {
    pub fn new(public_key: &BlsPublicKey) -> Result<Self, RejectReason> {
        let public_key = blst::min_pk::PublicKey::key_validate(&public_key.0)
            .map_err(|e| RejectReason::InvalidPublicKey(format!("{:?}", e)))?;
        Ok(Self { public_key })
    }

    pub fn from_chain_info(info: &ChainInfo) -> Result<Self, RejectReason> {
        Self::new(&info.public_key)
    }
}

impl RoundVerifier for BlsVerifier {
    fn verify(&self, chain_id: &str, round: &Round) -> Result<(), RejectReason> {
        use blst::min_pk::Signature;
        use blst::BLST_ERROR;

        let invalid = || RejectReason::InvalidSignature {
            round: round.round,
            chain: chain_id.to_string(),
        };

        let sig = Signature::from_bytes(&round.signature).map_err(|_| invalid())?;
        let digest = round_digest(chain_id, round.round, &round.previous_signature);

        let result = sig.verify(true, &digest, ROUND_SIGNATURE_DST, &[], &self.public_key, true);
        if result != BLST_ERROR::BLST_SUCCESS {
            return Err(invalid());
        }
        Ok(())
    }
}
