use crate::types::round::*;
use crate::verification::signature::{RejectReason, RoundVerifier};
use std::sync::Arc;

/// Decide whether `round` may be accepted after `last_accepted`.
///
/// This performs the complete acceptance pipeline:
/// 1. Sequencing: the round number must be strictly greater than the last accepted one
/// 2. Format: field sizes, non-empty randomness, randomness derived from the signature
/// 3. Signature: delegated to the chain's verifier
///
/// `last_accepted` is zero before anything was accepted, so round 0 is never valid.
/// Pure: the caller owns the pointer and advances it on `Ok`.
pub fn accept(
    chain_id: &str,
    round: &Round,
    last_accepted: u64,
    verifier: &dyn RoundVerifier,
) -> Result<(), RejectReason> {
    check_sequence(round, last_accepted)?;
    check_format(round)?;
    verifier.verify(chain_id, round)
}

/// Monotonic sequencing check.
pub fn check_sequence(round: &Round, last_accepted: u64) -> Result<(), RejectReason> {
    if round.round <= last_accepted {
        return Err(RejectReason::NotNewer {
            round: round.round,
            last_accepted,
        });
    }
    Ok(())
}

/// Structural checks that need no key material.
pub fn check_format(round: &Round) -> Result<(), RejectReason> {
    if round.randomness.is_empty() {
        return Err(RejectReason::EmptyRandomness { round: round.round });
    }
    if round.randomness.len() != RANDOMNESS_LEN {
        return Err(RejectReason::InvalidLength {
            round: round.round,
            field: "randomness",
            got: round.randomness.len(),
            expected: RANDOMNESS_LEN,
        });
    }
    if round.signature.len() != BLS_SIGNATURE_LEN {
        return Err(RejectReason::InvalidLength {
            round: round.round,
            field: "signature",
            got: round.signature.len(),
            expected: BLS_SIGNATURE_LEN,
        });
    }
    if round.randomness[..] != round.expected_randomness()[..] {
        return Err(RejectReason::RandomnessMismatch { round: round.round });
    }
    Ok(())
}

/// Per-chain acceptance state: the verifier plus the last accepted round number.
///
/// Rejections never move the pointer. Accepting moves it to the highest round
/// seen, so a late lower round can never rewind it.
#[derive(Clone)]
pub struct RoundValidator {
    chain_id: String,
    verifier: Arc<dyn RoundVerifier>,
    last_accepted: u64,
}

impl RoundValidator {
    pub fn new(chain_id: impl Into<String>, verifier: Arc<dyn RoundVerifier>) -> Self {
        Self {
            chain_id: chain_id.into(),
            verifier,
            last_accepted: 0,
        }
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    /// Highest accepted round number, zero if none.
    pub fn last_accepted(&self) -> u64 {
        self.last_accepted
    }

    /// Run the full pipeline without touching state.
    pub fn check(&self, round: &Round) -> Result<(), RejectReason> {
        accept(&self.chain_id, round, self.last_accepted, self.verifier.as_ref())
    }

    /// Format and signature only. Used where sequencing is someone else's concern,
    /// e.g. gossip-level validation of relayed messages.
    pub fn check_authentic(&self, round: &Round) -> Result<(), RejectReason> {
        check_format(round)?;
        self.verifier.verify(&self.chain_id, round)
    }

    /// Sequencing only, against the current pointer.
    pub fn check_newer(&self, round: &Round) -> Result<(), RejectReason> {
        check_sequence(round, self.last_accepted)
    }

    /// Advance the pointer after a round was accepted (and, for the bridge, published).
    pub fn record(&mut self, round: u64) {
        self.last_accepted = self.last_accepted.max(round);
    }

    /// Check and, on success, advance in one step.
    pub fn accept(&mut self, round: &Round) -> Result<(), RejectReason> {
        self.check(round)?;
        self.record(round.round);
        Ok(())
    }
}

impl std::fmt::Debug for RoundValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoundValidator")
            .field("chain_id", &self.chain_id)
            .field("last_accepted", &self.last_accepted)
            .finish()
    }
}
