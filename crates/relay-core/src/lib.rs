//! # Relay Core
//!
//! Beacon round types and acceptance logic for the randomness gossip relay.
//!
//! This crate contains **no networking code**. Both ends of the relay (the
//! bridge that publishes rounds and the client that consumes them) run every
//! round through the same validator before trusting it.
//!
//! ## Trust Model
//!
//! - **Signature verification** (`verification::signature`): BLS12-381
//!   signatures from the beacon network's group key over a digest that binds
//!   the chain identifier, the round number and the previous signature.
//!
//! - **Acceptance** (`verification::validator`): strictly increasing round
//!   numbers per chain, well-formed fields, valid signature. Anything else is
//!   dropped.

pub mod types;
pub mod verification;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use types::round::*;
pub use verification::{
    signature::{round_digest, BlsVerifier, RejectReason, RoundVerifier},
    validator::{accept, check_format, check_sequence, RoundValidator},
};
