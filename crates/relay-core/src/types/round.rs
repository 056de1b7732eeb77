use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Number of bytes in a BLS12-381 public key (compressed G1 point).
pub const BLS_PUBKEY_LEN: usize = 48;

/// Number of bytes in a BLS12-381 signature (compressed G2 point).
pub const BLS_SIGNATURE_LEN: usize = 96;

/// Number of bytes of randomness carried by a round (SHA256 of the signature).
pub const RANDOMNESS_LEN: usize = 32;

/// Hex (de)serialization for variable-length byte fields.
/// Accepts an optional `0x` prefix on input, always writes bare hex.
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        let s = s.strip_prefix("0x").unwrap_or(&s);
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// A BLS12-381 public key (48 bytes, compressed G1 point).
/// This is the group key of the beacon network that signs every round.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlsPublicKey(pub [u8; BLS_PUBKEY_LEN]);

impl Serialize for BlsPublicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for BlsPublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let s = s.strip_prefix("0x").unwrap_or(&s);
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        Self::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

impl BlsPublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, &'static str> {
        if bytes.len() != BLS_PUBKEY_LEN {
            return Err("Invalid BLS public key length");
        }
        let mut arr = [0u8; BLS_PUBKEY_LEN];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }
}

/// One round of beacon randomness.
///
/// Rounds arrive from untrusted places (the source stream, gossip peers), so
/// the byte fields are kept variable-length here and checked by the validator
/// rather than rejected during decoding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Round {
    /// Round number. Strictly increasing per chain.
    pub round: u64,
    /// The randomness value: SHA256 of the signature.
    #[serde(with = "hex_bytes")]
    pub randomness: Vec<u8>,
    /// BLS signature over the round digest.
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
    /// Signature of the previous round, chained into this round's digest.
    #[serde(with = "hex_bytes", default)]
    pub previous_signature: Vec<u8>,
}

/// Errors decoding a round from gossip bytes.
#[derive(Debug, Error)]
pub enum RoundDecodeError {
    #[error("Round payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl Round {
    /// Serialize to the wire format published on gossip topics.
    pub fn to_bytes(&self) -> Vec<u8> {
        // Serializing a struct of integers and strings cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Decode a round from its wire format. No validation happens here.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RoundDecodeError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// The randomness a well-formed round must carry for its signature.
    pub fn expected_randomness(&self) -> [u8; 32] {
        randomness_from_signature(&self.signature)
    }
}

/// Derive the randomness value from a round signature.
pub fn randomness_from_signature(signature: &[u8]) -> [u8; 32] {
    let mut output = [0u8; 32];
    output.copy_from_slice(&Sha256::digest(signature));
    output
}

/// Public parameters of a beacon chain, as served by the source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainInfo {
    /// The chain identifier. Topic names and round digests are derived from it.
    pub hash: String,
    /// Group public key that signs every round.
    pub public_key: BlsPublicKey,
    /// Seconds between rounds.
    pub period: u64,
    /// Unix time of round 1.
    pub genesis_time: u64,
}

impl ChainInfo {
    /// The round expected to be current at `unix_time`. Zero before genesis.
    pub fn round_at(&self, unix_time: u64) -> u64 {
        if unix_time < self.genesis_time || self.period == 0 {
            return 0;
        }
        (unix_time - self.genesis_time) / self.period + 1
    }
}
