//! Signing, verification, address derivation and Merkle roots.
//!
//! The network's single canonical signature scheme is ed25519. All
//! operations here are pure and deterministic; malformed inputs surface as
//! `CryptoError`, never as panics.

use cpc_core::{AccountAddress, ConsensusAddress, Hash32, ACCOUNT_PREFIX, CONSENSUS_PREFIX};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SIGNATURE_LENGTH};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const PUBKEY_LEN: usize = 32;
pub const SECRET_LEN: usize = 32;
/// Address payload: leading bytes of the pubkey hash, bs58-encoded.
const ADDRESS_PAYLOAD_LEN: usize = 20;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("bad public key length")]
    BadPubkeyLength,
    #[error("bad secret key length")]
    BadSecretLength,
    #[error("bad signature length")]
    BadSignatureLength,
    #[error("invalid public key")]
    InvalidPubkey,
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

/// A freshly generated or loaded keypair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyMaterial {
    #[serde(with = "hex_bytes")]
    pub public_key: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub secret_key: Vec<u8>,
}

mod hex_bytes {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(de::Error::custom)
    }
}

pub fn generate_keypair() -> KeyMaterial {
    let mut csprng = OsRng;
    let signing = SigningKey::generate(&mut csprng);
    KeyMaterial {
        public_key: signing.verifying_key().to_bytes().to_vec(),
        secret_key: signing.to_bytes().to_vec(),
    }
}

pub fn sign(secret_key: &[u8], msg: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let sk: [u8; SECRET_LEN] = secret_key
        .try_into()
        .map_err(|_| CryptoError::BadSecretLength)?;
    let signing = SigningKey::from_bytes(&sk);
    Ok(signing.sign(msg).to_bytes().to_vec())
}

pub fn verify(pubkey: &[u8], msg: &[u8], signature: &[u8]) -> Result<bool, CryptoError> {
    let pk: [u8; PUBKEY_LEN] = pubkey.try_into().map_err(|_| CryptoError::BadPubkeyLength)?;
    let vk = VerifyingKey::from_bytes(&pk).map_err(|_| CryptoError::InvalidPubkey)?;
    let sig: [u8; SIGNATURE_LENGTH] = signature
        .try_into()
        .map_err(|_| CryptoError::BadSignatureLength)?;
    Ok(vk.verify(msg, &Signature::from_bytes(&sig)).is_ok())
}

pub fn hash(bytes: &[u8]) -> Hash32 {
    blake3::hash(bytes).into()
}

fn address_payload(pubkey: &[u8]) -> Result<String, CryptoError> {
    if pubkey.len() != PUBKEY_LEN {
        return Err(CryptoError::BadPubkeyLength);
    }
    let digest = blake3::hash(pubkey);
    Ok(bs58::encode(&digest.as_bytes()[..ADDRESS_PAYLOAD_LEN]).into_string())
}

/// Account address (`cpc…`) for a public key.
pub fn account_address(pubkey: &[u8]) -> Result<AccountAddress, CryptoError> {
    Ok(AccountAddress(format!("{}{}", ACCOUNT_PREFIX, address_payload(pubkey)?)))
}

/// Consensus address (`cpcvalcons…`) for a validator public key.
pub fn consensus_address(pubkey: &[u8]) -> Result<ConsensusAddress, CryptoError> {
    Ok(ConsensusAddress(format!(
        "{}{}",
        CONSENSUS_PREFIX,
        address_payload(pubkey)?
    )))
}

fn check_payload(payload: &str, full: &str) -> Result<(), CryptoError> {
    if payload.is_empty() {
        return Err(CryptoError::InvalidAddress(full.to_string()));
    }
    bs58::decode(payload)
        .into_vec()
        .map_err(|_| CryptoError::InvalidAddress(full.to_string()))?;
    Ok(())
}

/// Shape check for an account address. The treasury sentinel is accepted
/// even though no key derives it.
pub fn validate_account_address(addr: &AccountAddress) -> Result<(), CryptoError> {
    let s = addr.as_str();
    if s == cpc_core::TREASURY_ADDRESS {
        return Ok(());
    }
    // `cpcvalcons…` also starts with `cpc`; rule it out first.
    if s.starts_with(CONSENSUS_PREFIX) {
        return Err(CryptoError::InvalidAddress(s.to_string()));
    }
    let payload = s
        .strip_prefix(ACCOUNT_PREFIX)
        .ok_or_else(|| CryptoError::InvalidAddress(s.to_string()))?;
    check_payload(payload, s)
}

pub fn validate_consensus_address(addr: &ConsensusAddress) -> Result<(), CryptoError> {
    let s = addr.as_str();
    let payload = s
        .strip_prefix(CONSENSUS_PREFIX)
        .ok_or_else(|| CryptoError::InvalidAddress(s.to_string()))?;
    check_payload(payload, s)
}

/// Merkle root over ordered leaves: binary hashing, the last leaf is
/// duplicated on odd layers. Empty input yields the zero hash.
pub fn merkle_root(leaves: &[Hash32]) -> Hash32 {
    if leaves.is_empty() {
        return Hash32::zero();
    }
    let mut layer: Vec<Hash32> = leaves.to_vec();
    while layer.len() > 1 {
        let mut next = Vec::with_capacity((layer.len() + 1) / 2);
        for pair in layer.chunks(2) {
            let mut hasher = blake3::Hasher::new();
            hasher.update(pair[0].as_bytes());
            if pair.len() == 2 {
                hasher.update(pair[1].as_bytes());
            } else {
                hasher.update(pair[0].as_bytes());
            }
            next.push(hasher.finalize().into());
        }
        layer = next;
    }
    layer[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let kp = generate_keypair();
        let msg = b"hello computechain";
        let sig = sign(&kp.secret_key, msg).unwrap();
        assert!(verify(&kp.public_key, msg, &sig).unwrap());
        assert!(!verify(&kp.public_key, b"other message", &sig).unwrap());
    }

    #[test]
    fn verify_rejects_bad_lengths() {
        let kp = generate_keypair();
        assert!(verify(&kp.public_key[..16], b"m", &[0; 64]).is_err());
        assert!(verify(&kp.public_key, b"m", &[0; 10]).is_err());
    }

    #[test]
    fn addresses_have_prefixes() {
        let kp = generate_keypair();
        let account = account_address(&kp.public_key).unwrap();
        let consensus = consensus_address(&kp.public_key).unwrap();
        assert!(account.as_str().starts_with(ACCOUNT_PREFIX));
        assert!(consensus.as_str().starts_with(CONSENSUS_PREFIX));
        assert_ne!(account.as_str(), consensus.as_str());
        validate_account_address(&account).unwrap();
        validate_consensus_address(&consensus).unwrap();
    }

    #[test]
    fn account_validation_rejects_consensus_addresses() {
        let kp = generate_keypair();
        let consensus = consensus_address(&kp.public_key).unwrap();
        let as_account = AccountAddress(consensus.as_str().to_string());
        assert!(validate_account_address(&as_account).is_err());
    }

    #[test]
    fn address_derivation_is_deterministic() {
        let kp = generate_keypair();
        assert_eq!(
            account_address(&kp.public_key).unwrap(),
            account_address(&kp.public_key).unwrap()
        );
    }

    #[test]
    fn merkle_single_leaf_is_identity() {
        let leaf = hash(b"tx");
        assert_eq!(merkle_root(&[leaf]), leaf);
    }

    #[test]
    fn merkle_odd_layer_duplicates_last() {
        let a = hash(b"a");
        let b = hash(b"b");
        let c = hash(b"c");
        // Three leaves: (a,b) then (c,c).
        let root3 = merkle_root(&[a, b, c]);
        let root4 = merkle_root(&[a, b, c, c]);
        assert_eq!(root3, root4);
    }

    #[test]
    fn merkle_empty_is_zero() {
        assert_eq!(merkle_root(&[]), Hash32::zero());
    }
}
