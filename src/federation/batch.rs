//! Transfer batches and quorum signatures
//!
//! A batch moves a set of transfers to one target status. Federators sign
//! the batch hash in `eth_sign` form; the contract accepts the batch once a
//! threshold of distinct authorized federators has signed it.

use crate::crypto::{eth_signed_digest, keccak256_parts, recover_address, Address, KeyError, KeyPair};
use crate::mesh::message::hex_bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuorumError {
    #[error("Threshold must be at least 1")]
    InvalidThreshold,
    #[error("Invalid signature claimed for {0}")]
    InvalidSignature(Address),
    #[error("Signer not authorized: {0}")]
    UnauthorizedSigner(Address),
    #[error("Duplicate signature from {0}")]
    DuplicateSigner(Address),
    #[error("Insufficient signatures: have {have}, need {need}")]
    InsufficientSignatures { have: usize, need: usize },
}

/// Identifier of a transfer as recorded by the contract
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(pub [u8; 32]);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransferId({})", self)
    }
}

impl FromStr for TransferId {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim().trim_start_matches("0x");
        let bytes = hex::decode(digits).map_err(|_| KeyError::InvalidAddress(s.into()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| KeyError::InvalidAddress(s.into()))?;
        Ok(TransferId(bytes))
    }
}

impl Serialize for TransferId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TransferId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Lifecycle of a transfer on the contract
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Sending,
    Mined,
    Refunded,
}

impl TransferStatus {
    /// Byte committed to by the batch hash
    pub fn as_byte(self) -> u8 {
        match self {
            TransferStatus::Pending => 1,
            TransferStatus::Sending => 2,
            TransferStatus::Mined => 3,
            TransferStatus::Refunded => 4,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(TransferStatus::Pending),
            2 => Some(TransferStatus::Sending),
            3 => Some(TransferStatus::Mined),
            4 => Some(TransferStatus::Refunded),
            _ => None,
        }
    }

    pub fn can_transition_to(self, next: TransferStatus) -> bool {
        matches!(
            (self, next),
            (TransferStatus::Pending, TransferStatus::Sending)
                | (TransferStatus::Pending, TransferStatus::Refunded)
                | (TransferStatus::Sending, TransferStatus::Mined)
        )
    }
}

impl FromStr for TransferStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(TransferStatus::Pending),
            "sending" => Ok(TransferStatus::Sending),
            "mined" => Ok(TransferStatus::Mined),
            "refunded" => Ok(TransferStatus::Refunded),
            other => Err(format!("unknown transfer status: {}", other)),
        }
    }
}

/// Status change for a set of transfers
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferBatch {
    pub transfer_ids: Vec<TransferId>,
    pub status: TransferStatus,
    /// Bitcoin transaction carrying the transfers, when there is one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub btc_tx_hash: Option<TransferId>,
}

impl TransferBatch {
    pub fn new(transfer_ids: Vec<TransferId>, status: TransferStatus) -> Self {
        Self {
            transfer_ids,
            status,
            btc_tx_hash: None,
        }
    }

    pub fn with_btc_tx(mut self, hash: TransferId) -> Self {
        self.btc_tx_hash = Some(hash);
        self
    }

    /// Ids in canonical order without duplicates
    pub fn canonical_ids(&self) -> Vec<TransferId> {
        self.transfer_ids
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn hash(&self) -> [u8; 32] {
        batch_hash(self)
    }
}

/// Canonical hash of a batch; independent of id order and repetition
pub fn batch_hash(batch: &TransferBatch) -> [u8; 32] {
    let ids = batch.canonical_ids();
    let status = [batch.status.as_byte()];
    let mut parts: Vec<&[u8]> = ids.iter().map(|id| id.0.as_slice()).collect();
    parts.push(&status);
    if let Some(tx) = &batch.btc_tx_hash {
        parts.push(tx.0.as_slice());
    }
    keccak256_parts(&parts)
}

/// One federator's signature over a batch hash
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSignature {
    pub signer: Address,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

impl BatchSignature {
    pub fn sign(keys: &KeyPair, hash: &[u8; 32]) -> Result<Self, KeyError> {
        let signature = keys.sign_recoverable(&eth_signed_digest(hash))?;
        Ok(Self {
            signer: keys.address(),
            signature: signature.to_vec(),
        })
    }

    /// Address that actually produced the signature
    pub fn recover(&self, hash: &[u8; 32]) -> Result<Address, KeyError> {
        recover_address(&eth_signed_digest(hash), &self.signature)
    }

    pub fn is_valid_for(&self, hash: &[u8; 32]) -> bool {
        matches!(self.recover(hash), Ok(signer) if signer == self.signer)
    }
}

/// Check that `signatures` carry at least `threshold` distinct authorized
/// signers over `hash`. Returns the signers in submission order.
pub fn verify_quorum(
    hash: &[u8; 32],
    signatures: &[BatchSignature],
    authorized: &[Address],
    threshold: usize,
) -> Result<Vec<Address>, QuorumError> {
    if threshold == 0 {
        return Err(QuorumError::InvalidThreshold);
    }

    let mut seen = BTreeSet::new();
    let mut signers = Vec::with_capacity(signatures.len());
    for signature in signatures {
        if !signature.is_valid_for(hash) {
            return Err(QuorumError::InvalidSignature(signature.signer));
        }
        if !authorized.contains(&signature.signer) {
            return Err(QuorumError::UnauthorizedSigner(signature.signer));
        }
        if !seen.insert(signature.signer) {
            return Err(QuorumError::DuplicateSigner(signature.signer));
        }
        signers.push(signature.signer);
    }

    if signers.len() < threshold {
        return Err(QuorumError::InsufficientSignatures {
            have: signers.len(),
            need: threshold,
        });
    }
    Ok(signers)
}

/// Simple majority of `federators`
pub fn majority(federators: usize) -> usize {
    federators / 2 + 1
}
