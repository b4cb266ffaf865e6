//! Transfer contract boundary
//!
//! The bridge contract is the source of truth for transfer status. The mesh
//! only needs the reads and the batch write below; [`InMemoryTransferContract`]
//! enforces the same rules the on-chain contract does so the signing flow
//! can be exercised without a chain.

use crate::auth::registry::{FederatorRegistry, RegistryError};
use crate::crypto::Address;
use crate::federation::batch::{
    verify_quorum, BatchSignature, QuorumError, TransferBatch, TransferId, TransferStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContractError {
    #[error("Unknown transfer: {0}")]
    UnknownTransfer(TransferId),
    #[error("Empty batch")]
    EmptyBatch,
    #[error("Transfer {id} is already {status:?}")]
    AlreadyInStatus { id: TransferId, status: TransferStatus },
    #[error("Transfer {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: TransferId,
        from: TransferStatus,
        to: TransferStatus,
    },
    #[error("Only the sender may reclaim transfer {0}")]
    NotSender(TransferId),
    #[error("Transfer {id} can be reclaimed from block {available_at}")]
    ReclaimTooEarly { id: TransferId, available_at: u64 },
    #[error("Quorum error: {0}")]
    Quorum(#[from] QuorumError),
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Contract state unavailable")]
    Unavailable,
}

/// A transfer as the contract records it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: TransferId,
    pub sender: Address,
    pub amount: u64,
    pub status: TransferStatus,
    /// Block in which the transfer was requested
    pub block: u64,
}

pub trait TransferContract: Send + Sync {
    /// Transfers still waiting for the federation
    fn pending_transfers(&self) -> Result<Vec<TransferRecord>, ContractError>;

    fn transfer(&self, id: &TransferId) -> Result<Option<TransferRecord>, ContractError>;

    /// Apply a batch status change backed by quorum signatures
    fn submit_batch(
        &self,
        batch: &TransferBatch,
        signatures: &[BatchSignature],
    ) -> Result<(), ContractError>;

    /// Refund a transfer the federation never picked up
    fn reclaim(&self, id: &TransferId, caller: &Address) -> Result<(), ContractError>;
}

#[derive(Default)]
struct ContractState {
    transfers: BTreeMap<TransferId, TransferRecord>,
    block_height: u64,
}

pub struct InMemoryTransferContract {
    state: Mutex<ContractState>,
    registry: Arc<dyn FederatorRegistry>,
    threshold: usize,
    /// Blocks a sender must wait before reclaiming
    reclaim_delay: u64,
}

impl InMemoryTransferContract {
    pub fn new(registry: Arc<dyn FederatorRegistry>, threshold: usize, reclaim_delay: u64) -> Self {
        Self {
            state: Mutex::new(ContractState::default()),
            registry,
            threshold,
            reclaim_delay,
        }
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, ContractState>, ContractError> {
        self.state.lock().map_err(|_| ContractError::Unavailable)
    }

    /// Record a new pending transfer at the current block
    pub fn request_transfer(
        &self,
        id: TransferId,
        sender: Address,
        amount: u64,
    ) -> Result<(), ContractError> {
        let mut state = self.state()?;
        let block = state.block_height;
        state.transfers.insert(
            id,
            TransferRecord {
                id,
                sender,
                amount,
                status: TransferStatus::Pending,
                block,
            },
        );
        Ok(())
    }

    pub fn advance_blocks(&self, blocks: u64) -> Result<u64, ContractError> {
        let mut state = self.state()?;
        state.block_height += blocks;
        Ok(state.block_height)
    }

    pub fn block_height(&self) -> Result<u64, ContractError> {
        Ok(self.state()?.block_height)
    }
}

impl TransferContract for InMemoryTransferContract {
    fn pending_transfers(&self) -> Result<Vec<TransferRecord>, ContractError> {
        Ok(self
            .state()?
            .transfers
            .values()
            .filter(|t| t.status == TransferStatus::Pending)
            .cloned()
            .collect())
    }

    fn transfer(&self, id: &TransferId) -> Result<Option<TransferRecord>, ContractError> {
        Ok(self.state()?.transfers.get(id).cloned())
    }

    fn submit_batch(
        &self,
        batch: &TransferBatch,
        signatures: &[BatchSignature],
    ) -> Result<(), ContractError> {
        let ids = batch.canonical_ids();
        if ids.is_empty() {
            return Err(ContractError::EmptyBatch);
        }

        let federators = self.registry.federators()?;
        verify_quorum(&batch.hash(), signatures, &federators, self.threshold)?;

        let mut state = self.state()?;
        // Validate everything before touching any record
        for id in &ids {
            let record = state
                .transfers
                .get(id)
                .ok_or(ContractError::UnknownTransfer(*id))?;
            if record.status == batch.status {
                return Err(ContractError::AlreadyInStatus {
                    id: *id,
                    status: record.status,
                });
            }
            if !record.status.can_transition_to(batch.status) {
                return Err(ContractError::InvalidTransition {
                    id: *id,
                    from: record.status,
                    to: batch.status,
                });
            }
        }
        for id in &ids {
            if let Some(record) = state.transfers.get_mut(id) {
                record.status = batch.status;
            }
        }

        log::info!(
            "Batch of {} transfer(s) moved to {:?} with {} signature(s)",
            ids.len(),
            batch.status,
            signatures.len()
        );
        Ok(())
    }

    fn reclaim(&self, id: &TransferId, caller: &Address) -> Result<(), ContractError> {
        let mut state = self.state()?;
        let height = state.block_height;
        let record = state
            .transfers
            .get_mut(id)
            .ok_or(ContractError::UnknownTransfer(*id))?;
        if record.sender != *caller {
            return Err(ContractError::NotSender(*id));
        }
        if !record.status.can_transition_to(TransferStatus::Refunded) {
            return Err(ContractError::InvalidTransition {
                id: *id,
                from: record.status,
                to: TransferStatus::Refunded,
            });
        }
        let available_at = record.block + self.reclaim_delay;
        if height < available_at {
            return Err(ContractError::ReclaimTooEarly {
                id: *id,
                available_at,
            });
        }
        record.status = TransferStatus::Refunded;
        log::info!("Transfer {} reclaimed by {}", id, caller);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::registry::StaticRegistry;
    use crate::crypto::KeyPair;

    fn id(n: u8) -> TransferId {
        TransferId([n; 32])
    }

    fn setup(federators: usize, threshold: usize) -> (InMemoryTransferContract, Vec<KeyPair>) {
        let keys: Vec<KeyPair> = (0..federators).map(|_| KeyPair::generate()).collect();
        let registry = Arc::new(StaticRegistry::new(keys.iter().map(|k| k.address()).collect()));
        (InMemoryTransferContract::new(registry, threshold, 10), keys)
    }

    fn sign_all(keys: &[KeyPair], batch: &TransferBatch) -> Vec<BatchSignature> {
        keys.iter()
            .map(|k| BatchSignature::sign(k, &batch.hash()).unwrap())
            .collect()
    }

    #[test]
    fn test_batch_with_quorum_is_applied() {
        let (contract, keys) = setup(3, 2);
        let sender = KeyPair::generate().address();
        contract.request_transfer(id(1), sender, 500).unwrap();
        contract.request_transfer(id(2), sender, 700).unwrap();
        assert_eq!(contract.pending_transfers().unwrap().len(), 2);

        let batch = TransferBatch::new(vec![id(1), id(2)], TransferStatus::Sending);
        contract
            .submit_batch(&batch, &sign_all(&keys[..2], &batch))
            .unwrap();

        assert!(contract.pending_transfers().unwrap().is_empty());
        assert_eq!(
            contract.transfer(&id(1)).unwrap().unwrap().status,
            TransferStatus::Sending
        );
    }

    #[test]
    fn test_resubmitting_batch_is_rejected() {
        let (contract, keys) = setup(3, 2);
        contract
            .request_transfer(id(1), KeyPair::generate().address(), 1)
            .unwrap();
        let batch = TransferBatch::new(vec![id(1)], TransferStatus::Sending);
        let sigs = sign_all(&keys, &batch);

        contract.submit_batch(&batch, &sigs).unwrap();
        assert!(matches!(
            contract.submit_batch(&batch, &sigs),
            Err(ContractError::AlreadyInStatus { .. })
        ));
    }

    #[test]
    fn test_batch_without_quorum_changes_nothing() {
        let (contract, keys) = setup(3, 2);
        contract
            .request_transfer(id(1), KeyPair::generate().address(), 1)
            .unwrap();
        let batch = TransferBatch::new(vec![id(1), id(3)], TransferStatus::Sending);

        assert!(matches!(
            contract.submit_batch(&batch, &sign_all(&keys[..1], &batch)),
            Err(ContractError::Quorum(QuorumError::InsufficientSignatures { .. }))
        ));
        // Quorum is fine but one id is unknown; the other must stay pending
        assert!(matches!(
            contract.submit_batch(&batch, &sign_all(&keys, &batch)),
            Err(ContractError::UnknownTransfer(_))
        ));
        assert_eq!(
            contract.transfer(&id(1)).unwrap().unwrap().status,
            TransferStatus::Pending
        );
    }

    #[test]
    fn test_reclaim_waits_for_delay() {
        let (contract, _) = setup(1, 1);
        let sender = KeyPair::generate().address();
        contract.request_transfer(id(1), sender, 1).unwrap();

        assert!(matches!(
            contract.reclaim(&id(1), &KeyPair::generate().address()),
            Err(ContractError::NotSender(_))
        ));
        assert!(matches!(
            contract.reclaim(&id(1), &sender),
            Err(ContractError::ReclaimTooEarly { available_at: 10, .. })
        ));

        contract.advance_blocks(10).unwrap();
        contract.reclaim(&id(1), &sender).unwrap();
        assert_eq!(
            contract.transfer(&id(1)).unwrap().unwrap().status,
            TransferStatus::Refunded
        );
        assert!(matches!(
            contract.reclaim(&id(1), &sender),
            Err(ContractError::InvalidTransition { .. })
        ));
    }
}
