//! Batch signing over the mesh
//!
//! The coordinator of a batch asks the members of a federation group to sign
//! it. Each member checks the batch against its own view of the contract and
//! answers with a signature; the coordinator gathers answers until it holds
//! enough distinct authorized signatures to submit.

use crate::auth::registry::{FederatorRegistry, RegistryError};
use crate::crypto::{Address, KeyError, KeyPair};
use crate::federation::batch::{BatchSignature, TransferBatch};
use crate::federation::contract::{ContractError, TransferContract};
use crate::mesh::identity::NodeId;
use crate::mesh::node::{Delivery, MeshEvent, NodeError, NodeHandle};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

pub const KIND_SIGN_REQUEST: &str = "federation.sign-request";
pub const KIND_SIGNATURE: &str = "federation.signature";

#[derive(Error, Debug)]
pub enum FederationError {
    #[error("Contract error: {0}")]
    Contract(#[from] ContractError),
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Mesh error: {0}")]
    Node(#[from] NodeError),
    #[error("Timed out with {have} of {need} signatures")]
    Timeout { have: usize, need: usize },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignRequest {
    pub request_id: u64,
    pub batch: TransferBatch,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignResponse {
    pub request_id: u64,
    pub signature: BatchSignature,
}

/// Signs batches for peers and collects signatures for local batches
#[derive(Clone)]
pub struct FederationService {
    node: NodeHandle,
    keys: KeyPair,
    contract: Arc<dyn TransferContract>,
    registry: Arc<dyn FederatorRegistry>,
}

impl FederationService {
    pub fn new(
        node: NodeHandle,
        keys: KeyPair,
        contract: Arc<dyn TransferContract>,
        registry: Arc<dyn FederatorRegistry>,
    ) -> Self {
        Self {
            node,
            keys,
            contract,
            registry,
        }
    }

    pub fn address(&self) -> Address {
        self.keys.address()
    }

    /// Sign `batch` if every transfer in it may move to the target status
    /// in our own view of the contract
    pub fn sign(&self, batch: &TransferBatch) -> Result<Option<BatchSignature>, FederationError> {
        for id in batch.canonical_ids() {
            match self.contract.transfer(&id)? {
                Some(record) if record.status.can_transition_to(batch.status) => {}
                Some(record) => {
                    log::warn!(
                        "Refusing to sign: transfer {} is {:?}, batch wants {:?}",
                        id,
                        record.status,
                        batch.status
                    );
                    return Ok(None);
                }
                None => {
                    log::warn!("Refusing to sign: transfer {} is unknown", id);
                    return Ok(None);
                }
            }
        }
        Ok(Some(BatchSignature::sign(&self.keys, &batch.hash())?))
    }

    /// Answer sign requests from other federators until the node stops
    pub fn spawn(self) -> JoinHandle<()> {
        let mut events = self.node.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(MeshEvent::Data(delivery)) if delivery.kind == KIND_SIGN_REQUEST => {
                        if let Err(e) = self.answer(delivery) {
                            log::warn!("Failed to answer sign request: {}", e);
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        log::warn!("Federation service missed {} mesh event(s)", missed);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn answer(&self, delivery: Delivery) -> Result<(), FederationError> {
        let request: SignRequest = serde_json::from_slice(&delivery.payload)?;
        let Some(signature) = self.sign(&request.batch)? else {
            return Ok(());
        };
        let payload = serde_json::to_vec(&SignResponse {
            request_id: request.request_id,
            signature,
        })?;

        let node = self.node.clone();
        let target = delivery.source;
        tokio::spawn(async move {
            if let Err(e) = node.send(target, KIND_SIGNATURE, payload).await {
                log::warn!("Signature for {} not delivered: {}", target.short(), e);
            }
        });
        log::debug!(
            "Signed batch of {} transfer(s) for {}",
            request.batch.transfer_ids.len(),
            delivery.source.short()
        );
        Ok(())
    }

    /// Gather at least `threshold` distinct authorized signatures over
    /// `batch`, starting with our own, from the members of `group`
    pub async fn collect_signatures(
        &self,
        group: &str,
        batch: &TransferBatch,
        threshold: usize,
        timeout: Duration,
    ) -> Result<Vec<BatchSignature>, FederationError> {
        let hash = batch.hash();
        let authorized = self.registry.federators()?;
        let mut signers = BTreeSet::new();
        let mut signatures = Vec::new();

        if let Some(own) = self.sign(batch)? {
            signers.insert(own.signer);
            signatures.push(own);
        }
        if signatures.len() >= threshold {
            return Ok(signatures);
        }

        // Subscribe before asking so no reply can slip past
        let mut events = self.node.subscribe();
        let request_id = rand::random::<u64>();
        let payload = serde_json::to_vec(&SignRequest {
            request_id,
            batch: batch.clone(),
        })?;
        let node = self.node.clone();
        let group_name = group.to_string();
        let fanout = tokio::spawn(async move {
            match node.send_to_group(&group_name, KIND_SIGN_REQUEST, payload).await {
                Ok(results) => {
                    for (member, result) in results {
                        if let Err(e) = result {
                            log::debug!("Sign request to {} failed: {}", member.short(), e);
                        }
                    }
                }
                Err(e) => log::warn!("Sign request fan-out failed: {}", e),
            }
        });

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let outcome = loop {
            if signatures.len() >= threshold {
                break Ok(());
            }
            tokio::select! {
                event = events.recv() => match event {
                    Ok(MeshEvent::Data(delivery)) if delivery.kind == KIND_SIGNATURE => {
                        if let Some(signature) =
                            accept_response(&delivery, request_id, &hash, &authorized, &signers)
                        {
                            signers.insert(signature.signer);
                            signatures.push(signature);
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        log::warn!("Signature collector missed {} mesh event(s)", missed);
                    }
                    Err(RecvError::Closed) => break Err(FederationError::Node(NodeError::Stopped)),
                },
                _ = &mut deadline => {
                    break Err(FederationError::Timeout {
                        have: signatures.len(),
                        need: threshold,
                    });
                }
            }
        };
        fanout.abort();
        outcome.map(|_| signatures)
    }
}

fn accept_response(
    delivery: &Delivery,
    request_id: u64,
    hash: &[u8; 32],
    authorized: &[Address],
    signers: &BTreeSet<Address>,
) -> Option<BatchSignature> {
    let response: SignResponse = match serde_json::from_slice(&delivery.payload) {
        Ok(response) => response,
        Err(e) => {
            log::warn!("Malformed signature from {}: {}", delivery.source.short(), e);
            return None;
        }
    };
    if response.request_id != request_id {
        return None;
    }
    let signature = response.signature;
    let from: NodeId = delivery.source;
    if !signature.is_valid_for(hash) {
        log::warn!("Invalid batch signature from {}", from.short());
        return None;
    }
    if !authorized.contains(&signature.signer) {
        log::warn!("Signature from unauthorized signer {}", signature.signer);
        return None;
    }
    if signers.contains(&signature.signer) {
        log::debug!("Ignoring repeated signature from {}", signature.signer);
        return None;
    }
    Some(signature)
}
