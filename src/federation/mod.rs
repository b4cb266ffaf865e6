//! Federation coordination on top of the mesh
//!
//! Batch hashing and quorum rules, the transfer contract boundary, and the
//! signing service that federators run against each other.

pub mod batch;
pub mod contract;
pub mod signer;

pub use batch::{
    batch_hash, majority, verify_quorum, BatchSignature, QuorumError, TransferBatch, TransferId,
    TransferStatus,
};
pub use contract::{ContractError, InMemoryTransferContract, TransferContract, TransferRecord};
pub use signer::{FederationError, FederationService, KIND_SIGNATURE, KIND_SIGN_REQUEST};

/// Group every federator joins to receive sign requests
pub const FEDERATION_GROUP: &str = "federation";
