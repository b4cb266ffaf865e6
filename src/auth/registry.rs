//! Authorized federator registry
//!
//! The handshake only needs one read: the current list of addresses allowed
//! to act as federators. The list is eventually consistent with the chain.

use crate::crypto::Address;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid registry file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Registry unavailable: {0}")]
    Unavailable(String),
}

pub trait FederatorRegistry: Send + Sync {
    /// Addresses currently authorized as federators
    fn federators(&self) -> Result<Vec<Address>, RegistryError>;

    fn is_authorized(&self, address: &Address) -> Result<bool, RegistryError> {
        Ok(self.federators()?.contains(address))
    }
}

/// Fixed list, replaceable at runtime
#[derive(Default)]
pub struct StaticRegistry {
    addresses: RwLock<Vec<Address>>,
}

impl StaticRegistry {
    pub fn new(addresses: Vec<Address>) -> Self {
        Self {
            addresses: RwLock::new(addresses),
        }
    }

    pub fn replace(&self, addresses: Vec<Address>) {
        if let Ok(mut current) = self.addresses.write() {
            *current = addresses;
        }
    }
}

impl FederatorRegistry for StaticRegistry {
    fn federators(&self) -> Result<Vec<Address>, RegistryError> {
        self.addresses
            .read()
            .map(|a| a.clone())
            .map_err(|_| RegistryError::Unavailable("lock poisoned".into()))
    }
}

/// JSON array of addresses on disk, re-read on every lookup so that an
/// external process syncing the on-chain list can update it in place
pub struct JsonFileRegistry {
    path: PathBuf,
}

impl JsonFileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, addresses: &[Address]) -> Result<(), RegistryError> {
        let data = serde_json::to_string_pretty(addresses)?;
        fs::write(&self.path, data)?;
        Ok(())
    }
}

impl FederatorRegistry for JsonFileRegistry {
    fn federators(&self) -> Result<Vec<Address>, RegistryError> {
        let data = fs::read_to_string(&self.path)?;
        let addresses: Vec<Address> = serde_json::from_str(&data)?;
        log::trace!(
            "Read {} federator(s) from {}",
            addresses.len(),
            self.path.display()
        );
        Ok(addresses)
    }
}
