//! CLI commands for the federator
//!
//! Implements all command handlers for the CLI interface.

use crate::api::{self, ApiState};
use crate::auth::{FederatorRegistry, JsonFileRegistry};
use crate::config::NodeConfig;
use crate::crypto::KeyPair;
use crate::federation::{TransferBatch, TransferId, TransferStatus, FEDERATION_GROUP};
use crate::mesh::node::MeshEvent;
use crate::mesh::synced::FullValue;
use crate::network::Node;
use crate::storage::{EventStore, StorageConfig};
use serde_json::json;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Synced value every federator publishes about itself
pub const STATUS_VALUE: &str = "federator.status";

/// Read a hex private key file
pub fn load_keys(path: &Path) -> CliResult<KeyPair> {
    let data = fs::read_to_string(path)
        .map_err(|e| format!("cannot read key file {}: {}", path.display(), e))?;
    Ok(KeyPair::from_private_key_hex(data.trim())?)
}

/// Generate a federator key
pub fn cmd_keygen(output: &Path, force: bool) -> CliResult<()> {
    if output.exists() && !force {
        println!("⚠️  Key file already exists at {}", output.display());
        println!("   Use --force to overwrite it");
        return Ok(());
    }

    let keys = KeyPair::generate();
    fs::write(output, keys.private_key_hex())?;

    println!("🔐 New federator key created!");
    println!("   📍 Address: {}", keys.address());
    println!("   🔑 Public Key: {}", keys.public_key_hex());
    println!("   💾 Saved to: {}", output.display());
    println!("\n   ⚠️  The address must be added to the federator registry before");
    println!("   other federators will accept connections from this node.");

    Ok(())
}

/// Show the address of a key file
pub fn cmd_address(key_file: &Path) -> CliResult<()> {
    let keys = load_keys(key_file)?;
    println!("{}", keys.address());
    Ok(())
}

/// Compute the hash federators sign for a batch
pub fn cmd_batch_hash(ids: &[String], status: &str, btc_tx: Option<&str>) -> CliResult<()> {
    let transfer_ids = ids
        .iter()
        .map(|id| id.parse::<TransferId>())
        .collect::<Result<Vec<_>, _>>()?;
    let status: TransferStatus = status.parse()?;
    let mut batch = TransferBatch::new(transfer_ids, status);
    if let Some(tx) = btc_tx {
        batch = batch.with_btc_tx(tx.parse()?);
    }

    println!("0x{}", hex::encode(batch.hash()));
    Ok(())
}

/// Run a federator until Ctrl+C
pub async fn cmd_start(config: NodeConfig) -> CliResult<()> {
    let keys = load_keys(&config.key_file)?;
    let registry = Arc::new(JsonFileRegistry::new(&config.registry_file));
    match registry.is_authorized(&keys.address()) {
        Ok(true) => {}
        Ok(false) => log::warn!(
            "{} is not in {}; peers will refuse this node",
            keys.address(),
            config.registry_file.display()
        ),
        Err(e) => log::warn!("Federator registry not readable: {}", e),
    }

    let store = EventStore::open(StorageConfig {
        data_dir: config.data_dir.clone(),
        ..Default::default()
    })?;

    let address = keys.address();
    let api_port = config.api_port;
    let mut node = Node::new(config, keys, registry);
    let mesh = node.mesh().clone();
    let mut events = mesh.subscribe();
    let local_addr = node.start().await?;

    mesh.join_group(FEDERATION_GROUP).await?;
    mesh.register_value(
        STATUS_VALUE,
        json!({ "address": address, "last_block": store.last_block() }),
        Box::new(FullValue),
    )
    .await?;

    println!("🌐 Federator {} listening on {}", address, local_addr);
    println!("   Mesh id: {}", mesh.local_id());

    if let Some(port) = api_port {
        let state = ApiState::new(mesh.clone(), address);
        tokio::spawn(async move {
            if let Err(e) = api::serve(port, state).await {
                log::error!("Status API stopped: {}", e);
            }
        });
        println!("   Status API on http://localhost:{}", port);
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(missed)) => log::warn!("Missed {} mesh event(s)", missed),
                Err(RecvError::Closed) => break,
            },
        }
    }

    println!("\n📴 Shutting down federator...");
    store.save()?;
    node.shutdown();
    Ok(())
}

fn log_event(event: &MeshEvent) {
    match event {
        MeshEvent::NodeAvailable(id) => log::info!("Node {} is reachable", id.short()),
        MeshEvent::NodeUnavailable(id) => log::info!("Node {} is unreachable", id.short()),
        MeshEvent::GroupMemberJoined { group, node } => {
            log::info!("{} joined {}", node.short(), group)
        }
        MeshEvent::GroupMemberLeft { group, node } => {
            log::info!("{} left {}", node.short(), group)
        }
        MeshEvent::ValueUpdated(update) => log::debug!(
            "{} of {} is now at version {}",
            update.name,
            update.node.short(),
            update.version
        ),
        MeshEvent::Data(delivery) => log::debug!(
            "{} message from {}",
            delivery.kind,
            delivery.source.short()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_keygen_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("federator.key");
        cmd_keygen(&path, false).unwrap();
        let keys = load_keys(&path).unwrap();

        // Without --force the key is kept
        cmd_keygen(&path, false).unwrap();
        assert_eq!(load_keys(&path).unwrap().address(), keys.address());

        cmd_keygen(&path, true).unwrap();
        assert_ne!(load_keys(&path).unwrap().address(), keys.address());
    }

    #[test]
    fn test_batch_hash_rejects_bad_input() {
        let id = format!("0x{}", "11".repeat(32));
        assert!(cmd_batch_hash(&[id.clone()], "sending", None).is_ok());
        assert!(cmd_batch_hash(&[id.clone()], "teleported", None).is_err());
        assert!(cmd_batch_hash(&["0x12".into()], "sending", None).is_err());
        assert!(cmd_batch_hash(&[id.clone()], "mined", Some(&id)).is_ok());
    }

    #[test]
    fn test_missing_key_file() {
        let dir = tempdir().unwrap();
        assert!(load_keys(&dir.path().join("absent.key")).is_err());
    }
}
