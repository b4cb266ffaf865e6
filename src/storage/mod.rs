//! Local persistence of observed contract events

pub mod persistence;

pub use persistence::{
    EventLog, EventStore, ObservedEvent, StorageConfig, StorageError, StorageStats,
};
