//! Command-line interface

pub mod commands;

pub use commands::{
    cmd_address, cmd_batch_hash, cmd_keygen, cmd_start, load_keys, CliResult, STATUS_VALUE,
};
