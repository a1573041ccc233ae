//! Command-line interface

pub mod commands;

pub use commands::{cmd_detect, cmd_run, load_config, CliResult, DEFAULT_NETWORK, TEXT_CODE};
