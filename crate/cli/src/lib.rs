pub mod actions;
mod commands;
pub mod error;

pub use commands::{Cli, CliCommands, hsm_keys_main};
