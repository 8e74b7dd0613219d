use std::path::PathBuf;

use clap::{Parser, Subcommand};
use hsm_keys::configure_from_file;
use hsm_keys_logger::{log_init, trace};

use crate::{
    actions::{find::FindAction, info::InfoAction, random::RandomAction, sign::SignAction},
    error::{CliError, CliResult},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file location
    ///
    /// This is an alternative to the env variable `HSM_KEYS_CONFIG_PATH`.
    /// Takes precedence over `HSM_KEYS_CONFIG_PATH` env variable.
    #[arg(short, long, env = "HSM_KEYS_CONFIG_PATH")]
    pub conf: Option<PathBuf>,

    #[command(subcommand)]
    pub command: CliCommands,
}

#[derive(Subcommand, Debug)]
pub enum CliCommands {
    Info(InfoAction),
    Random(RandomAction),
    Find(FindAction),
    Sign(SignAction),
}

impl Cli {
    /// Configure the PKCS#11 library and run the command.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no configuration file, the library
    /// cannot be configured, or the command fails.
    pub fn run(&self) -> CliResult<()> {
        let conf = self.conf.as_ref().ok_or_else(|| {
            CliError::Configuration(
                "no configuration file: use --conf or set HSM_KEYS_CONFIG_PATH".to_owned(),
            )
        })?;
        let ctx = configure_from_file(conf)?;
        trace!("Context: {ctx:?}");

        match &self.command {
            CliCommands::Info(action) => action.process(&ctx),
            CliCommands::Random(action) => action.process(&ctx),
            CliCommands::Find(action) => action.process(&ctx),
            CliCommands::Sign(action) => action.process(&ctx),
        }
    }
}

/// Main function of the `hsm-keys` command line tool.
///
/// Results are printed on the standard output and logs on the standard
/// error. Only warnings are logged unless `RUST_LOG` says otherwise.
///
/// # Errors
///
/// See [`Cli::run`]
pub fn hsm_keys_main() -> CliResult<()> {
    log_init(Some("warn"));
    Cli::parse().run()
}
