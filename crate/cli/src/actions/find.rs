use clap::Parser;
use hsm_keys::Pkcs11Context;

use super::{KeySelector, describe_public_key};
use crate::error::CliResult;

/// Find a key pair and print its public key
#[derive(Parser, Debug)]
#[clap(verbatim_doc_comment)]
pub struct FindAction {
    #[clap(flatten)]
    pub key: KeySelector,
}

impl FindAction {
    /// # Errors
    ///
    /// Returns an error if the key pair cannot be found.
    pub fn process(&self, ctx: &Pkcs11Context) -> CliResult<()> {
        let key = self.key.find(ctx)?;
        println!(
            "Private key handle {} on slot {}",
            key.object().handle,
            key.object().slot
        );
        let (id, label) = key.identify(ctx)?;
        println!("  id: {}", hex::encode(id));
        println!("  label: {}", String::from_utf8_lossy(&label));
        println!("{}", describe_public_key(key.public()));
        Ok(())
    }
}
