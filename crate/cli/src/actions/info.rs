use clap::Parser;
use hsm_keys::Pkcs11Context;

use crate::error::{CliResult, CliResultHelper};

/// Print the configured module, the resolved token and its session pool
#[derive(Parser, Debug)]
#[clap(verbatim_doc_comment)]
pub struct InfoAction;

impl InfoAction {
    /// # Errors
    ///
    /// Returns an error if the token information cannot be read.
    pub fn process(&self, ctx: &Pkcs11Context) -> CliResult<()> {
        let slot = ctx.default_slot();
        let token = ctx
            .module()
            .get_token_info(slot)
            .with_context(|| format!("Can't read the token information of slot {slot}"))?;
        let stats = ctx.session_pool(slot)?.stats()?;

        println!("Library: {}", ctx.module_path());
        println!("Slot: {slot}");
        println!("Token label: {}", token.label);
        println!("Token serial number: {}", token.serial_number);
        println!("Token manufacturer: {}", token.manufacturer_id);
        println!("Token model: {}", token.model);
        println!("Token flags: {:#x}", ctx.token_flags());
        println!("Login required: {}", ctx.login_required());
        println!(
            "Sessions: {} opened, {} idle, at most {}",
            stats.opened, stats.idle, stats.max_sessions
        );
        Ok(())
    }
}
