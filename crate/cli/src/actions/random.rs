use clap::Parser;
use hsm_keys::{Pkcs11Context, generate_random};

use crate::error::CliResult;

/// Get random bytes from the token, printed hex encoded
#[derive(Parser, Debug)]
#[clap(verbatim_doc_comment)]
pub struct RandomAction {
    /// The number of random bytes
    #[clap(long, short = 'n', default_value = "32")]
    pub length: usize,
}

impl RandomAction {
    /// # Errors
    ///
    /// Returns an error if the token cannot provide random data.
    pub fn process(&self, ctx: &Pkcs11Context) -> CliResult<()> {
        let random = generate_random(ctx, self.length)?;
        println!("{}", hex::encode(random));
        Ok(())
    }
}
