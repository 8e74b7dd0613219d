use std::{fs, path::PathBuf};

use clap::{Parser, ValueEnum};
use hsm_keys::{Digest, Mechanism, Pkcs11Context};

use super::KeySelector;
use crate::error::{CliResult, CliResultHelper};

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureMechanism {
    /// PKCS#1 v1.5 over a DER encoded `DigestInfo`
    RsaPkcs,
    /// PSS with SHA-256, MGF1 SHA-256 and a 32 bytes salt, over a SHA-256 digest
    RsaPssSha256,
    Ecdsa,
    Dsa,
}

impl From<SignatureMechanism> for Mechanism {
    fn from(mechanism: SignatureMechanism) -> Self {
        match mechanism {
            SignatureMechanism::RsaPkcs => Self::RsaPkcs,
            SignatureMechanism::RsaPssSha256 => Self::RsaPkcsPss {
                digest: Digest::Sha256,
                salt_length: 32,
            },
            SignatureMechanism::Ecdsa => Self::Ecdsa,
            SignatureMechanism::Dsa => Self::Dsa,
        }
    }
}

/// Sign the content of a file with a key of the token.
///
/// The file content is passed as is to the token: for all the mechanisms,
/// it must already be the digest (or `DigestInfo`) to sign.
/// The signature is printed hex encoded.
#[derive(Parser, Debug)]
#[clap(verbatim_doc_comment)]
pub struct SignAction {
    #[clap(flatten)]
    pub key: KeySelector,

    /// The signature mechanism
    #[clap(long, short = 'm', value_enum)]
    pub mechanism: SignatureMechanism,

    /// The file holding the data to sign
    #[clap(long, value_name = "FILE")]
    pub input: PathBuf,
}

impl SignAction {
    /// # Errors
    ///
    /// Returns an error if the input cannot be read, the key is not found,
    /// or the token fails to sign.
    pub fn process(&self, ctx: &Pkcs11Context) -> CliResult<()> {
        let data = fs::read(&self.input)
            .with_context(|| format!("Can't read the input file {}", self.input.display()))?;
        let key = self.key.find(ctx)?;
        let signature = key.sign(ctx, &self.mechanism.into(), &data)?;
        println!("{}", hex::encode(signature));
        Ok(())
    }
}
