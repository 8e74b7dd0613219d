use clap::Args;
use hsm_keys::{Pkcs11Context, Pkcs11PrivateKey, PublicKey, find_key_pair};

use crate::error::{CliError, CliResult};

pub mod find;
pub mod info;
pub mod random;
pub mod sign;

/// Identify a key pair on the token
#[derive(Args, Debug, Clone, Default)]
#[group(required = true, multiple = true)]
pub struct KeySelector {
    /// The key id (`CKA_ID`), hex encoded
    #[clap(long, short = 'i')]
    pub id: Option<String>,

    /// The key label (`CKA_LABEL`)
    #[clap(long, short = 'l')]
    pub label: Option<String>,
}

impl KeySelector {
    /// Find the key pair on the token of the default slot
    ///
    /// # Errors
    /// The id is not valid hex, no selector is set, or the key is not found
    pub fn find(&self, ctx: &Pkcs11Context) -> CliResult<Pkcs11PrivateKey> {
        if self.id.is_none() && self.label.is_none() {
            return Err(CliError::UserError(
                "either a key id or a key label is required".to_owned(),
            ));
        }
        let id = self.id.as_deref().map(hex::decode).transpose()?;
        let key = find_key_pair(
            ctx,
            id.as_deref(),
            self.label.as_deref().map(str::as_bytes),
        )?;
        Ok(key)
    }
}

/// A printable description of a public key
#[must_use]
pub fn describe_public_key(public_key: &PublicKey) -> String {
    match public_key {
        PublicKey::Rsa {
            modulus,
            public_exponent,
        } => format!(
            "RSA public key\n  modulus: {}\n  public exponent: {}",
            hex::encode(modulus),
            hex::encode(public_exponent)
        ),
        PublicKey::Ec { params, point } => format!(
            "EC public key\n  parameters: {}\n  point: {}",
            hex::encode(params),
            hex::encode(point)
        ),
        PublicKey::Dsa {
            prime,
            subprime,
            base,
            value,
        } => format!(
            "DSA public key\n  prime: {}\n  subprime: {}\n  base: {}\n  value: {}",
            hex::encode(prime),
            hex::encode(subprime),
            hex::encode(base),
            hex::encode(value)
        ),
    }
}
