//! Copyright 2024 Cosmian Tech SAS
//!
//! Pooled, thread-safe access to the keys of a PKCS#11 token.
//!
//! A [`Pkcs11Context`] loads a PKCS#11 module, finds the configured token and
//! keeps a pool of sessions per slot. Key handles ([`Pkcs11PrivateKey`])
//! borrow a session from the pool of their slot for each signature or
//! decryption, so they can be shared freely between threads.

#![allow(non_snake_case)]

pub use config::{CONFIG_PATH_ENV, DEFAULT_MAX_SESSIONS_PER_SLOT, Pkcs11Config};
pub use context::{
    ContextCell, Pkcs11Context, configure, configure_from_env, configure_from_file, context,
};
pub use cryptoki::{Attribute, Cryptoki, Digest, Mechanism, TokenInfo};
pub use error::{HError, HResult, HResultHelper};
pub use hsm_lib::{HsmLib, Info};
pub use keys::{find_key_pair, find_key_pair_in_slot};
pub use object::{Pkcs11Object, Pkcs11PrivateKey, PublicKey, read_public_key};
pub use random::{Pkcs11Rng, generate_random, generate_random_in_slot};
pub use session_pool::{PoolStats, PooledSession, SessionPool};
pub use token::find_token;

mod config;
mod context;
mod cryptoki;
mod error;
mod hsm_lib;
mod keys;
mod object;
mod random;
mod session_pool;
mod token;

#[cfg(test)]
mod tests;
