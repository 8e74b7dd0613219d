//! These tests require a SoftHSM2 token and are gated behind the `softhsm2` feature.
//! To run them, initialize a token, then run (replace the label and PIN):
//! ```sh
//! softhsm2-util --init-token --free --label TEST --so-pin 4321 --pin 1234
//! HSM_TOKEN_LABEL=TEST HSM_USER_PASSWORD=1234 \
//!   cargo test --features softhsm2 -- --ignored tests::softhsm2
//! ```
use std::{sync::Arc, thread};

use hsm_keys_logger::{info, log_init};

use crate::{
    HError, HResult, Pkcs11Config, Pkcs11Context, find_key_pair, generate_random,
};

const SOFTHSM2_PKCS11_LIB: &str = "/usr/lib/softhsm/libsofthsm2.so";

fn softhsm2_config() -> HResult<Pkcs11Config> {
    let pin = std::env::var("HSM_USER_PASSWORD").map_err(|_| {
        HError::Default(
            "The user password for the HSM is not set. Please set the HSM_USER_PASSWORD \
             environment variable"
                .to_owned(),
        )
    })?;
    let path =
        std::env::var("SOFTHSM2_PKCS11_LIB").unwrap_or_else(|_| SOFTHSM2_PKCS11_LIB.to_owned());
    let label = std::env::var("HSM_TOKEN_LABEL").unwrap_or_else(|_| "TEST".to_owned());
    Ok(Pkcs11Config::new(path)
        .with_token_label(label)
        .with_pin(pin)
        .with_max_sessions_per_slot(2))
}

#[test]
#[ignore = "Requires Linux, SoftHSM2 library, and an initialized token"]
fn test_softhsm2_sessions() -> HResult<()> {
    log_init(None);
    let ctx = Arc::new(Pkcs11Context::open(&softhsm2_config()?)?);
    info!("{ctx:?}");
    assert!(ctx.login_required());

    let handles = (0..8)
        .map(|_| {
            let ctx = ctx.clone();
            thread::spawn(move || generate_random(&ctx, 32))
        })
        .collect::<Vec<_>>();
    for handle in handles {
        let random = handle
            .join()
            .map_err(|_| HError::Default("thread panicked".to_owned()))??;
        assert_eq!(random.len(), 32);
    }
    let stats = ctx.session_pool(ctx.default_slot())?.stats()?;
    assert!(stats.opened <= 2);
    assert_eq!(stats.in_use, 0);

    assert!(matches!(
        find_key_pair(&ctx, None, Some(b"no-such-key".as_slice())),
        Err(HError::KeyNotFound)
    ));
    Ok(())
}
