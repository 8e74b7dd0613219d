#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic_in_result_fn)]

use std::sync::Arc;

use crate::{HResult, Pkcs11Config, Pkcs11Context};

mod context;
mod session_pool;
#[cfg(feature = "softhsm2")]
mod softhsm2;

use mock_module::{MockModule, TEST_PIN};

const MOCK_LIBRARY: &str = "/usr/lib/mock/libpkcs11-mock.so";

/// Configuration of the `TEST` token of [`MockModule::with_test_token`]
fn test_config(max_sessions: usize) -> Pkcs11Config {
    Pkcs11Config::new(MOCK_LIBRARY)
        .with_token_label("TEST")
        .with_pin(TEST_PIN)
        .with_max_sessions_per_slot(max_sessions)
}

fn mock_context(module: &Arc<MockModule>, max_sessions: usize) -> HResult<Pkcs11Context> {
    Pkcs11Context::new(module.clone(), &test_config(max_sessions))
}
