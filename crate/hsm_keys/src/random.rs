use std::sync::Arc;

use pkcs11_sys::{CK_SLOT_ID, CKR_RANDOM_NO_RNG};
use rand::{TryCryptoRng, TryRngCore};

use crate::{HError, HResult, Pkcs11Context};

/// Get `len` random bytes from the token of the default slot
///
/// # Errors
/// See [`generate_random_in_slot`]
pub fn generate_random(context: &Pkcs11Context, len: usize) -> HResult<Vec<u8>> {
    generate_random_in_slot(context, context.default_slot(), len)
}

/// Get `len` random bytes from the token of `slot`.
///
/// # Errors
/// * the token has no random number generator, or returned fewer bytes than
///   requested: `HError::CannotGetRandomData`
/// * no session is available
pub fn generate_random_in_slot(
    context: &Pkcs11Context,
    slot: CK_SLOT_ID,
    len: usize,
) -> HResult<Vec<u8>> {
    let random = context
        .with_session(slot, |session| session.generate_random(len))
        .map_err(|e| match e.rv() {
            Some(CKR_RANDOM_NO_RNG) => HError::CannotGetRandomData,
            _ => e,
        })?;
    if random.len() != len {
        return Err(HError::CannotGetRandomData);
    }
    Ok(random)
}

/// A random number generator backed by the token of a slot
#[derive(Debug, Clone)]
pub struct Pkcs11Rng {
    context: Arc<Pkcs11Context>,
    slot: CK_SLOT_ID,
}

impl Pkcs11Rng {
    /// Use the token of the default slot
    #[must_use]
    pub fn new(context: Arc<Pkcs11Context>) -> Self {
        let slot = context.default_slot();
        Self { context, slot }
    }

    #[must_use]
    pub const fn with_slot(context: Arc<Pkcs11Context>, slot: CK_SLOT_ID) -> Self {
        Self { context, slot }
    }
}

impl TryRngCore for Pkcs11Rng {
    type Error = HError;

    fn try_next_u32(&mut self) -> Result<u32, Self::Error> {
        let mut bytes = [0_u8; 4];
        self.try_fill_bytes(&mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    fn try_next_u64(&mut self) -> Result<u64, Self::Error> {
        let mut bytes = [0_u8; 8];
        self.try_fill_bytes(&mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    fn try_fill_bytes(&mut self, dst: &mut [u8]) -> Result<(), Self::Error> {
        if dst.is_empty() {
            return Ok(());
        }
        let random = generate_random_in_slot(&self.context, self.slot, dst.len())?;
        dst.copy_from_slice(&random);
        Ok(())
    }
}

impl TryCryptoRng for Pkcs11Rng {}
