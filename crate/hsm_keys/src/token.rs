use pkcs11_sys::{CK_FLAGS, CK_SLOT_ID};

use crate::{Cryptoki, HError, HResult, TokenInfo};

/// Find the slot holding the requested token.
///
/// A token is identified by its serial number or by its label. All the
/// slots are searched by serial number first, then by label, and the first
/// match wins, so a serial match always takes precedence over a label match
/// on another slot. An absent selector never matches.
///
/// # Returns
/// The slot and the token flags
///
/// # Errors
/// * the token information of one of the slots cannot be read
/// * no token matches: `HError::TokenNotFound`
pub fn find_token(
    module: &dyn Cryptoki,
    slots: &[CK_SLOT_ID],
    serial: Option<&str>,
    label: Option<&str>,
) -> HResult<(CK_SLOT_ID, CK_FLAGS)> {
    let serial = serial.filter(|s| !s.is_empty());
    let label = label.filter(|l| !l.is_empty());
    // token infos read so far, for the label pass
    let mut tokens: Vec<(CK_SLOT_ID, TokenInfo)> = Vec::with_capacity(slots.len());
    for slot in slots {
        let info = module.get_token_info(*slot)?;
        if serial.is_some_and(|serial| info.serial_number == serial) {
            return Ok((*slot, info.flags));
        }
        tokens.push((*slot, info));
    }
    if let Some(label) = label {
        if let Some((slot, info)) = tokens.iter().find(|(_, info)| info.label == label) {
            return Ok((*slot, info.flags));
        }
    }
    Err(HError::TokenNotFound)
}
