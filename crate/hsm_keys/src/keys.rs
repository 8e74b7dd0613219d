use pkcs11_sys::{CK_OBJECT_CLASS, CK_OBJECT_HANDLE, CK_SLOT_ID, CKO_PRIVATE_KEY, CKO_PUBLIC_KEY};

use crate::{
    Attribute, HError, HResult, Pkcs11Context, Pkcs11Object, Pkcs11PrivateKey, PooledSession,
    hsm_ensure, object::read_public_key,
};

/// Find a key pair on the token of the default slot.
///
/// See [`find_key_pair_in_slot`].
///
/// # Errors
/// See [`find_key_pair_in_slot`]
pub fn find_key_pair(
    context: &Pkcs11Context,
    id: Option<&[u8]>,
    label: Option<&[u8]>,
) -> HResult<Pkcs11PrivateKey> {
    find_key_pair_in_slot(context, context.default_slot(), id, label)
}

/// Find a key pair by `CKA_ID`, `CKA_LABEL` or both.
///
/// Both the private and the public key must match. When several objects
/// match, the first one returned by the token is used.
///
/// # Errors
/// * neither an id nor a label is given
/// * the private or the public key is missing: `HError::KeyNotFound`
/// * the public key type is not supported
pub fn find_key_pair_in_slot(
    context: &Pkcs11Context,
    slot: CK_SLOT_ID,
    id: Option<&[u8]>,
    label: Option<&[u8]>,
) -> HResult<Pkcs11PrivateKey> {
    hsm_ensure!(
        id.is_some() || label.is_some(),
        "a key id or a key label is required to find a key pair"
    );
    context.with_session(slot, |session| {
        let private_handle = find_first(session, CKO_PRIVATE_KEY, id, label)?;
        let public_handle = find_first(session, CKO_PUBLIC_KEY, id, label)?;
        let public_key = read_public_key(session, public_handle)?;
        Ok(Pkcs11PrivateKey::new(
            Pkcs11Object::new(private_handle, slot),
            public_key,
        ))
    })
}

fn find_first(
    session: &PooledSession<'_>,
    class: CK_OBJECT_CLASS,
    id: Option<&[u8]>,
    label: Option<&[u8]>,
) -> HResult<CK_OBJECT_HANDLE> {
    let mut template = vec![Attribute::class(class)];
    if let Some(id) = id {
        template.push(Attribute::id(id));
    }
    if let Some(label) = label {
        template.push(Attribute::label(label));
    }
    session
        .find_objects(&template)?
        .first()
        .copied()
        .ok_or(HError::KeyNotFound)
}
