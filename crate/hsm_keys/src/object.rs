//! References to objects stored on a token.
//!
//! An object handle only makes sense in a session of the slot the object
//! lives on, so [`Pkcs11Object`] records both. It never holds a session:
//! every operation borrows one from the pool of its slot for the duration of
//! the call.
//!
//! A [`Pkcs11PrivateKey`] also carries its public key. Retrieving the public
//! part of a key cannot report errors to its callers, so it is read from the
//! token once, when the key is loaded, rather than on demand.

use pkcs11_sys::{
    CK_ATTRIBUTE_TYPE, CK_KEY_TYPE, CK_OBJECT_HANDLE, CK_SLOT_ID, CKA_BASE, CKA_EC_PARAMS,
    CKA_EC_POINT, CKA_ID, CKA_KEY_TYPE, CKA_LABEL, CKA_MODULUS, CKA_PRIME, CKA_PUBLIC_EXPONENT,
    CKA_SUBPRIME, CKA_VALUE, CKK_DSA, CKK_EC, CKK_RSA,
};
use zeroize::Zeroizing;

use crate::{
    HError, HResult, Mechanism, Pkcs11Context, PooledSession, cryptoki::ulong_from_bytes,
};

/// A loaded PKCS#11 object: its handle and the slot it lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pkcs11Object {
    pub handle: CK_OBJECT_HANDLE,
    pub slot: CK_SLOT_ID,
}

impl Pkcs11Object {
    #[must_use]
    pub const fn new(handle: CK_OBJECT_HANDLE, slot: CK_SLOT_ID) -> Self {
        Self { handle, slot }
    }

    /// Run `operation` on a session of this object's slot
    ///
    /// # Errors
    /// See [`Pkcs11Context::with_session`]
    pub fn with_session<T, E, F>(&self, context: &Pkcs11Context, operation: F) -> Result<T, E>
    where
        F: FnOnce(&PooledSession<'_>) -> Result<T, E>,
        E: From<HError>,
    {
        context.with_session(self.slot, operation)
    }

    /// Read back the `CKA_ID` and `CKA_LABEL` of this object
    ///
    /// # Errors
    /// No session is available or either attribute cannot be read
    pub fn identify(&self, context: &Pkcs11Context) -> HResult<(Vec<u8>, Vec<u8>)> {
        let [id, label] = self.with_session(context, |session| {
            read_attribute_array(session, self.handle, [CKA_ID, CKA_LABEL])
        })?;
        Ok((id, label))
    }
}

/// The public part of a key pair, as stored on the token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKey {
    Rsa {
        modulus: Vec<u8>,
        public_exponent: Vec<u8>,
    },
    Ec {
        /// DER encoded curve parameters
        params: Vec<u8>,
        /// DER encoded point
        point: Vec<u8>,
    },
    Dsa {
        prime: Vec<u8>,
        subprime: Vec<u8>,
        base: Vec<u8>,
        value: Vec<u8>,
    },
}

impl PublicKey {
    #[must_use]
    pub const fn key_type(&self) -> CK_KEY_TYPE {
        match self {
            Self::Rsa { .. } => CKK_RSA,
            Self::Ec { .. } => CKK_EC,
            Self::Dsa { .. } => CKK_DSA,
        }
    }
}

/// Read the public key held by `handle`.
///
/// # Errors
/// * the key type is not RSA, EC or DSA: `HError::UnsupportedKeyType`
/// * a required attribute is not available
pub fn read_public_key(session: &PooledSession<'_>, handle: CK_OBJECT_HANDLE) -> HResult<PublicKey> {
    let key_type = read_attributes(session, handle, &[CKA_KEY_TYPE])?
        .pop()
        .ok_or_else(|| HError::Default("Failed to read the key type".to_owned()))?;
    let key_type = ulong_from_bytes(&key_type)?;
    match key_type {
        CKK_RSA => {
            let [modulus, public_exponent] =
                read_attribute_array(session, handle, [CKA_MODULUS, CKA_PUBLIC_EXPONENT])?;
            Ok(PublicKey::Rsa {
                modulus,
                public_exponent,
            })
        }
        CKK_EC => {
            let [params, point] =
                read_attribute_array(session, handle, [CKA_EC_PARAMS, CKA_EC_POINT])?;
            Ok(PublicKey::Ec { params, point })
        }
        CKK_DSA => {
            let [prime, subprime, base, value] = read_attribute_array(
                session,
                handle,
                [CKA_PRIME, CKA_SUBPRIME, CKA_BASE, CKA_VALUE],
            )?;
            Ok(PublicKey::Dsa {
                prime,
                subprime,
                base,
                value,
            })
        }
        other => Err(HError::UnsupportedKeyType(other)),
    }
}

/// Read attributes which must all be available
fn read_attributes(
    session: &PooledSession<'_>,
    handle: CK_OBJECT_HANDLE,
    types: &[CK_ATTRIBUTE_TYPE],
) -> HResult<Vec<Vec<u8>>> {
    session
        .get_attribute_values(handle, types)?
        .into_iter()
        .zip(types)
        .map(|(value, attribute)| {
            value.ok_or(HError::AttributeUnavailable {
                attribute: *attribute,
                object: handle,
            })
        })
        .collect()
}

fn read_attribute_array<const N: usize>(
    session: &PooledSession<'_>,
    handle: CK_OBJECT_HANDLE,
    types: [CK_ATTRIBUTE_TYPE; N],
) -> HResult<[Vec<u8>; N]> {
    read_attributes(session, handle, &types)?
        .try_into()
        .map_err(|_| HError::Default(format!("Expected {N} attributes for object {handle}")))
}

/// A private key stored on a token, with its public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pkcs11PrivateKey {
    object: Pkcs11Object,
    public_key: PublicKey,
}

impl Pkcs11PrivateKey {
    #[must_use]
    pub const fn new(object: Pkcs11Object, public_key: PublicKey) -> Self {
        Self { object, public_key }
    }

    /// Load a private key, reading its public key from `public_handle` now.
    ///
    /// # Errors
    /// * the slot has no session pool
    /// * the public key cannot be read, see [`read_public_key`]
    pub fn load(
        context: &Pkcs11Context,
        object: Pkcs11Object,
        public_handle: CK_OBJECT_HANDLE,
    ) -> HResult<Self> {
        let public_key =
            object.with_session(context, |session| read_public_key(session, public_handle))?;
        Ok(Self::new(object, public_key))
    }

    #[must_use]
    pub const fn object(&self) -> &Pkcs11Object {
        &self.object
    }

    /// The id and label of the key on its token
    ///
    /// # Errors
    /// See [`Pkcs11Object::identify`]
    pub fn identify(&self, context: &Pkcs11Context) -> HResult<(Vec<u8>, Vec<u8>)> {
        self.object.identify(context)
    }

    /// The public key; never fails, it was read when the key was loaded
    #[must_use]
    pub const fn public(&self) -> &PublicKey {
        &self.public_key
    }

    /// Sign `data` on a session of the key's slot.
    ///
    /// # Errors
    /// No session is available or the token fails to sign
    pub fn sign(
        &self,
        context: &Pkcs11Context,
        mechanism: &Mechanism,
        data: &[u8],
    ) -> HResult<Vec<u8>> {
        self.object.with_session(context, |session| {
            session.sign(mechanism, self.object.handle, data)
        })
    }

    /// Decrypt `ciphertext` on a session of the key's slot.
    ///
    /// # Errors
    /// No session is available or the token fails to decrypt
    pub fn decrypt(
        &self,
        context: &Pkcs11Context,
        mechanism: &Mechanism,
        ciphertext: &[u8],
    ) -> HResult<Zeroizing<Vec<u8>>> {
        self.object.with_session(context, |session| {
            session.decrypt(mechanism, self.object.handle, ciphertext)
        })
    }
}
