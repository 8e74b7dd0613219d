//! The PKCS#11 operations the session layer relies on.
//!
//! [`Cryptoki`] is implemented by [`crate::HsmLib`] for a dynamically loaded
//! module and by in-memory modules in tests. Sessions and objects are plain
//! PKCS#11 handles; attributes and mechanisms cross this boundary as owned
//! Rust values so that implementations never share raw pointers with callers.

use pkcs11_sys::{
    CK_ATTRIBUTE_TYPE, CK_FLAGS, CK_MECHANISM_TYPE, CK_OBJECT_CLASS, CK_OBJECT_HANDLE,
    CK_RSA_PKCS_MGF_TYPE, CK_SESSION_HANDLE, CK_SLOT_ID, CK_ULONG, CK_USER_TYPE, CKA_CLASS,
    CKA_ID, CKA_LABEL, CKF_LOGIN_REQUIRED, CKG_MGF1_SHA1, CKG_MGF1_SHA256, CKG_MGF1_SHA384,
    CKG_MGF1_SHA512, CKM_DSA, CKM_ECDSA, CKM_RSA_PKCS, CKM_RSA_PKCS_OAEP, CKM_RSA_PKCS_PSS,
    CKM_SHA_1, CKM_SHA256, CKM_SHA384, CKM_SHA512,
};
use zeroize::Zeroizing;

use crate::HResult;

/// Session-less and session-scoped calls into a PKCS#11 module.
///
/// Implementations must be callable from any thread. They do not need to
/// serialize calls on a given session: the session pool guarantees that a
/// session handle is only ever used by one caller at a time.
pub trait Cryptoki: Send + Sync {
    /// List the slots, optionally only those with a token present
    fn get_slot_list(&self, token_present: bool) -> HResult<Vec<CK_SLOT_ID>>;

    /// Read the token information of a slot
    fn get_token_info(&self, slot_id: CK_SLOT_ID) -> HResult<TokenInfo>;

    fn open_session(&self, slot_id: CK_SLOT_ID, flags: CK_FLAGS) -> HResult<CK_SESSION_HANDLE>;

    fn close_session(&self, session: CK_SESSION_HANDLE) -> HResult<()>;

    /// Log in on the token. A token already logged in is not an error.
    fn login(&self, session: CK_SESSION_HANDLE, user_type: CK_USER_TYPE, pin: &[u8])
    -> HResult<()>;

    /// Find all the objects matching the template
    fn find_objects(
        &self,
        session: CK_SESSION_HANDLE,
        template: &[Attribute],
    ) -> HResult<Vec<CK_OBJECT_HANDLE>>;

    /// Read attribute values, in the order of `types`.
    /// An attribute the module cannot return is `None`.
    fn get_attribute_values(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        types: &[CK_ATTRIBUTE_TYPE],
    ) -> HResult<Vec<Option<Vec<u8>>>>;

    fn sign(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
        data: &[u8],
    ) -> HResult<Vec<u8>>;

    fn decrypt(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
        ciphertext: &[u8],
    ) -> HResult<Zeroizing<Vec<u8>>>;

    /// Ask the token for `len` random bytes. Fewer bytes may be returned.
    fn generate_random(&self, session: CK_SESSION_HANDLE, len: usize) -> HResult<Vec<u8>>;
}

/// Token information, with the blank padding of the fixed size fields removed
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TokenInfo {
    pub label: String,
    pub manufacturer_id: String,
    pub model: String,
    pub serial_number: String,
    pub flags: CK_FLAGS,
}

impl TokenInfo {
    #[must_use]
    pub const fn login_required(&self) -> bool {
        self.flags & CKF_LOGIN_REQUIRED != 0
    }
}

/// Decode a blank (or NUL) padded PKCS#11 text field
pub(crate) fn padded_string(field: &[u8]) -> String {
    String::from_utf8_lossy(field)
        .trim_end_matches([' ', '\0'])
        .to_owned()
}

/// An attribute of a search template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub type_: CK_ATTRIBUTE_TYPE,
    pub value: Vec<u8>,
}

impl Attribute {
    pub fn new(type_: CK_ATTRIBUTE_TYPE, value: impl Into<Vec<u8>>) -> Self {
        Self {
            type_,
            value: value.into(),
        }
    }

    /// A `CKA_CLASS` attribute
    #[must_use]
    pub fn class(class: CK_OBJECT_CLASS) -> Self {
        Self::ulong(CKA_CLASS, class)
    }

    #[must_use]
    pub fn id(id: &[u8]) -> Self {
        Self::new(CKA_ID, id)
    }

    #[must_use]
    pub fn label(label: &[u8]) -> Self {
        Self::new(CKA_LABEL, label)
    }

    /// An attribute holding a `CK_ULONG`, in native byte order as PKCS#11 expects
    #[must_use]
    pub fn ulong(type_: CK_ATTRIBUTE_TYPE, value: CK_ULONG) -> Self {
        Self::new(type_, value.to_ne_bytes())
    }
}

/// Decode a `CK_ULONG` attribute value
pub(crate) fn ulong_from_bytes(bytes: &[u8]) -> HResult<CK_ULONG> {
    Ok(CK_ULONG::from_ne_bytes(bytes.try_into()?))
}

/// Digest used by the RSA PSS and OAEP mechanisms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Digest {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl Digest {
    #[must_use]
    pub const fn mechanism(self) -> CK_MECHANISM_TYPE {
        match self {
            Self::Sha1 => CKM_SHA_1,
            Self::Sha256 => CKM_SHA256,
            Self::Sha384 => CKM_SHA384,
            Self::Sha512 => CKM_SHA512,
        }
    }

    #[must_use]
    pub const fn mgf(self) -> CK_RSA_PKCS_MGF_TYPE {
        match self {
            Self::Sha1 => CKG_MGF1_SHA1,
            Self::Sha256 => CKG_MGF1_SHA256,
            Self::Sha384 => CKG_MGF1_SHA384,
            Self::Sha512 => CKG_MGF1_SHA512,
        }
    }
}

/// Signature and decryption mechanisms understood by the session layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    RsaPkcs,
    RsaPkcsPss { digest: Digest, salt_length: usize },
    RsaPkcsOaep { digest: Digest },
    Ecdsa,
    Dsa,
}

impl Mechanism {
    #[must_use]
    pub const fn mechanism_type(&self) -> CK_MECHANISM_TYPE {
        match self {
            Self::RsaPkcs => CKM_RSA_PKCS,
            Self::RsaPkcsPss { .. } => CKM_RSA_PKCS_PSS,
            Self::RsaPkcsOaep { .. } => CKM_RSA_PKCS_OAEP,
            Self::Ecdsa => CKM_ECDSA,
            Self::Dsa => CKM_DSA,
        }
    }
}
