use std::{
    ffi::{CStr, c_void},
    fmt::{self, Display, Formatter},
    ptr,
};

use hsm_keys_logger::{debug, warn};
use libloading::Library;
use pkcs11_sys::*;
use zeroize::Zeroizing;

use crate::{
    HError, HResult,
    cryptoki::{Attribute, Cryptoki, Mechanism, TokenInfo, padded_string},
};

/// Value of `ulValueLen` for an attribute the module cannot return
const CK_UNAVAILABLE_INFORMATION: CK_ULONG = CK_ULONG::MAX;

/// Maximum number of handles fetched per `C_FindObjects` round
const FIND_OBJECTS_BATCH: usize = 64;

/// Call a function of the library and return its `CK_RV`.
macro_rules! ffi_rv {
    ($hsm:expr, $func:ident $(, $arg:expr)* $(,)?) => {{
        #[expect(unsafe_code)]
        let rv = unsafe {
            $hsm.$func.ok_or_else(|| {
                HError::Default(concat!(stringify!($func), " not available on library").to_owned())
            })?($($arg),*)
        };
        rv
    }};
}

/// Call a function of the library, returning early with an error unless it succeeds.
macro_rules! hsm_call {
    ($hsm:expr, $msg:expr, $func:ident $(, $arg:expr)* $(,)?) => {{
        let rv = ffi_rv!($hsm, $func $(, $arg)*);
        if rv != CKR_OK {
            return Err(HError::pkcs11($msg, rv));
        }
    }};
}

/// A PKCS#11 library loaded from a shared object.
///
/// The function pointers are resolved once when the library is loaded. The
/// library is initialized with `CKF_OS_LOCKING_OK` so that it may be called
/// from several threads, and finalized when this value is dropped.
///
/// # Safety
///
/// All the FFI calls are made with buffers owned by the calling function and
/// sized according to the lengths the module reported.
pub struct HsmLib {
    _library: Library,
    finalize_on_drop: bool,
    pub(crate) C_Initialize: CK_C_Initialize,
    pub(crate) C_Finalize: CK_C_Finalize,
    pub(crate) C_GetInfo: CK_C_GetInfo,

    pub(crate) C_GetSlotList: CK_C_GetSlotList,
    pub(crate) C_GetTokenInfo: CK_C_GetTokenInfo,

    pub(crate) C_OpenSession: CK_C_OpenSession,
    pub(crate) C_CloseSession: CK_C_CloseSession,
    pub(crate) C_Login: CK_C_Login,

    pub(crate) C_FindObjectsInit: CK_C_FindObjectsInit,
    pub(crate) C_FindObjects: CK_C_FindObjects,
    pub(crate) C_FindObjectsFinal: CK_C_FindObjectsFinal,
    pub(crate) C_GetAttributeValue: CK_C_GetAttributeValue,

    pub(crate) C_SignInit: CK_C_SignInit,
    pub(crate) C_Sign: CK_C_Sign,
    pub(crate) C_DecryptInit: CK_C_DecryptInit,
    pub(crate) C_Decrypt: CK_C_Decrypt,

    pub(crate) C_GenerateRandom: CK_C_GenerateRandom,
}

impl HsmLib {
    /// Load the library at `path` and initialize it.
    ///
    /// # Errors
    /// * the library cannot be loaded or misses a required symbol
    /// * `C_Initialize` fails
    pub fn instantiate<P>(path: P) -> HResult<Self>
    where
        P: AsRef<std::ffi::OsStr>,
    {
        #[expect(unsafe_code)]
        let mut hsm_lib = unsafe {
            let library = Library::new(path)?;
            Self {
                C_Initialize: Some(*library.get(b"C_Initialize")?),
                C_Finalize: Some(*library.get(b"C_Finalize")?),
                C_GetInfo: Some(*library.get(b"C_GetInfo")?),
                C_GetSlotList: Some(*library.get(b"C_GetSlotList")?),
                C_GetTokenInfo: Some(*library.get(b"C_GetTokenInfo")?),
                C_OpenSession: Some(*library.get(b"C_OpenSession")?),
                C_CloseSession: Some(*library.get(b"C_CloseSession")?),
                C_Login: Some(*library.get(b"C_Login")?),
                C_FindObjectsInit: Some(*library.get(b"C_FindObjectsInit")?),
                C_FindObjects: Some(*library.get(b"C_FindObjects")?),
                C_FindObjectsFinal: Some(*library.get(b"C_FindObjectsFinal")?),
                C_GetAttributeValue: Some(*library.get(b"C_GetAttributeValue")?),
                C_SignInit: Some(*library.get(b"C_SignInit")?),
                C_Sign: Some(*library.get(b"C_Sign")?),
                C_DecryptInit: Some(*library.get(b"C_DecryptInit")?),
                C_Decrypt: Some(*library.get(b"C_Decrypt")?),
                C_GenerateRandom: Some(*library.get(b"C_GenerateRandom")?),
                finalize_on_drop: false,
                // we need to keep the library alive
                _library: library,
            }
        };
        hsm_lib.finalize_on_drop = hsm_lib.initialize()?;
        Ok(hsm_lib)
    }

    /// Initialize the library. Returns `false` when it was already
    /// initialized by another user in this process.
    fn initialize(&self) -> HResult<bool> {
        let mut init_args = CK_C_INITIALIZE_ARGS {
            CreateMutex: None,
            DestroyMutex: None,
            LockMutex: None,
            UnlockMutex: None,
            flags: CKF_OS_LOCKING_OK,
            pReserved: ptr::null_mut(),
        };
        let rv = ffi_rv!(
            self,
            C_Initialize,
            (&raw mut init_args).cast::<c_void>()
        );
        match rv {
            CKR_OK => Ok(true),
            CKR_CRYPTOKI_ALREADY_INITIALIZED => {
                warn!("PKCS#11 library already initialized in this process");
                Ok(false)
            }
            rv => Err(HError::pkcs11("Failed initializing the HSM", rv)),
        }
    }

    fn finalize(&self) -> HResult<()> {
        hsm_call!(
            self,
            "Failed to finalize the HSM",
            C_Finalize,
            ptr::null_mut()
        );
        Ok(())
    }

    /// General information about the library
    pub fn get_info(&self) -> HResult<Info> {
        let mut info = CK_INFO::default();
        hsm_call!(self, "Failed getting HSM info", C_GetInfo, &raw mut info);
        Ok(info.into())
    }
}

impl Drop for HsmLib {
    fn drop(&mut self) {
        if self.finalize_on_drop {
            drop(self.finalize());
        }
    }
}

/// Keeps the parameters of a mechanism alive while a `CK_MECHANISM` points to them
enum MechanismParameter {
    Empty,
    Pss(CK_RSA_PKCS_PSS_PARAMS),
    Oaep(CK_RSA_PKCS_OAEP_PARAMS),
}

impl MechanismParameter {
    fn new(mechanism: &Mechanism) -> HResult<Self> {
        Ok(match mechanism {
            Mechanism::RsaPkcsPss {
                digest,
                salt_length,
            } => Self::Pss(CK_RSA_PKCS_PSS_PARAMS {
                hashAlg: digest.mechanism(),
                mgf: digest.mgf(),
                sLen: CK_ULONG::try_from(*salt_length)?,
            }),
            Mechanism::RsaPkcsOaep { digest } => Self::Oaep(CK_RSA_PKCS_OAEP_PARAMS {
                hashAlg: digest.mechanism(),
                mgf: digest.mgf(),
                source: CKZ_DATA_SPECIFIED,
                pSourceData: ptr::null_mut(),
                ulSourceDataLen: 0,
            }),
            Mechanism::RsaPkcs | Mechanism::Ecdsa | Mechanism::Dsa => Self::Empty,
        })
    }
}

/// Run `f` with a `CK_MECHANISM` built from `mechanism`
fn with_ck_mechanism<T>(
    mechanism: &Mechanism,
    f: impl FnOnce(CK_MECHANISM_PTR) -> HResult<T>,
) -> HResult<T> {
    let mut parameter = MechanismParameter::new(mechanism)?;
    let (parameter_ptr, parameter_len) = match &mut parameter {
        MechanismParameter::Empty => (ptr::null_mut(), 0),
        MechanismParameter::Pss(params) => (
            ptr::from_mut(params).cast::<c_void>(),
            size_of::<CK_RSA_PKCS_PSS_PARAMS>(),
        ),
        MechanismParameter::Oaep(params) => (
            ptr::from_mut(params).cast::<c_void>(),
            size_of::<CK_RSA_PKCS_OAEP_PARAMS>(),
        ),
    };
    let mut ck_mechanism = CK_MECHANISM {
        mechanism: mechanism.mechanism_type(),
        pParameter: parameter_ptr,
        ulParameterLen: CK_ULONG::try_from(parameter_len)?,
    };
    f(&raw mut ck_mechanism)
}

impl Cryptoki for HsmLib {
    fn get_slot_list(&self, token_present: bool) -> HResult<Vec<CK_SLOT_ID>> {
        let token_present: CK_BBOOL = if token_present { CK_TRUE } else { CK_FALSE };
        let mut count: CK_ULONG = 0;
        hsm_call!(
            self,
            "Failed listing the slots",
            C_GetSlotList,
            token_present,
            ptr::null_mut(),
            &raw mut count
        );
        let mut slots: Vec<CK_SLOT_ID> = vec![0; usize::try_from(count)?];
        hsm_call!(
            self,
            "Failed listing the slots",
            C_GetSlotList,
            token_present,
            slots.as_mut_ptr(),
            &raw mut count
        );
        slots.truncate(usize::try_from(count)?);
        Ok(slots)
    }

    fn get_token_info(&self, slot_id: CK_SLOT_ID) -> HResult<TokenInfo> {
        let mut info = CK_TOKEN_INFO::default();
        hsm_call!(
            self,
            format!("Failed reading the token info of slot {slot_id}"),
            C_GetTokenInfo,
            slot_id,
            &raw mut info
        );
        Ok(TokenInfo {
            label: padded_string(&info.label),
            manufacturer_id: padded_string(&info.manufacturerID),
            model: padded_string(&info.model),
            serial_number: padded_string(&info.serialNumber),
            flags: info.flags,
        })
    }

    fn open_session(&self, slot_id: CK_SLOT_ID, flags: CK_FLAGS) -> HResult<CK_SESSION_HANDLE> {
        let mut session: CK_SESSION_HANDLE = 0;
        hsm_call!(
            self,
            format!("Failed opening a session on slot {slot_id}"),
            C_OpenSession,
            slot_id,
            flags,
            ptr::null_mut(),
            None,
            &raw mut session
        );
        debug!("Opened session {session} on slot {slot_id}");
        Ok(session)
    }

    fn close_session(&self, session: CK_SESSION_HANDLE) -> HResult<()> {
        hsm_call!(
            self,
            format!("Failed closing session {session}"),
            C_CloseSession,
            session
        );
        Ok(())
    }

    fn login(
        &self,
        session: CK_SESSION_HANDLE,
        user_type: CK_USER_TYPE,
        pin: &[u8],
    ) -> HResult<()> {
        let mut pin = Zeroizing::new(pin.to_vec());
        let pin_len = CK_ULONG::try_from(pin.len())?;
        let rv = ffi_rv!(
            self,
            C_Login,
            session,
            user_type,
            pin.as_mut_ptr(),
            pin_len
        );
        match rv {
            CKR_OK => Ok(()),
            CKR_USER_ALREADY_LOGGED_IN => {
                warn!("user already logged in, ignoring logging");
                Ok(())
            }
            rv => Err(HError::pkcs11("Failed logging in", rv)),
        }
    }

    fn find_objects(
        &self,
        session: CK_SESSION_HANDLE,
        template: &[Attribute],
    ) -> HResult<Vec<CK_OBJECT_HANDLE>> {
        let mut ck_template = template
            .iter()
            .map(|attribute| {
                Ok(CK_ATTRIBUTE {
                    type_: attribute.type_,
                    pValue: attribute.value.as_ptr().cast_mut().cast::<c_void>(),
                    ulValueLen: CK_ULONG::try_from(attribute.value.len())?,
                })
            })
            .collect::<HResult<Vec<_>>>()?;
        hsm_call!(
            self,
            "Failed to initialize object search: C_FindObjectsInit failed",
            C_FindObjectsInit,
            session,
            ck_template.as_mut_ptr(),
            CK_ULONG::try_from(ck_template.len())?
        );

        let mut objects = Vec::new();
        let mut batch = [CK_OBJECT_HANDLE::default(); FIND_OBJECTS_BATCH];
        let search = (|| -> HResult<()> {
            loop {
                let mut count: CK_ULONG = 0;
                hsm_call!(
                    self,
                    "Failed to find objects",
                    C_FindObjects,
                    session,
                    batch.as_mut_ptr(),
                    CK_ULONG::try_from(FIND_OBJECTS_BATCH)?,
                    &raw mut count
                );
                let count = usize::try_from(count)?;
                if count == 0 {
                    return Ok(());
                }
                objects.extend_from_slice(batch.get(..count).ok_or_else(|| {
                    HError::Default("More objects returned than requested".to_owned())
                })?);
            }
        })();
        // the search must be finalized even when it failed, or the session stays busy
        let rv = ffi_rv!(self, C_FindObjectsFinal, session);
        search?;
        if rv != CKR_OK {
            return Err(HError::pkcs11("Failed to finalize object search", rv));
        }
        Ok(objects)
    }

    fn get_attribute_values(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        types: &[CK_ATTRIBUTE_TYPE],
    ) -> HResult<Vec<Option<Vec<u8>>>> {
        // first pass: lengths
        let mut template: Vec<CK_ATTRIBUTE> = types
            .iter()
            .map(|type_| CK_ATTRIBUTE {
                type_: *type_,
                pValue: ptr::null_mut(),
                ulValueLen: 0,
            })
            .collect();
        let rv = ffi_rv!(
            self,
            C_GetAttributeValue,
            session,
            object,
            template.as_mut_ptr(),
            CK_ULONG::try_from(template.len())?
        );
        if !matches!(
            rv,
            CKR_OK | CKR_ATTRIBUTE_SENSITIVE | CKR_ATTRIBUTE_TYPE_INVALID
        ) {
            return Err(HError::pkcs11(
                format!("Failed to get the attributes of object {object}"),
                rv,
            ));
        }
        let mut values = Vec::with_capacity(template.len());
        for attribute in &template {
            values.push(if attribute.ulValueLen == CK_UNAVAILABLE_INFORMATION {
                None
            } else {
                Some(vec![0_u8; usize::try_from(attribute.ulValueLen)?])
            });
        }

        // second pass: values, for the available attributes only
        let mut read_template = Vec::with_capacity(values.len());
        for (type_, value) in types.iter().zip(values.iter_mut()) {
            if let Some(value) = value {
                read_template.push(CK_ATTRIBUTE {
                    type_: *type_,
                    pValue: value.as_mut_ptr().cast::<c_void>(),
                    ulValueLen: CK_ULONG::try_from(value.len())?,
                });
            }
        }
        if read_template.is_empty() {
            return Ok(values);
        }
        hsm_call!(
            self,
            format!("Failed to get the attributes of object {object}"),
            C_GetAttributeValue,
            session,
            object,
            read_template.as_mut_ptr(),
            CK_ULONG::try_from(read_template.len())?
        );
        for (value, attribute) in values.iter_mut().flatten().zip(&read_template) {
            value.truncate(usize::try_from(attribute.ulValueLen)?);
        }
        Ok(values)
    }

    fn sign(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
        data: &[u8],
    ) -> HResult<Vec<u8>> {
        with_ck_mechanism(mechanism, |ck_mechanism| {
            hsm_call!(
                self,
                format!("Failed to initialize signature with key {key}"),
                C_SignInit,
                session,
                ck_mechanism,
                key
            );
            Ok(())
        })?;
        let data_len = CK_ULONG::try_from(data.len())?;
        let mut signature_len: CK_ULONG = 0;
        hsm_call!(
            self,
            "Failed to get the signature length",
            C_Sign,
            session,
            data.as_ptr().cast_mut(),
            data_len,
            ptr::null_mut(),
            &raw mut signature_len
        );
        let mut signature = vec![0_u8; usize::try_from(signature_len)?];
        hsm_call!(
            self,
            "Failed to sign",
            C_Sign,
            session,
            data.as_ptr().cast_mut(),
            data_len,
            signature.as_mut_ptr(),
            &raw mut signature_len
        );
        signature.truncate(usize::try_from(signature_len)?);
        Ok(signature)
    }

    fn decrypt(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
        ciphertext: &[u8],
    ) -> HResult<Zeroizing<Vec<u8>>> {
        with_ck_mechanism(mechanism, |ck_mechanism| {
            hsm_call!(
                self,
                format!("Failed to initialize decryption with key {key}"),
                C_DecryptInit,
                session,
                ck_mechanism,
                key
            );
            Ok(())
        })?;
        let ciphertext_len = CK_ULONG::try_from(ciphertext.len())?;
        let mut plaintext_len: CK_ULONG = 0;
        hsm_call!(
            self,
            "Failed to get the plaintext length",
            C_Decrypt,
            session,
            ciphertext.as_ptr().cast_mut(),
            ciphertext_len,
            ptr::null_mut(),
            &raw mut plaintext_len
        );
        let mut plaintext = Zeroizing::new(vec![0_u8; usize::try_from(plaintext_len)?]);
        hsm_call!(
            self,
            "Failed to decrypt",
            C_Decrypt,
            session,
            ciphertext.as_ptr().cast_mut(),
            ciphertext_len,
            plaintext.as_mut_ptr(),
            &raw mut plaintext_len
        );
        plaintext.truncate(usize::try_from(plaintext_len)?);
        Ok(plaintext)
    }

    fn generate_random(&self, session: CK_SESSION_HANDLE, len: usize) -> HResult<Vec<u8>> {
        let mut values = vec![0_u8; len];
        hsm_call!(
            self,
            "Failed generating random data",
            C_GenerateRandom,
            session,
            values.as_mut_ptr(),
            CK_ULONG::try_from(len)?
        );
        Ok(values)
    }
}

#[allow(non_snake_case)]
pub struct Info {
    pub cryptokiVersion: (u8, u8),
    pub manufacturerID: String,
    pub flags: CK_FLAGS,
    pub libraryDescription: String,
    pub libraryVersion: (u8, u8),
}

impl From<CK_INFO> for Info {
    fn from(info: CK_INFO) -> Self {
        Self {
            cryptokiVersion: (info.cryptokiVersion.major, info.cryptokiVersion.minor),
            manufacturerID: CStr::from_bytes_until_nul(&info.manufacturerID).map_or_else(
                |_| padded_string(&info.manufacturerID),
                |s| s.to_string_lossy().trim_end().to_owned(),
            ),
            flags: info.flags,
            libraryDescription: CStr::from_bytes_until_nul(&info.libraryDescription)
                .map_or_else(
                    |_| padded_string(&info.libraryDescription),
                    |s| s.to_string_lossy().trim_end().to_owned(),
                ),
            libraryVersion: (info.libraryVersion.major, info.libraryVersion.minor),
        }
    }
}

impl Display for Info {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cryptoki Version: {}.{}\nManufacturer ID: {}\nFlags: {}\nLibrary Description: \
             {}\nLibrary Version: {}.{}",
            self.cryptokiVersion.0,
            self.cryptokiVersion.1,
            self.manufacturerID,
            self.flags,
            self.libraryDescription,
            self.libraryVersion.0,
            self.libraryVersion.1
        )
    }
}
