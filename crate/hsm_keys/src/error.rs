//! Copyright 2024 Cosmian Tech SAS

use std::fmt::Display;

use pkcs11_sys::{CK_ATTRIBUTE_TYPE, CK_KEY_TYPE, CK_OBJECT_HANDLE, CK_RV, CK_SLOT_ID};
use thiserror::Error;

pub type HResult<T> = Result<T, HError>;

#[derive(Error, Debug)]
pub enum HError {
    #[error("{0}")]
    Default(String),

    #[error("PKCS#11 not yet configured")]
    NotConfigured,

    #[error("could not open PKCS#11 library {path}: {reason}")]
    CannotOpenModule { path: String, reason: String },

    #[error("could not find PKCS#11 token")]
    TokenNotFound,

    #[error("could not find PKCS#11 key")]
    KeyNotFound,

    #[error("cannot get random data from PKCS#11")]
    CannotGetRandomData,

    #[error("unrecognized key type: {0:#x}")]
    UnsupportedKeyType(CK_KEY_TYPE),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("no session pool for slot {0}")]
    SlotNotConfigured(CK_SLOT_ID),

    #[error("attribute {attribute:#x} is not available on object {object}")]
    AttributeUnavailable {
        attribute: CK_ATTRIBUTE_TYPE,
        object: CK_OBJECT_HANDLE,
    },

    #[error("{context}: PKCS#11 error {rv:#x}")]
    Pkcs11 { context: String, rv: CK_RV },

    #[error("Error loading the library: {0}")]
    LibLoading(#[from] libloading::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    TryFromInt(#[from] std::num::TryFromIntError),

    #[error(transparent)]
    TryFromSlice(#[from] std::array::TryFromSliceError),
}

impl HError {
    /// Build a module-level error from a failing return value
    pub fn pkcs11(context: impl Into<String>, rv: CK_RV) -> Self {
        Self::Pkcs11 {
            context: context.into(),
            rv,
        }
    }

    /// The PKCS#11 return value behind this error, if any
    #[must_use]
    pub const fn rv(&self) -> Option<CK_RV> {
        match self {
            Self::Pkcs11 { rv, .. } => Some(*rv),
            _ => None,
        }
    }
}

/// Helper methods to add context to a failing result.
pub trait HResultHelper<T> {
    /// Prefix the error with a context.
    ///
    /// # Errors
    ///
    /// Returns the original error, prefixed with the context.
    fn context(self, context: &str) -> HResult<T>;

    /// Prefix the error with a lazily built context.
    ///
    /// # Errors
    ///
    /// Returns the original error, prefixed with the context returned by the closure.
    fn with_context<D, O>(self, op: O) -> HResult<T>
    where
        D: Display,
        O: FnOnce() -> D;
}

impl<T> HResultHelper<T> for HResult<T> {
    fn context(self, context: &str) -> HResult<T> {
        self.with_context(|| context)
    }

    fn with_context<D, O>(self, op: O) -> HResult<T>
    where
        D: Display,
        O: FnOnce() -> D,
    {
        self.map_err(|e| match e {
            // keep the return code reachable for callers matching on it
            HError::Pkcs11 { context, rv } => HError::Pkcs11 {
                context: format!("{}: {context}", op()),
                rv,
            },
            other => HError::Default(format!("{}: {other}", op())),
        })
    }
}

impl<T> HResultHelper<T> for Option<T> {
    fn context(self, context: &str) -> HResult<T> {
        self.ok_or_else(|| HError::Default(context.to_owned()))
    }

    fn with_context<D, O>(self, op: O) -> HResult<T>
    where
        D: Display,
        O: FnOnce() -> D,
    {
        self.ok_or_else(|| HError::Default(op().to_string()))
    }
}

/// Construct an HSM error from a string.
#[macro_export]
macro_rules! hsm_error {
    ($msg:literal) => {
        $crate::HError::Default(::core::format_args!($msg).to_string())
    };
    ($err:expr $(,)?) => ({
        $crate::HError::Default($err.to_string())
    });
    ($fmt:expr, $($arg:tt)*) => {
        $crate::HError::Default(::core::format_args!($fmt, $($arg)*).to_string())
    };
}

/// Return early with an error.
#[macro_export]
macro_rules! hsm_bail {
    ($msg:literal) => {
        return ::core::result::Result::Err($crate::hsm_error!($msg))
    };
    ($err:expr $(,)?) => {
        return ::core::result::Result::Err($err)
    };
    ($fmt:expr, $($arg:tt)*) => {
        return ::core::result::Result::Err($crate::hsm_error!($fmt, $($arg)*))
    };
}

/// Return early with an error if a condition is not satisfied.
#[macro_export]
macro_rules! hsm_ensure {
    ($cond:expr, $msg:literal $(,)?) => {
        if !$cond {
            return ::core::result::Result::Err($crate::hsm_error!($msg));
        }
    };
    ($cond:expr, $err:expr $(,)?) => {
        if !$cond {
            return ::core::result::Result::Err($err);
        }
    };
    ($cond:expr, $fmt:expr, $($arg:tt)*) => {
        if !$cond {
            return ::core::result::Result::Err($crate::hsm_error!($fmt, $($arg)*));
        }
    };
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use pkcs11_sys::CKR_PIN_INCORRECT;

    use super::{HError, HResult, HResultHelper};

    #[test]
    fn test_hsm_error_interpolation() {
        let var = 42;
        let err = hsm_error!("interpolate {var}");
        assert_eq!("interpolate 42", err.to_string());

        match bail() {
            Err(e) => assert_eq!("interpolate 43", e.to_string()),
            Ok(()) => panic!("expected error"),
        }

        match ensure() {
            Err(e) => assert_eq!("interpolate 44", e.to_string()),
            Ok(()) => panic!("expected error"),
        }
    }

    #[test]
    fn test_context_keeps_return_value() {
        let res: HResult<()> = Err(HError::pkcs11("C_Login failed", CKR_PIN_INCORRECT));
        let err = res.context("login on slot 3").unwrap_err();
        assert_eq!(err.rv(), Some(CKR_PIN_INCORRECT));
        assert!(err.to_string().starts_with("login on slot 3: C_Login failed"));

        let res: HResult<()> = Err(HError::TokenNotFound);
        let err = res.context("resolving").unwrap_err();
        assert_eq!(err.rv(), None);
        assert_eq!(err.to_string(), "resolving: could not find PKCS#11 token");
    }

    fn bail() -> HResult<()> {
        let var = 43;
        if true {
            hsm_bail!("interpolate {var}");
        }
        Ok(())
    }

    fn ensure() -> HResult<()> {
        let var = 44;
        hsm_ensure!(false, "interpolate {var}");
        Ok(())
    }
}
