use std::{
    fmt::{self, Debug, Formatter},
    fs::File,
    io::BufReader,
    path::Path,
};

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::{HError, HResult, HResultHelper};

/// Environment variable naming a configuration file applied at startup
pub const CONFIG_PATH_ENV: &str = "HSM_KEYS_CONFIG_PATH";

/// Ceiling applied when the configuration does not set one
pub const DEFAULT_MAX_SESSIONS_PER_SLOT: usize = 1024;

const fn default_max_sessions_per_slot() -> usize {
    DEFAULT_MAX_SESSIONS_PER_SLOT
}

/// The PKCS#11 library and token to use.
///
/// A token may be identified either by serial number or by label. If both
/// are specified, a token matching the serial number is preferred.
///
/// The JSON representation looks like:
///
/// ```json
/// {
///     "Path": "/usr/lib/softhsm/libsofthsm2.so",
///     "TokenLabel": "my-token",
///     "Pin": "1234",
///     "MaxSessionsPerSlot": 16
/// }
/// ```
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Pkcs11Config {
    /// Full path to the PKCS#11 library
    pub path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_serial: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_label: Option<String>,

    /// User PIN, used when the token requires a login
    #[serde(default)]
    pub pin: Zeroizing<String>,

    /// Maximum number of sessions opened on a slot
    #[serde(
        default = "default_max_sessions_per_slot",
        alias = "MaxTokenSession"
    )]
    pub max_sessions_per_slot: usize,
}

impl Pkcs11Config {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            token_serial: None,
            token_label: None,
            pin: Zeroizing::new(String::new()),
            max_sessions_per_slot: DEFAULT_MAX_SESSIONS_PER_SLOT,
        }
    }

    #[must_use]
    pub fn with_token_serial(mut self, serial: impl Into<String>) -> Self {
        self.token_serial = Some(serial.into());
        self
    }

    #[must_use]
    pub fn with_token_label(mut self, label: impl Into<String>) -> Self {
        self.token_label = Some(label.into());
        self
    }

    #[must_use]
    pub fn with_pin(mut self, pin: impl Into<String>) -> Self {
        self.pin = Zeroizing::new(pin.into());
        self
    }

    #[must_use]
    pub const fn with_max_sessions_per_slot(mut self, max_sessions: usize) -> Self {
        self.max_sessions_per_slot = max_sessions;
        self
    }

    /// Read a JSON configuration file
    ///
    /// # Errors
    /// The file cannot be read or is not a valid configuration
    pub fn from_file(path: impl AsRef<Path>) -> HResult<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(HError::from)
            .with_context(|| format!("could not open config file {}", path.display()))?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(HError::from)
            .with_context(|| format!("could not decode config file {}", path.display()))
    }

    /// # Errors
    /// The library path is empty or the session ceiling is zero
    pub fn validate(&self) -> HResult<()> {
        if self.path.trim().is_empty() {
            return Err(HError::InvalidConfiguration(
                "the PKCS#11 library path is empty".to_owned(),
            ));
        }
        if self.max_sessions_per_slot == 0 {
            return Err(HError::InvalidConfiguration(
                "the maximum number of sessions per slot must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}

impl Debug for Pkcs11Config {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pkcs11Config")
            .field("path", &self.path)
            .field("token_serial", &self.token_serial)
            .field("token_label", &self.token_label)
            .field("pin", &"****")
            .field("max_sessions_per_slot", &self.max_sessions_per_slot)
            .finish()
    }
}
