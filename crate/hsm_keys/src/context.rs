//! The module context and its one-time, process-wide configuration.
//!
//! [`Pkcs11Context`] owns the loaded module, the resolved default slot and
//! the session pools. It can be built directly, which is what tests and
//! PKCS#11-aware applications do, or through the process-wide
//! [`configure`] functions, which build it once and hand the same context to
//! every later caller.

use std::{
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    path::Path,
    sync::{Arc, RwLock},
};

use hsm_keys_logger::{debug, error, info};
use once_cell::sync::OnceCell;
use pkcs11_sys::{CK_FLAGS, CK_SLOT_ID, CKF_LOGIN_REQUIRED, CKU_USER};

use crate::{
    Cryptoki, HError, HResult, HResultHelper, HsmLib, Pkcs11Config, PooledSession, SessionPool,
    config::CONFIG_PATH_ENV, token::find_token,
};

/// An opened PKCS#11 module with the slot of the configured token.
pub struct Pkcs11Context {
    module: Arc<dyn Cryptoki>,
    module_path: String,
    default_slot: CK_SLOT_ID,
    token_flags: CK_FLAGS,
    max_sessions_per_slot: usize,
    pools: RwLock<HashMap<CK_SLOT_ID, Arc<SessionPool>>>,
}

impl Pkcs11Context {
    /// Load the library named in the configuration and set up the context.
    ///
    /// # Errors
    /// * the library cannot be loaded or initialized: `HError::CannotOpenModule`
    /// * any error of [`Pkcs11Context::new`]
    pub fn open(config: &Pkcs11Config) -> HResult<Self> {
        config.validate()?;
        let module = HsmLib::instantiate(&config.path).map_err(|e| {
            error!("Could not open PKCS#11 library {}: {e}", config.path);
            HError::CannotOpenModule {
                path: config.path.clone(),
                reason: e.to_string(),
            }
        })?;
        match module.get_info() {
            Ok(info) => debug!("Loaded PKCS#11 library {}:\n{info}", config.path),
            Err(e) => debug!("No library information for {}: {e}", config.path),
        }
        Self::new(Arc::new(module), config)
    }

    /// Set up the context on an initialized module.
    ///
    /// The slot holding the configured token is resolved and becomes the
    /// default slot, its session pool is created, and if the token requires
    /// it, the user logs in with the configured PIN using a pooled session.
    ///
    /// # Errors
    /// * the configuration is invalid
    /// * the slots cannot be listed
    /// * no slot holds the token: `HError::TokenNotFound`
    /// * the login fails
    pub fn new(module: Arc<dyn Cryptoki>, config: &Pkcs11Config) -> HResult<Self> {
        config.validate()?;
        let slots = module
            .get_slot_list(true)
            .inspect_err(|e| error!("Failed to list PKCS#11 slots: {e}"))?;
        debug!("Slots with a token: {slots:?}");
        let (default_slot, token_flags) = find_token(
            module.as_ref(),
            &slots,
            config.token_serial.as_deref(),
            config.token_label.as_deref(),
        )
        .inspect_err(|e| error!("Failed to find the token in any slot: {e}"))?;

        let context = Self {
            module,
            module_path: config.path.clone(),
            default_slot,
            token_flags,
            max_sessions_per_slot: config.max_sessions_per_slot,
            pools: RwLock::new(HashMap::new()),
        };
        context.setup_sessions(default_slot, config.max_sessions_per_slot)?;

        if context.login_required() {
            context
                .with_session(default_slot, |session| {
                    session.login(CKU_USER, config.pin.as_bytes())
                })
                .with_context(|| format!("Failed to log into the token of slot {default_slot}"))
                .inspect_err(|e| error!("{e}"))?;
            debug!("Logged into the token of slot {default_slot}");
        }
        info!(
            "PKCS#11 library {} configured on slot {default_slot}",
            context.module_path
        );
        Ok(context)
    }

    /// Create the session pool of a slot, if it does not exist yet.
    ///
    /// # Errors
    /// `max_sessions` is zero
    pub fn setup_sessions(
        &self,
        slot_id: CK_SLOT_ID,
        max_sessions: usize,
    ) -> HResult<Arc<SessionPool>> {
        let mut pools = self
            .pools
            .write()
            .map_err(|_| HError::Default("Failed to acquire lock on session pools".to_owned()))?;
        if let Some(pool) = pools.get(&slot_id) {
            return Ok(pool.clone());
        }
        let pool = Arc::new(SessionPool::new(
            self.module.clone(),
            slot_id,
            max_sessions,
        )?);
        pools.insert(slot_id, pool.clone());
        Ok(pool)
    }

    /// The session pool of a slot
    ///
    /// # Errors
    /// No pool was set up for this slot: `HError::SlotNotConfigured`
    pub fn session_pool(&self, slot_id: CK_SLOT_ID) -> HResult<Arc<SessionPool>> {
        self.pools
            .read()
            .map_err(|_| HError::Default("Failed to acquire lock on session pools".to_owned()))?
            .get(&slot_id)
            .cloned()
            .ok_or(HError::SlotNotConfigured(slot_id))
    }

    /// Run `operation` with exclusive use of a session of `slot_id`.
    ///
    /// # Errors
    /// * the slot has no pool
    /// * no session could be opened
    /// * `operation` failed
    pub fn with_session<T, E, F>(&self, slot_id: CK_SLOT_ID, operation: F) -> Result<T, E>
    where
        F: FnOnce(&PooledSession<'_>) -> Result<T, E>,
        E: From<HError>,
    {
        self.session_pool(slot_id)?.with_session(operation)
    }

    /// Run `operation` with a session of the default slot
    ///
    /// # Errors
    /// See [`Pkcs11Context::with_session`]
    pub fn with_default_session<T, E, F>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce(&PooledSession<'_>) -> Result<T, E>,
        E: From<HError>,
    {
        self.with_session(self.default_slot, operation)
    }

    #[must_use]
    pub fn module(&self) -> &Arc<dyn Cryptoki> {
        &self.module
    }

    #[must_use]
    pub fn module_path(&self) -> &str {
        &self.module_path
    }

    #[must_use]
    pub const fn default_slot(&self) -> CK_SLOT_ID {
        self.default_slot
    }

    #[must_use]
    pub const fn token_flags(&self) -> CK_FLAGS {
        self.token_flags
    }

    #[must_use]
    pub const fn login_required(&self) -> bool {
        self.token_flags & CKF_LOGIN_REQUIRED != 0
    }

    #[must_use]
    pub const fn max_sessions_per_slot(&self) -> usize {
        self.max_sessions_per_slot
    }
}

impl Debug for Pkcs11Context {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pkcs11Context")
            .field("module_path", &self.module_path)
            .field("default_slot", &self.default_slot)
            .field("token_flags", &self.token_flags)
            .field("max_sessions_per_slot", &self.max_sessions_per_slot)
            .finish_non_exhaustive()
    }
}

/// Holds the context once it has been successfully configured.
///
/// The first successful configuration wins: later calls return the same
/// context and ignore the configuration they are given. A failed
/// configuration leaves the cell empty.
#[derive(Default)]
pub struct ContextCell(OnceCell<Arc<Pkcs11Context>>);

impl ContextCell {
    #[must_use]
    pub const fn new() -> Self {
        Self(OnceCell::new())
    }

    /// Configure from a `Pkcs11Config`, loading the library it names.
    ///
    /// With no configuration, the existing context is returned.
    ///
    /// # Errors
    /// * no configuration is given and none succeeded before: `HError::NotConfigured`
    /// * the context cannot be opened, see [`Pkcs11Context::open`]
    pub fn configure(&self, config: Option<&Pkcs11Config>) -> HResult<Arc<Pkcs11Context>> {
        self.configure_with(config, Pkcs11Context::open)
    }

    /// Configure using `open` to build the context on the first call
    ///
    /// # Errors
    /// See [`ContextCell::configure`]
    pub fn configure_with<F>(
        &self,
        config: Option<&Pkcs11Config>,
        open: F,
    ) -> HResult<Arc<Pkcs11Context>>
    where
        F: FnOnce(&Pkcs11Config) -> HResult<Pkcs11Context>,
    {
        let Some(config) = config else {
            return self.get();
        };
        self.0
            .get_or_try_init(|| open(config).map(Arc::new))
            .cloned()
    }

    /// Configure from a JSON file, see [`Pkcs11Config::from_file`]
    ///
    /// # Errors
    /// The file cannot be read or the configuration fails
    pub fn configure_from_file(&self, path: impl AsRef<Path>) -> HResult<Arc<Pkcs11Context>> {
        let config = Pkcs11Config::from_file(path).inspect_err(|e| error!("{e}"))?;
        self.configure(Some(&config))
    }

    /// Configure from the file named by the `HSM_KEYS_CONFIG_PATH` environment variable.
    ///
    /// Returns `None` when the variable is not set. A hosting process
    /// typically calls this at startup and treats an error as fatal.
    ///
    /// # Errors
    /// The file cannot be read or the configuration fails
    pub fn configure_from_env(&self) -> HResult<Option<Arc<Pkcs11Context>>> {
        match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => {
                info!("Configuring PKCS#11 from {CONFIG_PATH_ENV}={}", path.to_string_lossy());
                self.configure_from_file(path).map(Some)
            }
            None => Ok(None),
        }
    }

    /// The configured context
    ///
    /// # Errors
    /// Nothing was configured yet: `HError::NotConfigured`
    pub fn get(&self) -> HResult<Arc<Pkcs11Context>> {
        self.0.get().cloned().ok_or(HError::NotConfigured)
    }
}

static CONTEXT: ContextCell = ContextCell::new();

/// Configure the process-wide context.
///
/// The context is returned, allowing a PKCS#11-aware application to use it
/// directly. If the process was already configured, the existing context is
/// returned and `config` is ignored: the library is never reconfigured.
///
/// # Errors
/// See [`ContextCell::configure`]
pub fn configure(config: Option<&Pkcs11Config>) -> HResult<Arc<Pkcs11Context>> {
    CONTEXT.configure(config)
}

/// Configure the process-wide context from a JSON file
///
/// # Errors
/// See [`ContextCell::configure_from_file`]
pub fn configure_from_file(path: impl AsRef<Path>) -> HResult<Arc<Pkcs11Context>> {
    CONTEXT.configure_from_file(path)
}

/// Configure the process-wide context from `HSM_KEYS_CONFIG_PATH`, if set
///
/// # Errors
/// See [`ContextCell::configure_from_env`]
pub fn configure_from_env() -> HResult<Option<Arc<Pkcs11Context>>> {
    CONTEXT.configure_from_env()
}

/// The process-wide context
///
/// # Errors
/// Nothing was configured yet: `HError::NotConfigured`
pub fn context() -> HResult<Arc<Pkcs11Context>> {
    CONTEXT.get()
}
