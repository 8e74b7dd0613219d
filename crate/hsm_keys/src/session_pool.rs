//! Per-slot pools of exclusive PKCS#11 sessions.
//!
//! A PKCS#11 session must not be used by two threads at the same time, and
//! runs a single operation (search, signature, decryption...) at a time.
//! Callers of the signing and decryption APIs know nothing of this, so each
//! operation borrows a read-write session from the pool of the slot holding
//! the key, with exclusive use of it until the operation completes.
//!
//! The pool opens sessions lazily, up to `max_sessions`. Once that ceiling is
//! reached, callers wait for a session to be released: exhaustion delays, it
//! never fails. Sessions are never closed while the pool is alive.

use std::{
    fmt::{self, Debug, Formatter},
    mem,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
};

use pkcs11_sys::{
    CK_ATTRIBUTE_TYPE, CK_OBJECT_HANDLE, CK_SESSION_HANDLE, CK_SLOT_ID, CK_USER_TYPE,
    CKF_RW_SESSION, CKF_SERIAL_SESSION,
};
use zeroize::Zeroizing;

use crate::{Attribute, Cryptoki, HError, HResult, Mechanism};

/// Mutable state of a pool, protected by its mutex
#[derive(Default)]
struct PoolState {
    /// Sessions opened and not currently borrowed
    idle: Vec<CK_SESSION_HANDLE>,
    /// Sessions opened, or being opened, by this pool
    opened: usize,
}

/// A snapshot of the pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub opened: usize,
    pub idle: usize,
    pub in_use: usize,
    pub max_sessions: usize,
}

/// The pool of read-write sessions of one slot
pub struct SessionPool {
    module: Arc<dyn Cryptoki>,
    slot_id: CK_SLOT_ID,
    max_sessions: usize,
    state: Mutex<PoolState>,
    released: Condvar,
}

impl SessionPool {
    /// Create an empty pool for `slot_id`; no session is opened yet.
    ///
    /// # Errors
    /// `max_sessions` is zero
    pub fn new(
        module: Arc<dyn Cryptoki>,
        slot_id: CK_SLOT_ID,
        max_sessions: usize,
    ) -> HResult<Self> {
        if max_sessions == 0 {
            return Err(HError::InvalidConfiguration(format!(
                "the maximum number of sessions of slot {slot_id} must be at least 1"
            )));
        }
        Ok(Self {
            module,
            slot_id,
            max_sessions,
            state: Mutex::new(PoolState::default()),
            released: Condvar::new(),
        })
    }

    #[must_use]
    pub const fn slot_id(&self) -> CK_SLOT_ID {
        self.slot_id
    }

    #[must_use]
    pub const fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    fn lock_state(&self) -> HResult<MutexGuard<'_, PoolState>> {
        self.state.lock().map_err(|e| {
            HError::Default(format!(
                "Failed to acquire lock on the session pool of slot {}: {e}",
                self.slot_id
            ))
        })
    }

    /// Borrow a session for exclusive use.
    ///
    /// An idle session is reused when there is one; otherwise a new session
    /// is opened if the ceiling is not reached; otherwise this blocks until
    /// another caller releases its session. The session returns to the pool
    /// when the returned guard is dropped.
    ///
    /// # Errors
    /// Opening a new session failed. The failed attempt does not count
    /// towards the ceiling.
    pub fn acquire(&self) -> HResult<PooledSession<'_>> {
        let mut state = self.lock_state()?;
        loop {
            if let Some(handle) = state.idle.pop() {
                return Ok(PooledSession { pool: self, handle });
            }
            if state.opened < self.max_sessions {
                // reserve the capacity, then open outside the lock
                state.opened += 1;
                drop(state);
                return self.open_reserved();
            }
            state = self.released.wait(state).map_err(|e| {
                HError::Default(format!(
                    "Failed waiting for a session of slot {}: {e}",
                    self.slot_id
                ))
            })?;
        }
    }

    fn open_reserved(&self) -> HResult<PooledSession<'_>> {
        let reservation = Reservation { pool: self };
        let handle = self
            .module
            .open_session(self.slot_id, CKF_RW_SESSION | CKF_SERIAL_SESSION)?;
        reservation.fulfill();
        Ok(PooledSession { pool: self, handle })
    }

    /// Give back capacity reserved for a session that was never opened
    fn cancel_reservation(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.opened -= 1;
        drop(state);
        // the freed capacity may unblock a waiter
        self.released.notify_one();
    }

    fn release(&self, handle: CK_SESSION_HANDLE) {
        // no caller code ever runs under this lock, the state is consistent
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.idle.push(handle);
        drop(state);
        self.released.notify_one();
    }

    /// Run `operation` with exclusive use of a session of this pool.
    ///
    /// The session is released once `operation` returns, whatever its
    /// outcome, including when it panics.
    ///
    /// # Errors
    /// No session could be opened, or `operation` failed.
    pub fn with_session<T, E, F>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce(&PooledSession<'_>) -> Result<T, E>,
        E: From<HError>,
    {
        let session = self.acquire()?;
        operation(&session)
    }

    /// # Errors
    /// The pool lock is poisoned
    pub fn stats(&self) -> HResult<PoolStats> {
        let state = self.lock_state()?;
        Ok(PoolStats {
            opened: state.opened,
            idle: state.idle.len(),
            in_use: state.opened - state.idle.len(),
            max_sessions: self.max_sessions,
        })
    }
}

impl Debug for SessionPool {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionPool")
            .field("slot_id", &self.slot_id)
            .field("max_sessions", &self.max_sessions)
            .field("stats", &self.stats().ok())
            .finish_non_exhaustive()
    }
}

impl Drop for SessionPool {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for handle in state.idle.drain(..) {
            drop(self.module.close_session(handle));
        }
    }
}

/// Capacity reserved in a pool while a session is being opened.
///
/// Dropped without being fulfilled, whether the open failed or panicked, it
/// returns the capacity to the pool.
struct Reservation<'a> {
    pool: &'a SessionPool,
}

impl Reservation<'_> {
    fn fulfill(self) {
        mem::forget(self);
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.pool.cancel_reservation();
    }
}

/// A session borrowed from a [`SessionPool`].
///
/// Only one `PooledSession` exists for a given handle at any time. The
/// handle must not be kept beyond the life of this guard.
pub struct PooledSession<'a> {
    pool: &'a SessionPool,
    handle: CK_SESSION_HANDLE,
}

impl PooledSession<'_> {
    #[must_use]
    pub const fn handle(&self) -> CK_SESSION_HANDLE {
        self.handle
    }

    #[must_use]
    pub const fn slot_id(&self) -> CK_SLOT_ID {
        self.pool.slot_id
    }

    #[must_use]
    pub fn module(&self) -> &dyn Cryptoki {
        self.pool.module.as_ref()
    }

    pub fn login(&self, user_type: CK_USER_TYPE, pin: &[u8]) -> HResult<()> {
        self.module().login(self.handle, user_type, pin)
    }

    pub fn find_objects(&self, template: &[Attribute]) -> HResult<Vec<CK_OBJECT_HANDLE>> {
        self.module().find_objects(self.handle, template)
    }

    pub fn get_attribute_values(
        &self,
        object: CK_OBJECT_HANDLE,
        types: &[CK_ATTRIBUTE_TYPE],
    ) -> HResult<Vec<Option<Vec<u8>>>> {
        self.module()
            .get_attribute_values(self.handle, object, types)
    }

    pub fn sign(
        &self,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
        data: &[u8],
    ) -> HResult<Vec<u8>> {
        self.module().sign(self.handle, mechanism, key, data)
    }

    pub fn decrypt(
        &self,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
        ciphertext: &[u8],
    ) -> HResult<Zeroizing<Vec<u8>>> {
        self.module()
            .decrypt(self.handle, mechanism, key, ciphertext)
    }

    pub fn generate_random(&self, len: usize) -> HResult<Vec<u8>> {
        self.module().generate_random(self.handle, len)
    }
}

impl Drop for PooledSession<'_> {
    fn drop(&mut self) {
        self.pool.release(self.handle);
    }
}
