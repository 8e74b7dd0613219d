use std::{
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Barrier, mpsc},
    thread,
    time::{Duration, Instant},
};

use hsm_keys_logger::{info, log_init};
use pkcs11_sys::{
    CK_OBJECT_HANDLE, CK_SESSION_HANDLE, CK_SLOT_ID, CKO_PRIVATE_KEY, CKR_SESSION_COUNT,
};

use super::mock_module::MockModule;
use crate::{Attribute, HError, HResult, Mechanism, PoolStats, SessionPool};

const SLOT: CK_SLOT_ID = 0;

fn pool_with_key(
    max_sessions: usize,
    sign_delay: Duration,
) -> HResult<(Arc<MockModule>, Arc<SessionPool>, CK_OBJECT_HANDLE)> {
    let mut module = MockModule::with_test_token().with_sign_delay(sign_delay);
    let (private_key, _) = module.add_rsa_key_pair(SLOT, b"k1", "key");
    let module = Arc::new(module);
    let pool = Arc::new(SessionPool::new(module.clone(), SLOT, max_sessions)?);
    Ok((module, pool, private_key))
}

#[test]
fn test_zero_ceiling_is_rejected() {
    let module = Arc::new(MockModule::with_test_token());
    assert!(matches!(
        SessionPool::new(module, SLOT, 0),
        Err(HError::InvalidConfiguration(_))
    ));
}

#[test]
fn test_idle_sessions_are_reused() -> HResult<()> {
    let (module, pool, _) = pool_with_key(4, Duration::ZERO)?;
    let first = pool.with_session(|session| Ok::<_, HError>(session.handle()))?;
    let second = pool.with_session(|session| Ok::<_, HError>(session.handle()))?;
    assert_eq!(first, second);
    assert_eq!(module.opened(SLOT), 1);
    assert_eq!(pool.stats()?, PoolStats {
        opened: 1,
        idle: 1,
        in_use: 0,
        max_sessions: 4,
    });
    Ok(())
}

#[test]
fn test_sessions_are_bounded_and_exclusive() -> HResult<()> {
    log_init(None);
    const MAX_SESSIONS: usize = 3;
    const THREADS: usize = 12;

    let (module, pool, key) = pool_with_key(MAX_SESSIONS, Duration::from_millis(20))?;
    let barrier = Arc::new(Barrier::new(THREADS));
    let handles = (0..THREADS)
        .map(|i| {
            let pool = pool.clone();
            let barrier = barrier.clone();
            thread::spawn(move || -> HResult<Vec<u8>> {
                barrier.wait();
                let data = format!("message {i}");
                pool.with_session(|session| session.sign(&Mechanism::RsaPkcs, key, data.as_bytes()))
            })
        })
        .collect::<Vec<_>>();
    for (i, handle) in handles.into_iter().enumerate() {
        let signature = handle
            .join()
            .map_err(|_| HError::Default("thread panicked".to_owned()))??;
        assert_eq!(signature, format!("signed:message {i}").into_bytes());
    }

    info!(
        "opened {} sessions, {} signing at the same time",
        module.opened(SLOT),
        module.max_concurrent()
    );
    assert!(module.opened(SLOT) <= MAX_SESSIONS);
    assert!(module.max_concurrent() <= MAX_SESSIONS);
    assert!(!module.overlap_detected());
    let stats = pool.stats()?;
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.opened, stats.idle);
    assert!(stats.opened <= MAX_SESSIONS);
    Ok(())
}

#[test]
fn test_exhausted_pool_waits_for_release() -> HResult<()> {
    let (module, pool, _) = pool_with_key(1, Duration::ZERO)?;
    let (acquired_tx, acquired_rx) = mpsc::channel();

    let holder = {
        let pool = pool.clone();
        thread::spawn(move || -> HResult<CK_SESSION_HANDLE> {
            pool.with_session(|session| {
                acquired_tx
                    .send(())
                    .map_err(|e| HError::Default(e.to_string()))?;
                thread::sleep(Duration::from_millis(200));
                Ok(session.handle())
            })
        })
    };

    acquired_rx
        .recv()
        .map_err(|e| HError::Default(e.to_string()))?;
    let start = Instant::now();
    let waiter_handle = pool.with_session(|session| Ok::<_, HError>(session.handle()))?;
    assert!(start.elapsed() >= Duration::from_millis(100));

    let holder_handle = holder
        .join()
        .map_err(|_| HError::Default("thread panicked".to_owned()))??;
    assert_eq!(holder_handle, waiter_handle);
    assert_eq!(module.opened(SLOT), 1);
    Ok(())
}

#[test]
fn test_session_released_on_error() -> HResult<()> {
    let (module, pool, _) = pool_with_key(2, Duration::ZERO)?;
    let result: HResult<()> = pool.with_session(|session| {
        session.find_objects(&[Attribute::class(CKO_PRIVATE_KEY)])?;
        Err(HError::Default("operation failed".to_owned()))
    });
    assert!(result.is_err());
    let stats = pool.stats()?;
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.idle, 1);

    // the released session serves the next caller, no new one is opened
    let found = pool.with_session(|session| {
        session.find_objects(&[Attribute::class(CKO_PRIVATE_KEY)])
    })?;
    assert_eq!(found.len(), 1);
    assert_eq!(module.opened(SLOT), 1);
    Ok(())
}

#[test]
fn test_session_released_on_panic() -> HResult<()> {
    let (_module, pool, _) = pool_with_key(1, Duration::ZERO)?;
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        pool.with_session(|_session| -> HResult<()> { panic!("operation panicked") })
    }));
    assert!(result.is_err());
    assert_eq!(pool.stats()?.in_use, 0);
    // the only session is available again
    pool.with_session(|_session| Ok::<_, HError>(()))?;
    Ok(())
}

#[test]
fn test_failed_open_is_not_counted() -> HResult<()> {
    let (module, pool, _) = pool_with_key(1, Duration::ZERO)?;
    module.fail_next_opens(1);
    let err = pool.acquire().err().expect("opening a session should fail");
    assert_eq!(err.rv(), Some(CKR_SESSION_COUNT));
    assert_eq!(pool.stats()?.opened, 0);

    // the ceiling of 1 is still fully available
    let session = pool.acquire()?;
    assert_eq!(session.slot_id(), SLOT);
    assert_eq!(module.opened(SLOT), 1);
    Ok(())
}

#[test]
fn test_panicking_open_is_not_counted() -> HResult<()> {
    let (module, pool, _) = pool_with_key(1, Duration::ZERO)?;
    module.panic_next_opens(1);
    let result = panic::catch_unwind(AssertUnwindSafe(|| pool.acquire().map(|_| ())));
    assert!(result.is_err());
    assert_eq!(pool.stats()?, PoolStats {
        opened: 0,
        idle: 0,
        in_use: 0,
        max_sessions: 1,
    });

    // a waiter is not left behind by the lost session
    let (sender, receiver) = mpsc::channel();
    let waiter = {
        let pool = pool.clone();
        thread::spawn(move || {
            let handle = pool.with_session(|session| Ok::<_, HError>(session.handle()));
            drop(sender.send(()));
            handle
        })
    };
    receiver
        .recv_timeout(Duration::from_secs(5))
        .map_err(|e| HError::Default(format!("the pool is still exhausted: {e}")))?;
    waiter
        .join()
        .map_err(|_| HError::Default("thread panicked".to_owned()))??;
    assert_eq!(module.opened(SLOT), 1);
    Ok(())
}

#[test]
fn test_dropping_the_pool_closes_idle_sessions() -> HResult<()> {
    let (module, pool, _) = pool_with_key(2, Duration::ZERO)?;
    {
        let _first = pool.acquire()?;
        let _second = pool.acquire()?;
        assert_eq!(pool.stats()?.in_use, 2);
    }
    assert_eq!(module.closed(), 0);
    drop(pool);
    assert_eq!(module.closed(), 2);
    Ok(())
}
