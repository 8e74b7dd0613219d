use std::{
    io::Write,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

use pkcs11_sys::{CKF_LOGIN_REQUIRED, CKR_PIN_INCORRECT};
use serial_test::serial;
use tempfile::NamedTempFile;

use super::{
    MOCK_LIBRARY, mock_context,
    mock_module::{MockModule, TEST_PIN},
    test_config,
};
use crate::{
    CONFIG_PATH_ENV, ContextCell, HError, HResult, Pkcs11Config, Pkcs11Context, configure,
    context,
};

#[test]
fn test_bootstrap_logs_in_once() -> HResult<()> {
    let module = Arc::new(MockModule::with_test_token());
    let ctx = mock_context(&module, 2)?;

    assert_eq!(ctx.default_slot(), 0);
    assert!(ctx.login_required());
    assert_eq!(ctx.module_path(), MOCK_LIBRARY);
    assert_eq!(module.logins(), vec![b"1234".to_vec()]);
    assert!(module.total_opened() <= 2);

    let pool = ctx.session_pool(ctx.default_slot())?;
    assert_eq!(pool.max_sessions(), 2);
    // the login session went back to the pool
    assert_eq!(pool.stats()?.idle, 1);

    let slot = ctx.with_default_session(|session| Ok::<_, HError>(session.slot_id()))?;
    assert_eq!(slot, 0);
    assert_eq!(module.logins().len(), 1);
    Ok(())
}

#[test]
fn test_no_login_without_login_required() -> HResult<()> {
    let module = Arc::new(MockModule::new().with_token(3, "TEST", "42", 0));
    let ctx = mock_context(&module, 4)?;
    assert_eq!(ctx.default_slot(), 3);
    assert!(!ctx.login_required());
    assert!(module.logins().is_empty());
    assert_eq!(module.total_opened(), 0);
    Ok(())
}

#[test]
fn test_missing_token() {
    let module = Arc::new(MockModule::with_test_token());
    let by_serial = Pkcs11Config::new(MOCK_LIBRARY)
        .with_token_serial("does-not-exist")
        .with_pin(TEST_PIN);
    let result = Pkcs11Context::new(module.clone(), &by_serial);
    assert!(matches!(result, Err(HError::TokenNotFound)));

    let by_label = test_config(2).with_token_label("does-not-exist");
    let result = Pkcs11Context::new(module.clone(), &by_label);
    assert!(matches!(result, Err(HError::TokenNotFound)));
    assert_eq!(module.total_opened(), 0);
}

#[test]
fn test_wrong_pin() {
    let module = Arc::new(MockModule::with_test_token());
    let config = test_config(2).with_pin("0000");
    let err = Pkcs11Context::new(module.clone(), &config).unwrap_err();
    assert_eq!(err.rv(), Some(CKR_PIN_INCORRECT));
    // the pool was dropped with the context, closing its session
    assert_eq!(module.closed(), module.total_opened());
}

#[test]
fn test_invalid_ceiling() {
    let module = Arc::new(MockModule::with_test_token());
    assert!(matches!(
        mock_context(&module, 0),
        Err(HError::InvalidConfiguration(_))
    ));
}

#[test]
fn test_other_slots() -> HResult<()> {
    let module = Arc::new(
        MockModule::with_test_token().with_token(7, "SECOND", "7", CKF_LOGIN_REQUIRED),
    );
    let ctx = mock_context(&module, 2)?;

    assert!(matches!(
        ctx.with_session(7, |_session| Ok::<_, HError>(())),
        Err(HError::SlotNotConfigured(7))
    ));

    let pool = ctx.setup_sessions(7, 1)?;
    assert!(Arc::ptr_eq(&pool, &ctx.setup_sessions(7, 5)?));
    assert_eq!(pool.max_sessions(), 1);
    let slot = ctx.with_session(7, |session| Ok::<_, HError>(session.slot_id()))?;
    assert_eq!(slot, 7);
    assert_eq!(module.opened(7), 1);
    Ok(())
}

#[test]
fn test_first_configuration_wins() -> HResult<()> {
    let module = Arc::new(MockModule::with_test_token());
    let cell = ContextCell::new();
    let opens = AtomicUsize::new(0);
    let open = |config: &Pkcs11Config| {
        opens.fetch_add(1, Ordering::SeqCst);
        Pkcs11Context::new(module.clone(), config)
    };

    assert!(matches!(cell.get(), Err(HError::NotConfigured)));
    assert!(matches!(cell.configure(None), Err(HError::NotConfigured)));

    let first = cell.configure_with(Some(&test_config(2)), open)?;
    let other = Pkcs11Config::new("/usr/lib/other/libpkcs11.so").with_token_label("TEST");
    let second = cell.configure_with(Some(&other), open)?;
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(second.module_path(), MOCK_LIBRARY);
    assert_eq!(opens.load(Ordering::SeqCst), 1);

    assert!(Arc::ptr_eq(&first, &cell.configure(None)?));
    assert!(Arc::ptr_eq(&first, &cell.get()?));
    Ok(())
}

#[test]
fn test_failed_configuration_can_be_retried() -> HResult<()> {
    let module = Arc::new(MockModule::with_test_token());
    let cell = ContextCell::new();
    let open = |config: &Pkcs11Config| Pkcs11Context::new(module.clone(), config);

    let bad_pin = test_config(2).with_pin("0000");
    assert!(cell.configure_with(Some(&bad_pin), open).is_err());
    assert!(matches!(cell.get(), Err(HError::NotConfigured)));

    let ctx = cell.configure_with(Some(&test_config(2)), open)?;
    assert_eq!(ctx.default_slot(), 0);
    Ok(())
}

#[test]
fn test_concurrent_configuration() -> HResult<()> {
    let module = Arc::new(MockModule::with_test_token());
    let cell = Arc::new(ContextCell::new());
    let handles = (0..8)
        .map(|_| {
            let cell = cell.clone();
            let module = module.clone();
            thread::spawn(move || {
                cell.configure_with(Some(&test_config(2)), |config| {
                    Pkcs11Context::new(module, config)
                })
            })
        })
        .collect::<Vec<_>>();
    let contexts = handles
        .into_iter()
        .map(|handle| {
            handle
                .join()
                .map_err(|_| HError::Default("thread panicked".to_owned()))?
        })
        .collect::<HResult<Vec<_>>>()?;
    for ctx in &contexts {
        assert!(Arc::ptr_eq(ctx, &contexts[0]));
    }
    assert_eq!(module.logins().len(), 1);
    Ok(())
}

#[test]
#[serial]
fn test_process_context_not_configured() {
    assert!(matches!(context(), Err(HError::NotConfigured)));
    assert!(matches!(configure(None), Err(HError::NotConfigured)));

    let config = Pkcs11Config::new("/nonexistent/libpkcs11.so").with_token_label("TEST");
    assert!(matches!(
        configure(Some(&config)),
        Err(HError::CannotOpenModule { .. })
    ));
    assert!(matches!(context(), Err(HError::NotConfigured)));
}

#[test]
#[serial]
#[allow(unsafe_code)]
fn test_configure_from_env() -> HResult<()> {
    let cell = ContextCell::new();
    unsafe {
        std::env::remove_var(CONFIG_PATH_ENV);
    }
    assert!(cell.configure_from_env()?.is_none());

    let mut file = NamedTempFile::new()?;
    file.write_all(br#"{"Path": "/nonexistent/libpkcs11.so", "TokenLabel": "TEST"}"#)?;
    unsafe {
        std::env::set_var(CONFIG_PATH_ENV, file.path());
    }
    let result = cell.configure_from_env();
    unsafe {
        std::env::remove_var(CONFIG_PATH_ENV);
    }
    assert!(matches!(result, Err(HError::CannotOpenModule { .. })));
    assert!(matches!(cell.get(), Err(HError::NotConfigured)));
    Ok(())
}
