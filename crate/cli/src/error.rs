use std::fmt::Display;

use hsm_keys::HError;
use thiserror::Error;

pub type CliResult<R> = Result<R, CliError>;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("{0}")]
    Configuration(String),
    #[error("{0}")]
    Default(String),
    #[error(transparent)]
    FromHexError(#[from] hex::FromHexError),
    #[error(transparent)]
    Hsm(#[from] HError),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("invalid options: {0}")]
    UserError(String),
}

/// Trait for providing helper methods for `CliResult`.
pub trait CliResultHelper<T> {
    /// Sets the context for the error.
    ///
    /// # Errors
    ///
    /// Returns a `CliResult` with the specified context.
    fn context(self, context: &str) -> CliResult<T>;

    /// Sets the context for the error using a closure.
    ///
    /// # Errors
    ///
    /// Returns a `CliResult` with the context returned by the closure.
    fn with_context<D, O>(self, op: O) -> CliResult<T>
    where
        D: Display + Send + Sync + 'static,
        O: FnOnce() -> D;
}

impl<T, E> CliResultHelper<T> for Result<T, E>
where
    E: std::error::Error,
{
    fn context(self, context: &str) -> CliResult<T> {
        self.map_err(|e| CliError::Default(format!("{context}: {e}")))
    }

    fn with_context<D, O>(self, op: O) -> CliResult<T>
    where
        D: Display + Send + Sync + 'static,
        O: FnOnce() -> D,
    {
        self.map_err(|e| CliError::Default(format!("{}: {e}", op())))
    }
}
