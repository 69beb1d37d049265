use core::fmt::Display;

pub use anyhow::{Context, Error, Result};

#[derive(thiserror::Error, Debug)]
pub enum EpsError {
    #[error("client protocol version {0} is not supported")]
    ProtocolMismatch(String),

    #[error("wallet disconnected")]
    Disconnected,

    #[error("shutdown requested")]
    ShutdownRequested,

    #[error("request line over the {0} byte limit")]
    OversizedRequest(usize),
}

pub trait OptionExt<T> {
    fn or_err<D>(self, context: D) -> Result<T>
    where
        D: Display + Send + Sync + 'static;

    fn req(self) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn or_err<D>(self, context: D) -> Result<T>
    where
        D: Display + Send + Sync + 'static,
    {
        self.context(context)
    }

    fn req(self) -> Result<T> {
        self.context("missing required option")
    }
}

/// Flatten an error and its causes into a single one-line string.
pub fn fmt_error_chain(err: &Error) -> String {
    let chain: Vec<String> = err.chain().map(ToString::to_string).collect();
    chain.join(": ")
}
