//! Error types for parsing recipients and building or sending messages.

use thiserror::Error;

use crate::client::ClientError;

/// Raised when recipient input cannot be read at all.
///
/// Table parse failures are not reported; they only move the parser on to
/// the next fallback. This is what remains when the last one, reading the
/// bytes as plain text, fails too.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Recipient data is not valid UTF-8: {0}")]
    Decode(#[from] std::str::Utf8Error),
}

/// Errors building a single outbound message.
#[derive(Debug, Error)]
pub enum BuildError {
    /// A header value would have split into several header lines.
    #[error("Header {name} must not contain line breaks: {value:?}")]
    HeaderInjection { name: &'static str, value: String },
}

/// Why one recipient of a batch was not sent.
#[derive(Debug, Error)]
pub enum SendError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Client(#[from] ClientError),
}
