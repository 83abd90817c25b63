//! Unified error type carried across all modules and targets.

use std::fmt;
use std::io;
use std::net;

/// Unified error type for LeaseKV. Wraps a plain message string; source
/// errors are flattened into their string representation at conversion time.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct LeaseKvError(pub String);

impl LeaseKvError {
    /// Creates an error from anything displayable.
    pub fn msg(msg: impl fmt::Display) -> Self {
        LeaseKvError(msg.to_string())
    }
}

impl fmt::Display for LeaseKvError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // no literal quotes around the message
    }
}

impl std::error::Error for LeaseKvError {}

// Saves boiler-plate `impl From<T>`s for the common source error types that
// flow through `?` in this crate.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for LeaseKvError {
            fn from(e: $error) -> Self {
                LeaseKvError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(std::string::FromUtf8Error);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::time::error::Elapsed);
impl_from_error!(tokio::task::JoinError);
impl_from_error!(tokio::sync::oneshot::error::RecvError);
impl_from_error!(tokio::sync::mpsc::error::TryRecvError);
impl_from_error!(
    tokio::sync::watch::error::SendError<Option<tokio::time::Instant>>
);

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for LeaseKvError {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        LeaseKvError(e.to_string())
    }
}

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = LeaseKvError("lease fell off a cliff".into());
        assert_eq!(format!("{}", e), String::from("lease fell off a cliff"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "gone!");
        let e = LeaseKvError::from(io_error);
        assert!(e.0.contains("gone!"));
    }

    #[test]
    fn msg_constructor() {
        assert_eq!(
            LeaseKvError::msg(42),
            LeaseKvError(String::from("42"))
        );
    }
}
