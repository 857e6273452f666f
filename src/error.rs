//! Error taxonomy for the find-my-device core.
//!
//! Protocol errors are the client's fault and terminal for the request.
//! Not-found errors are expected outcomes. Storage errors carry the
//! operation and key they failed on. Startup errors are fatal.

use thiserror::Error;

/// Boxed source error from a storage driver.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for the find-my-device core.
#[derive(Error, Debug)]
pub enum FmdError {
    /// The request carried no `Authorization` header.
    #[error("No Authorization header")]
    NoAuth,

    /// The `Authorization` header uses a scheme other than Hawk.
    #[error("Not a Hawk Authorization header")]
    NotHawkAuth,

    /// The Hawk header is missing a required attribute.
    #[error("Malformed Hawk header: missing {field}")]
    MalformedHeader { field: &'static str },

    /// The recomputed MAC does not match the claimed one.
    #[error("Header does not match signature")]
    InvalidSignature,

    /// No device row exists for the identifier.
    #[error("Unknown device: {device_id}")]
    UnknownDevice { device_id: String },

    /// The nonce was malformed, expired, already consumed or tampered with.
    #[error("Invalid nonce")]
    NonceInvalid,

    /// The backing store failed.
    #[error("Storage error during {operation} ({key}): {source}")]
    Storage {
        operation: &'static str,
        key: String,
        #[source]
        source: BoxError,
    },

    /// A storage operation exceeded its wait bound. Never retried.
    #[error("Storage operation {operation} ({key}) timed out")]
    Timeout { operation: &'static str, key: String },

    /// The database carries a schema marker this build does not understand.
    #[error("Schema version mismatch: expected {expected}, found {found}")]
    SchemaMismatch { expected: String, found: String },

    /// No storage backend is registered under the requested name.
    #[error("Unknown storage backend: {name}")]
    UnknownBackend { name: String },

    /// Configuration could not be loaded or is inconsistent.
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl FmdError {
    /// Caller-fault errors that reject the request without retry.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::NoAuth
                | Self::NotHawkAuth
                | Self::MalformedHeader { .. }
                | Self::InvalidSignature
                | Self::NonceInvalid
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::UnknownDevice { .. })
    }

    /// Errors that must stop the process from serving traffic.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SchemaMismatch { .. } | Self::UnknownBackend { .. } | Self::Config { .. }
        )
    }
}

/// Result type alias for core operations.
pub type FmdResult<T> = Result<T, FmdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_are_classified() {
        assert!(FmdError::NoAuth.is_protocol());
        assert!(FmdError::NotHawkAuth.is_protocol());
        assert!(FmdError::InvalidSignature.is_protocol());
        assert!(FmdError::NonceInvalid.is_protocol());
        assert!(!FmdError::Timeout {
            operation: "store_command",
            key: "dev-1".into()
        }
        .is_protocol());
    }

    #[test]
    fn unknown_device_is_not_found() {
        let err = FmdError::UnknownDevice {
            device_id: "dev-1".into(),
        };
        assert!(err.is_not_found());
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "Unknown device: dev-1");
    }

    #[test]
    fn schema_mismatch_is_fatal() {
        let err = FmdError::SchemaMismatch {
            expected: "2".into(),
            found: "1".into(),
        };
        assert!(err.is_fatal());
    }
}
