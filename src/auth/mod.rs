//! Inbound request authentication.
//!
//! [`RequestGuard`] composes the pieces an authenticated endpoint needs:
//! parse the Hawk header, load the claimed device's secret, check the MAC
//! against the live request, then consume the server-issued nonce. The
//! nonce is consumed only after the signature holds.

pub mod nonce;

pub use nonce::NonceStore;

use std::sync::Arc;

use http::request::Parts;

use crate::config::HawkConfig;
use crate::error::{FmdError, FmdResult};
use crate::hawk::{HawkAuthenticator, HawkHeader};
use crate::storage::{Device, Storage};

/// Authenticates inbound device requests.
#[derive(Clone)]
pub struct RequestGuard {
    hawk: HawkAuthenticator,
    nonces: NonceStore,
    storage: Arc<dyn Storage>,
}

impl RequestGuard {
    pub fn new(config: HawkConfig, storage: Arc<dyn Storage>) -> Self {
        Self {
            hawk: HawkAuthenticator::new(config),
            nonces: NonceStore::new(storage.clone()),
            storage,
        }
    }

    /// Nonce issuer sharing this guard's storage.
    pub fn nonces(&self) -> &NonceStore {
        &self.nonces
    }

    /// Authenticate a request and return the calling device.
    ///
    /// Fails with a protocol error when the header is absent or malformed,
    /// the MAC does not match or the nonce is not valid. An unknown device
    /// id surfaces as [`FmdError::UnknownDevice`].
    pub fn authenticate(&self, parts: &Parts, body: &str) -> FmdResult<Device> {
        let header = HawkHeader::from_headers(&parts.headers)?;
        let device = self.storage.get_device_info(&header.id)?;

        self.hawk.verify(parts, body, &header, &device.secret)?;

        if !self.nonces.verify(&header.nonce)? {
            tracing::info!(device_id = %device.id, "Rejected request with invalid nonce");
            return Err(FmdError::NonceInvalid);
        }

        tracing::debug!(device_id = %device.id, user_id = %device.user, "Request authenticated");
        Ok(device)
    }
}
