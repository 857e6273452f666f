//! Single-use server nonces.
//!
//! An issued nonce is `key.signature` where `signature` is the hex MD5 of
//! `key.val` and `val` never leaves the store. MD5 here only detects a
//! corrupted or hand-edited nonce string; it is not a forgery check.

use std::sync::Arc;

use md5::{Digest, Md5};

use crate::error::FmdResult;
use crate::ident;
use crate::storage::{Storage, NONCE_TTL};

/// Issues and consumes single-use nonces through the storage backend.
#[derive(Clone)]
pub struct NonceStore {
    storage: Arc<dyn Storage>,
}

impl NonceStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Create and persist a fresh nonce.
    pub fn issue(&self) -> FmdResult<String> {
        let key = ident::gen_uuid4();
        let val = ident::gen_uuid4();
        self.storage.insert_nonce(&key, &val)?;
        self.storage.metrics().increment("nonce.issued");
        Ok(format!("{key}.{}", signature(&key, &val)))
    }

    /// Consume `nonce`. Returns `Ok(false)` when it is malformed, expired,
    /// already used or does not match its stored value.
    ///
    /// Destructive: a known key is deleted even when the signature is wrong.
    pub fn verify(&self, nonce: &str) -> FmdResult<bool> {
        let Some((key, claimed)) = nonce.split_once('.') else {
            self.reject("malformed");
            return Ok(false);
        };

        let Some(val) = self.storage.take_nonce(key, NONCE_TTL)? else {
            self.reject("unknown");
            return Ok(false);
        };

        if signature(key, &val) == claimed {
            Ok(true)
        } else {
            self.reject("signature");
            Ok(false)
        }
    }

    fn reject(&self, reason: &'static str) {
        tracing::debug!(reason, "Nonce rejected");
        self.storage.metrics().increment("nonce.rejected");
    }
}

fn signature(key: &str, val: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(key.as_bytes());
    hasher.update(b".");
    hasher.update(val.as_bytes());
    hex::encode(hasher.finalize())
}
