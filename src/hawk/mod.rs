//! Minimal Hawk request authentication.
//!
//! Supports header authentication only: no bewits, no algorithm
//! negotiation (always HMAC-SHA256).
//!
//! ## Design
//! Signing and verification share one pure pipeline:
//! [`RequestFacts`] → [`payload_hash`] → [`canonical_string`] → [`mac`].
//! Nothing is cached between steps, and the verifier recomputes method,
//! path, host, port and payload hash from the live request instead of
//! trusting client-declared values.
//!
//! Nonce replay checks are not performed here; see [`crate::auth`].

pub mod canonical;
pub mod header;

pub use canonical::{canonical_string, mac, payload_hash, RequestFacts};
pub use header::HawkHeader;

use http::request::Parts;
use subtle::ConstantTimeEq;

use crate::config::HawkConfig;
use crate::error::{FmdError, FmdResult};
use crate::ident;

/// Device identity used for signing.
#[derive(Debug, Clone, Copy)]
pub struct Credentials<'a> {
    pub id: &'a str,
    pub secret: &'a str,
}

/// Hawk signer and verifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct HawkAuthenticator {
    config: HawkConfig,
}

impl HawkAuthenticator {
    pub fn new(config: HawkConfig) -> Self {
        Self { config }
    }

    /// Sign an outbound request with a fresh timestamp and nonce.
    pub fn sign(&self, parts: &Parts, creds: Credentials<'_>, body: &str, extra: &str) -> HawkHeader {
        let ts = chrono::Utc::now().timestamp().to_string();
        let nonce = ident::gen_nonce(ident::DEFAULT_NONCE_BYTES);
        self.sign_with(parts, creds, body, extra, &ts, &nonce)
    }

    /// Sign with a caller-chosen timestamp and nonce (e.g. a nonce issued
    /// by the server's nonce store).
    pub fn sign_with(
        &self,
        parts: &Parts,
        creds: Credentials<'_>,
        body: &str,
        extra: &str,
        ts: &str,
        nonce: &str,
    ) -> HawkHeader {
        let facts = RequestFacts::from_parts(parts, self.config.override_port);
        let hash = self.hash_payload(&facts, body);
        let mac = self.compute_mac(&facts, creds.secret, ts, nonce, &hash, extra);
        HawkHeader {
            id: creds.id.to_string(),
            ts: ts.to_string(),
            nonce: nonce.to_string(),
            ext: extra.to_string(),
            hash,
            mac,
        }
    }

    /// Sign and render the `Authorization` header value.
    pub fn authorization_header(
        &self,
        parts: &Parts,
        creds: Credentials<'_>,
        body: &str,
        extra: &str,
    ) -> String {
        self.sign(parts, creds, body, extra).render()
    }

    /// Check the claimed MAC in `header` against the live request.
    ///
    /// `secret` is the stored secret of the device named by `header.id`.
    pub fn verify(&self, parts: &Parts, body: &str, header: &HawkHeader, secret: &str) -> FmdResult<()> {
        let facts = RequestFacts::from_parts(parts, self.config.override_port);
        let hash = self.hash_payload(&facts, body);
        let expected = self.compute_mac(&facts, secret, &header.ts, &header.nonce, &hash, &header.ext);

        if macs_match(&header.mac, &expected) {
            Ok(())
        } else {
            tracing::debug!(device_id = %header.id, "Hawk signature mismatch");
            Err(FmdError::InvalidSignature)
        }
    }

    fn hash_payload(&self, facts: &RequestFacts, body: &str) -> String {
        let hash = payload_hash(&facts.content_type, body);
        if self.config.show_hash {
            tracing::debug!(
                payload = %canonical::payload_string(&facts.content_type, body),
                hash = %hash,
                "Hawk payload hash"
            );
        }
        hash
    }

    fn compute_mac(
        &self,
        facts: &RequestFacts,
        secret: &str,
        ts: &str,
        nonce: &str,
        hash: &str,
        ext: &str,
    ) -> String {
        let canonical = canonical_string(facts, ts, nonce, hash, ext);
        if self.config.show_hash {
            tracing::debug!(canonical = %canonical, "Hawk canonical string");
        }
        mac(secret, &canonical)
    }
}

/// Compare two base64 MACs, tolerating missing `=` padding, in constant time.
pub fn macs_match(claimed: &str, expected: &str) -> bool {
    let claimed = claimed.trim_end_matches('=');
    let expected = expected.trim_end_matches('=');
    claimed.as_bytes().ct_eq(expected.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{CONTENT_TYPE, HOST};

    const SECRET: &str = "s3cr3t";
    const BODY: &str = r#"{"op":"lock"}"#;

    fn request(uri: &str) -> Parts {
        http::Request::builder()
            .method("POST")
            .uri(uri)
            .header(HOST, "fmd.example.com")
            .header(CONTENT_TYPE, "application/json")
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    fn creds() -> Credentials<'static> {
        Credentials {
            id: "dev-1",
            secret: SECRET,
        }
    }

    #[test]
    fn sign_then_verify() {
        let hawk = HawkAuthenticator::default();
        let parts = request("/cmd");
        let header = hawk.sign(&parts, creds(), BODY, "");
        assert_eq!(header.id, "dev-1");
        assert!(!header.ts.is_empty());
        assert!(!header.nonce.is_empty());

        let parsed = HawkHeader::parse(&header.render()).unwrap();
        hawk.verify(&parts, BODY, &parsed, SECRET).unwrap();
    }

    #[test]
    fn tampered_mac_fails() {
        let hawk = HawkAuthenticator::default();
        let parts = request("/cmd");
        let mut header = hawk.sign(&parts, creds(), BODY, "ext");
        let mut bytes = header.mac.into_bytes();
        bytes[0] = if bytes[0] == b'A' { b'B' } else { b'A' };
        header.mac = String::from_utf8(bytes).unwrap();
        assert!(matches!(
            hawk.verify(&parts, BODY, &header, SECRET),
            Err(FmdError::InvalidSignature)
        ));
    }

    #[test]
    fn tampered_body_path_or_secret_fails() {
        let hawk = HawkAuthenticator::default();
        let parts = request("/cmd");
        let header = hawk.sign(&parts, creds(), BODY, "");

        assert!(hawk
            .verify(&parts, r#"{"op":"lick"}"#, &header, SECRET)
            .is_err());
        assert!(hawk.verify(&request("/cme"), BODY, &header, SECRET).is_err());
        assert!(hawk.verify(&parts, BODY, &header, "s3cr3u").is_err());
    }

    #[test]
    fn tampered_ext_or_ts_fails() {
        let hawk = HawkAuthenticator::default();
        let parts = request("/cmd");
        let header = hawk.sign(&parts, creds(), BODY, "ext");

        let mut other = header.clone();
        other.ext = "exu".into();
        assert!(hawk.verify(&parts, BODY, &other, SECRET).is_err());

        let mut other = header;
        other.ts = "1".into();
        assert!(hawk.verify(&parts, BODY, &other, SECRET).is_err());
    }

    #[test]
    fn missing_padding_is_tolerated() {
        let hawk = HawkAuthenticator::default();
        let parts = request("/cmd?x=1");
        let mut header = hawk.sign(&parts, creds(), BODY, "");
        assert!(header.mac.ends_with('='));
        header.mac = header.mac.trim_end_matches('=').to_string();
        hawk.verify(&parts, BODY, &header, SECRET).unwrap();
    }

    #[test]
    fn sign_with_is_deterministic() {
        let hawk = HawkAuthenticator::default();
        let parts = request("/cmd");
        let a = hawk.sign_with(&parts, creds(), BODY, "", "1700000000", "abc");
        let b = hawk.sign_with(&parts, creds(), BODY, "", "1700000000", "abc");
        assert_eq!(a, b);
        assert_eq!(a.hash, payload_hash("application/json", BODY));
    }

    #[test]
    fn override_port_must_match_on_both_sides() {
        let signer = HawkAuthenticator::default();
        let verifier = HawkAuthenticator::new(HawkConfig {
            override_port: true,
            show_hash: true,
        });
        let parts = http::Request::builder()
            .method("GET")
            .uri("/pos")
            .header(HOST, "fmd.example.com:8080")
            .body(())
            .unwrap()
            .into_parts()
            .0;
        let header = signer.sign(&parts, creds(), "", "");
        assert!(verifier.verify(&parts, "", &header, SECRET).is_err());
        assert!(signer.verify(&parts, "", &header, SECRET).is_ok());
    }

    #[test]
    fn macs_match_padding() {
        assert!(macs_match("abc=", "abc"));
        assert!(macs_match("abc", "abc=="));
        assert!(!macs_match("abd", "abc"));
        assert!(!macs_match("ab", "abc"));
    }
}
