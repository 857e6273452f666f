//! `Authorization: Hawk ...` header codec.

use http::header::AUTHORIZATION;
use http::HeaderMap;

use crate::error::{FmdError, FmdResult};

const SCHEME: &str = "hawk";

/// Attributes carried in a Hawk `Authorization` header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HawkHeader {
    /// Claimed device identifier.
    pub id: String,
    /// Unix seconds, as sent.
    pub ts: String,
    pub nonce: String,
    pub ext: String,
    /// Claimed payload hash. Informational; verification recomputes it.
    pub hash: String,
    pub mac: String,
}

impl HawkHeader {
    /// Read and parse the `Authorization` header of a request.
    pub fn from_headers(headers: &HeaderMap) -> FmdResult<Self> {
        let value = headers
            .get(AUTHORIZATION)
            .ok_or(FmdError::NoAuth)?
            .to_str()
            .map_err(|_| FmdError::NotHawkAuth)?;
        Self::parse(value)
    }

    /// Parse a header value of the form `Hawk id="..", ts="..", ...`.
    ///
    /// Keys may appear in any order; unknown keys are ignored.
    pub fn parse(value: &str) -> FmdResult<Self> {
        let value = value.trim();
        if value.is_empty() {
            return Err(FmdError::NoAuth);
        }
        let (scheme, attrs) = value.split_once(char::is_whitespace).unwrap_or((value, ""));
        if !scheme.eq_ignore_ascii_case(SCHEME) {
            return Err(FmdError::NotHawkAuth);
        }

        let mut header = Self::default();
        for element in attrs.split(',') {
            let Some((key, val)) = element.trim().split_once('=') else {
                continue;
            };
            let val = val.trim().trim_matches('"').to_string();
            match key.trim().to_ascii_lowercase().as_str() {
                "id" => header.id = val,
                "ts" => header.ts = val,
                "nonce" => header.nonce = val,
                "ext" => header.ext = val,
                "hash" => header.hash = val,
                "mac" => header.mac = val,
                _ => {}
            }
        }

        for (field, val) in [
            ("id", &header.id),
            ("ts", &header.ts),
            ("nonce", &header.nonce),
            ("mac", &header.mac),
        ] {
            if val.is_empty() {
                return Err(FmdError::MalformedHeader { field });
            }
        }
        Ok(header)
    }

    /// Render as an `Authorization` header value. Values are written
    /// verbatim and must not contain `"`.
    pub fn render(&self) -> String {
        format!(
            "Hawk id=\"{}\", ts=\"{}\", nonce=\"{}\", ext=\"{}\", hash=\"{}\", mac=\"{}\"",
            self.id, self.ts, self.nonce, self.ext, self.hash, self.mac
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"Hawk id="dev-1", ts="1353832234", nonce="j4h3g2", ext="some-app-ext-data", hash="Yi9LfIIFRtBEPt74PVmbTF/xVAwPn7ub15ePICfgnuY=", mac="6R4rV5iE+NPoym+WwjeHzjAGXUtLNIxmo1vpMofpLAE=""#;

    #[test]
    fn parse_sample_header() {
        let h = HawkHeader::parse(SAMPLE).unwrap();
        assert_eq!(h.id, "dev-1");
        assert_eq!(h.ts, "1353832234");
        assert_eq!(h.nonce, "j4h3g2");
        assert_eq!(h.ext, "some-app-ext-data");
        assert_eq!(h.hash, "Yi9LfIIFRtBEPt74PVmbTF/xVAwPn7ub15ePICfgnuY=");
        assert_eq!(h.mac, "6R4rV5iE+NPoym+WwjeHzjAGXUtLNIxmo1vpMofpLAE=");
    }

    #[test]
    fn scheme_is_case_insensitive_and_order_free() {
        let h = HawkHeader::parse(r#"HAWK mac="m=", nonce="n", foo="bar", ts="1", id="x""#)
            .unwrap();
        assert_eq!(h.id, "x");
        assert_eq!(h.mac, "m=");
        assert_eq!(h.ext, "");
    }

    #[test]
    fn other_scheme_is_rejected() {
        assert!(matches!(
            HawkHeader::parse("Bearer abc"),
            Err(FmdError::NotHawkAuth)
        ));
        assert!(matches!(
            HawkHeader::parse("Haw"),
            Err(FmdError::NotHawkAuth)
        ));
    }

    #[test]
    fn missing_header_is_no_auth() {
        let headers = HeaderMap::new();
        assert!(matches!(
            HawkHeader::from_headers(&headers),
            Err(FmdError::NoAuth)
        ));
    }

    #[test]
    fn missing_mac_is_malformed() {
        assert!(matches!(
            HawkHeader::parse(r#"Hawk id="x", ts="1", nonce="n""#),
            Err(FmdError::MalformedHeader { field: "mac" })
        ));
    }

    #[test]
    fn render_then_parse() {
        let h = HawkHeader::parse(SAMPLE).unwrap();
        let rendered = h.render();
        assert!(rendered.starts_with("Hawk id=\"dev-1\", ts=\"1353832234\""));
        assert_eq!(HawkHeader::parse(&rendered).unwrap(), h);
    }
}
