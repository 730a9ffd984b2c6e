//! The `Authorization: Signature …` authentication scheme.
//!
//! Knowledge of a shared secret is expressed by an HMAC-SHA256 over the
//! values of a declared list of headers, the first of which must carry a
//! timestamp kept fresh within the configured tolerance.

use std::time::{SystemTime, UNIX_EPOCH};

use axum::http::{HeaderMap, header};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::config::ScopeConfig;
use crate::error::UploadError;

type HmacSha256 = Hmac<Sha256>;

/// Seconds since the Unix epoch, injectable for tests.
pub trait Clock: Send + Sync {
    fn now_unix_seconds(&self) -> u64;
}

/// The wall clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix_seconds(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0)
    }
}

/// The parsed value of an `Authorization` header in scheme "Signature".
#[derive(Debug, PartialEq, Eq)]
pub struct AuthorizationHeader {
    pub key_id: String,
    /// Only `hmac-sha256` is recognized.
    pub algorithm: String,
    pub headers_to_sign: Vec<String>,
    /// Parsed for compatibility, not used here.
    pub extensions: Vec<String>,
    /// Raw HMAC bytes, decoded from base64.
    pub signature: Vec<u8>,
}

impl Default for AuthorizationHeader {
    fn default() -> Self {
        Self {
            key_id: String::new(),
            algorithm: "hmac-sha256".into(),
            headers_to_sign: vec!["timestamp".into(), "token".into()],
            extensions: Vec::new(),
            signature: Vec::new(),
        }
    }
}

impl AuthorizationHeader {
    /// Deserializes `Signature key="value",…`.
    ///
    /// Pairs may be separated by commas and any amount of whitespace; `=` and
    /// `:` both work as the key/value separator; unknown keys are skipped.
    /// Fields absent from the string keep their scheme defaults.
    pub fn parse(value: &str) -> Result<Self, UploadError> {
        let rest = value.trim_start();
        let rest = rest
            .strip_prefix("Signature")
            .ok_or(UploadError::AuthUnauthorized)?;
        if !rest.is_empty() && !rest.starts_with([' ', '\t']) {
            return Err(UploadError::AuthUnauthorized);
        }

        let mut header = AuthorizationHeader::default();
        let mut s = rest;
        loop {
            s = s.trim_start_matches([' ', '\t', '\r', '\n', ',']);
            if s.is_empty() {
                break;
            }

            let key_len = s
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
                .unwrap_or(s.len());
            if key_len == 0 {
                return Err(UploadError::AuthBadRequest("unexpected token".into()));
            }
            let key = s[..key_len].to_ascii_lowercase();
            s = s[key_len..].trim_start_matches([' ', '\t']);

            if !s.starts_with(['=', ':']) {
                return Err(UploadError::AuthBadRequest("unexpected token".into()));
            }
            s = s[1..].trim_start_matches([' ', '\t']);

            let Some(value) = s.strip_prefix('"') else {
                return Err(UploadError::AuthBadRequest("value not in quotes".into()));
            };
            let Some(close) = value.find('"') else {
                return Err(UploadError::AuthBadRequest("value not in quotes".into()));
            };
            let (value, tail) = value.split_at(close);
            s = &tail[1..];

            match key.as_str() {
                "keyid" => header.key_id = value.to_string(),
                "algorithm" => header.algorithm = value.to_string(),
                "headers" => {
                    if !value.is_empty() {
                        header.headers_to_sign =
                            value.split_whitespace().map(str::to_string).collect();
                    }
                }
                "extensions" => {
                    if !value.is_empty() {
                        header.extensions = value.split_whitespace().map(str::to_string).collect();
                    }
                }
                "signature" => {
                    header.signature = BASE64
                        .decode(value)
                        .map_err(|err| UploadError::AuthBadRequest(err.to_string()))?;
                }
                _ => {}
            }
        }

        Ok(header)
    }
}

/// Verifies the request's signature against the configured shared secrets.
///
/// With no secrets configured every request passes. The HMAC is computed
/// even for unknown key ids so timing does not reveal their existence.
pub fn authenticate(
    headers: &HeaderMap,
    config: &ScopeConfig,
    clock: &dyn Clock,
) -> Result<(), UploadError> {
    if config.hmac_secrets.is_empty() {
        return Ok(());
    }

    let raw = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or(UploadError::AuthUnauthorized)?;
    let auth = AuthorizationHeader::parse(raw)?;

    if auth.signature.is_empty()
        || auth.headers_to_sign.len() < 2
        || auth.algorithm != "hmac-sha256"
    {
        return Err(UploadError::AuthBadRequest(
            "unsupported algorithm or missing signature".into(),
        ));
    }
    if !(auth.headers_to_sign[0] == "timestamp" || auth.headers_to_sign[0] == "date")
        || auth.headers_to_sign[1] != "token"
    {
        return Err(UploadError::AuthBadRequest(
            "mismatch in prefix of signed headers".into(),
        ));
    }

    let now = clock.now_unix_seconds();
    for name in &auth.headers_to_sign {
        let value = headers
            .get(name.as_str())
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| UploadError::AuthBadRequest(format!("header is missing: {name}")))?;

        let then = match name.as_str() {
            // An unparseable timestamp counts as 0 and so fails freshness.
            "timestamp" => value.parse::<u64>().unwrap_or(0),
            "date" => httpdate::parse_http_date(value)
                .map_err(|err| UploadError::AuthBadRequest(err.to_string()))?
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs())
                .unwrap_or(0),
            _ => continue,
        };
        if now.abs_diff(then) > config.timestamp_tolerance {
            return Err(UploadError::AuthForbidden);
        }
    }

    let (secret, key_known) = match config.hmac_secrets.get(&auth.key_id) {
        Some(secret) => (secret.as_slice(), true),
        None => (&[][..], false),
    };
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|err| UploadError::Internal(err.to_string()))?;
    for name in &auth.headers_to_sign {
        if let Some(value) = headers.get(name.as_str()) {
            mac.update(value.as_bytes());
        }
    }
    let expected = mac.finalize().into_bytes();
    let signature_matches: bool = expected.as_slice().ct_eq(&auth.signature).into();

    if !key_known || !signature_matches {
        return Err(UploadError::AuthForbidden);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::time::Duration;

    const KEY: &[u8] = b"geheim";
    const TIMESTAMP: u64 = 1458508452;
    const TOKEN: &str = "streng";
    const SIGNATURE: &str = "yql3kIDweM8KYm+9pHzX0PKNskYAU46Jb5D6nLftTvo=";

    struct FixedClock(u64);

    impl Clock for FixedClock {
        fn now_unix_seconds(&self) -> u64 {
            self.0
        }
    }

    fn make_config(secrets: &[(&str, &[u8])]) -> ScopeConfig {
        ScopeConfig {
            scope: "/s".into(),
            write_to: PathBuf::from("/tmp/up"),
            apparent_location: None,
            enable_webdav: false,
            max_filesize: 0,
            max_transaction_size: 0,
            unicode_form: None,
            alphabet: Vec::new(),
            randomized_suffix_len: 0,
            timestamp_tolerance: 1 << 2,
            hmac_secrets: secrets
                .iter()
                .map(|(id, secret)| (id.to_string(), secret.to_vec()))
                .collect(),
            silent_auth_errors: false,
        }
    }

    fn signed_headers(key_id: &str, timestamp: u64, token: &str, signature: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let authorization = format!(
            "Signature keyId=\"{key_id}\",algorithm=\"hmac-sha256\",headers=\"timestamp token\",signature=\"{signature}\""
        );
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&authorization).expect("header value"),
        );
        headers.insert("timestamp", HeaderValue::from_str(&timestamp.to_string()).expect("ts"));
        headers.insert("token", HeaderValue::from_str(token).expect("token"));
        headers
    }

    #[test]
    fn parses_a_serialized_header() {
        let parsed = AuthorizationHeader::parse(
            r#"Signature keyId="(key=id)",algorithm="hmac-sha256",headers="timestamp token",signature="TWFyaw==""#,
        )
        .expect("parse");
        assert_eq!(parsed.key_id, "(key=id)");
        assert_eq!(parsed.algorithm, "hmac-sha256");
        assert_eq!(parsed.headers_to_sign, vec!["timestamp", "token"]);
        assert_eq!(parsed.signature, b"Mark");
    }

    #[test]
    fn parser_tolerates_whitespace_and_empty_extensions() {
        let parsed = AuthorizationHeader::parse(
            "Signature keyId=\"(key=id)\", algorithm=\"hmac-sha256\",  extensions=\"\",\n\theaders=\"timestamp token\",signature=\"TWFyaw==\"",
        )
        .expect("parse");
        assert_eq!(parsed.key_id, "(key=id)");
        assert!(parsed.extensions.is_empty());
        assert_eq!(parsed.signature, b"Mark");
    }

    #[test]
    fn foreign_schemes_are_not_supported() {
        assert!(matches!(
            AuthorizationHeader::parse("Basic dXNlcjpwYXNz"),
            Err(UploadError::AuthUnauthorized)
        ));
        assert!(matches!(
            AuthorizationHeader::parse("Signature keyId=unquoted"),
            Err(UploadError::AuthBadRequest(_))
        ));
    }

    #[test]
    fn passes_without_configured_secrets() {
        let config = make_config(&[]);
        let clock = FixedClock(TIMESTAMP);
        assert!(authenticate(&HeaderMap::new(), &config, &clock).is_ok());
    }

    #[test]
    fn a_valid_signature_passes() {
        let config = make_config(&[("key_1", KEY)]);
        let clock = FixedClock(TIMESTAMP);
        let headers = signed_headers("key_1", TIMESTAMP, TOKEN, SIGNATURE);
        assert!(authenticate(&headers, &config, &clock).is_ok());
    }

    #[test]
    fn missing_authorization_asks_for_credentials() {
        let config = make_config(&[("key_1", KEY)]);
        let clock = FixedClock(TIMESTAMP);
        assert!(matches!(
            authenticate(&HeaderMap::new(), &config, &clock),
            Err(UploadError::AuthUnauthorized)
        ));
    }

    #[test]
    fn forged_inputs_are_rejected() {
        let clock = FixedClock(TIMESTAMP);

        // Wrong shared secret behind the same key id.
        let config = make_config(&[("key_1", b"geheim!")]);
        let headers = signed_headers("key_1", TIMESTAMP, TOKEN, SIGNATURE);
        assert!(matches!(
            authenticate(&headers, &config, &clock),
            Err(UploadError::AuthForbidden)
        ));

        let config = make_config(&[("key_1", KEY)]);

        // Tampered token.
        let headers = signed_headers("key_1", TIMESTAMP, "streng!", SIGNATURE);
        assert!(matches!(
            authenticate(&headers, &config, &clock),
            Err(UploadError::AuthForbidden)
        ));

        // A different signature altogether.
        let headers = signed_headers(
            "key_1",
            TIMESTAMP,
            TOKEN,
            "MBfCB6Txi1rTKf6gDdMxE/SPUdePCFQFLdGkP7mXsI0=",
        );
        assert!(matches!(
            authenticate(&headers, &config, &clock),
            Err(UploadError::AuthForbidden)
        ));

        // Unknown key id fails identically.
        let headers = signed_headers("key_2", TIMESTAMP, TOKEN, SIGNATURE);
        assert!(matches!(
            authenticate(&headers, &config, &clock),
            Err(UploadError::AuthForbidden)
        ));
    }

    #[test]
    fn stale_timestamps_are_rejected_regardless_of_signature() {
        let config = make_config(&[("key_1", KEY)]);
        let headers = signed_headers("key_1", TIMESTAMP, TOKEN, SIGNATURE);

        let clock = FixedClock(TIMESTAMP + 900);
        assert!(matches!(
            authenticate(&headers, &config, &clock),
            Err(UploadError::AuthForbidden)
        ));

        let clock = FixedClock(TIMESTAMP.saturating_sub(900));
        assert!(matches!(
            authenticate(&headers, &config, &clock),
            Err(UploadError::AuthForbidden)
        ));
    }

    #[test]
    fn a_missing_signed_header_is_a_formal_error() {
        let config = make_config(&[("key_1", KEY)]);
        let clock = FixedClock(TIMESTAMP);
        let mut headers = signed_headers("key_1", TIMESTAMP, TOKEN, SIGNATURE);
        headers.remove("token");
        assert!(matches!(
            authenticate(&headers, &config, &clock),
            Err(UploadError::AuthBadRequest(_))
        ));
    }

    #[test]
    fn the_date_header_works_in_place_of_timestamp() {
        let config = make_config(&[("key_1", KEY)]);
        let clock = FixedClock(TIMESTAMP);

        let date = httpdate::fmt_http_date(UNIX_EPOCH + Duration::from_secs(TIMESTAMP));
        let mut mac = HmacSha256::new_from_slice(KEY).expect("mac");
        mac.update(date.as_bytes());
        mac.update(TOKEN.as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());

        let mut headers = HeaderMap::new();
        let authorization = format!(
            "Signature keyId=\"key_1\",algorithm=\"hmac-sha256\",headers=\"date token\",signature=\"{signature}\""
        );
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&authorization).expect("header value"),
        );
        headers.insert(header::DATE, HeaderValue::from_str(&date).expect("date"));
        headers.insert("token", HeaderValue::from_str(TOKEN).expect("token"));

        assert!(authenticate(&headers, &config, &clock).is_ok());
    }
}
