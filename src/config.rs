//! CLI arguments and the immutable per-scope configuration.

use std::collections::HashMap;
use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use clap::Parser;
use thiserror::Error;

use crate::pathname::{self, AlphabetRange};

/// Skip reserving space for files expected to be smaller than this.
pub const RESERVE_FILESIZE_THRESHOLD: u64 = 1 << 15;

/// Default exponent for the timestamp tolerance: 1<<2 seconds.
pub const DEFAULT_TOLERANCE_EXPONENT: u32 = 2;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "inlet", about = "HTTP upload intake server")]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "INLET_SCOPE",
        default_value = "/upload",
        help = "URL path prefix the handler is active under"
    )]
    pub scope: String,
    #[arg(
        short = 't',
        long,
        env = "INLET_WRITE_TO",
        help = "Existing directory uploads are written into"
    )]
    pub write_to: String,
    #[arg(
        long,
        env = "INLET_APPARENT_LOCATION",
        help = "URL prefix substituted into Location response headers"
    )]
    pub apparent_location: Option<String>,
    #[arg(
        long,
        env = "INLET_ENABLE_WEBDAV",
        help = "Accept MOVE, COPY, and DELETE in addition to POST/PUT"
    )]
    pub enable_webdav: bool,
    #[arg(
        long,
        env = "INLET_MAX_FILESIZE",
        default_value_t = 0,
        help = "Per-file byte ceiling (0 to disable)"
    )]
    pub max_filesize: u64,
    #[arg(
        long,
        env = "INLET_MAX_TRANSACTION_SIZE",
        default_value_t = 0,
        help = "Per-request byte ceiling across all files (0 to disable)"
    )]
    pub max_transaction_size: u64,
    #[arg(
        long,
        env = "INLET_FILENAMES_FORM",
        help = "Require filenames in a Unicode normalization form: NFC or NFD"
    )]
    pub filenames_form: Option<String>,
    #[arg(
        long,
        env = "INLET_FILENAMES_IN",
        help = "Space-delimited Unicode ranges filenames must lie in, e.g. 'x0000-x007F'"
    )]
    pub filenames_in: Option<String>,
    #[arg(
        long,
        env = "INLET_RANDOM_SUFFIX_LEN",
        default_value_t = 0,
        help = "Length of the randomized filename suffix (0 to disable)"
    )]
    pub random_suffix_len: u32,
    #[arg(
        long,
        env = "INLET_TIMESTAMP_TOLERANCE",
        default_value_t = DEFAULT_TOLERANCE_EXPONENT,
        help = "Exponent e; signed timestamps may differ from now by up to 1<<e seconds"
    )]
    pub timestamp_tolerance: u32,
    #[arg(
        long = "hmac-key",
        env = "INLET_HMAC_KEYS",
        value_delimiter = ',',
        help = "Shared secret as key_id=base64(secret); repeatable. Empty disables auth"
    )]
    pub hmac_keys: Vec<String>,
    #[arg(
        long,
        env = "INLET_SILENT_AUTH_ERRORS",
        help = "Turn auth failures into method-not-allowed delegation"
    )]
    pub silent_auth_errors: bool,
    #[arg(
        short = 'b',
        long,
        env = "INLET_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "INLET_PORT",
        default_value_t = 5025,
        help = "HTTP port"
    )]
    pub port: u16,
}

/// Unicode normalization form filenames may be required to be in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnicodeForm {
    Nfc,
    Nfd,
}

/// Immutable configuration of one handler scope.
///
/// Shared read-only across concurrent requests.
#[derive(Debug)]
pub struct ScopeConfig {
    /// URL path prefix to strip; non-empty, begins with `/`.
    pub scope: String,
    /// On-disk root every upload must stay below.
    pub write_to: PathBuf,
    /// Prefix for `Location` response headers; `None` suppresses them.
    pub apparent_location: Option<String>,
    /// When false only POST and PUT are recognized in scope.
    pub enable_webdav: bool,
    /// Per-file byte ceiling, 0 means unlimited.
    pub max_filesize: u64,
    /// Per-transaction byte ceiling, 0 means unlimited.
    pub max_transaction_size: u64,
    /// Optional normalization form enforcement for filenames.
    pub unicode_form: Option<UnicodeForm>,
    /// Acceptable code point ranges for filenames; empty means unrestricted.
    pub alphabet: Vec<AlphabetRange>,
    /// Length of the `_XXXX` suffix inserted before the last extension.
    pub randomized_suffix_len: u32,
    /// Acceptable distance between `now` and a signed timestamp, in seconds.
    pub timestamp_tolerance: u64,
    /// keyId to shared secret. Empty disables request verification.
    pub hmac_secrets: HashMap<String, Vec<u8>>,
    /// Turn auth failures into delegation instead of 401/403.
    pub silent_auth_errors: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("scope must be a URL path prefix beginning with '/'")]
    BadScope,
    #[error("write_to {0:?}: {1}")]
    BadWriteTo(String, std::io::Error),
    #[error("write_to must be a directory or mount point")]
    WriteToNotADirectory,
    #[error("timestamp_tolerance exponent must be <= 32")]
    ToleranceTooLarge,
    #[error("filenames_form accepts NFC, NFD, or none")]
    BadForm,
    #[error("filenames_in: {0}")]
    BadAlphabet(String),
    #[error("hmac key {0:?} is not in key_id=base64(secret) form")]
    BadHmacKey(String),
}

impl ScopeConfig {
    /// Validates the CLI arguments and builds the scope configuration.
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        if args.scope.is_empty() || !args.scope.starts_with('/') {
            return Err(ConfigError::BadScope);
        }
        let scope = if args.scope.len() > 1 {
            args.scope.trim_end_matches('/').to_string()
        } else {
            args.scope.clone()
        };

        let write_to = std::fs::canonicalize(&args.write_to)
            .map_err(|err| ConfigError::BadWriteTo(args.write_to.clone(), err))?;
        let meta = std::fs::metadata(&write_to)
            .map_err(|err| ConfigError::BadWriteTo(args.write_to.clone(), err))?;
        if !meta.is_dir() {
            return Err(ConfigError::WriteToNotADirectory);
        }

        if args.timestamp_tolerance > 32 {
            return Err(ConfigError::ToleranceTooLarge);
        }

        let unicode_form = match args.filenames_form.as_deref() {
            None | Some("") | Some("none") => None,
            Some("NFC") => Some(UnicodeForm::Nfc),
            Some("NFD") => Some(UnicodeForm::Nfd),
            Some(_) => return Err(ConfigError::BadForm),
        };

        let alphabet = match args.filenames_in.as_deref() {
            None => Vec::new(),
            Some(list) => pathname::parse_ranges(list).map_err(ConfigError::BadAlphabet)?,
        };

        let apparent_location = args
            .apparent_location
            .as_deref()
            .filter(|prefix| !prefix.is_empty())
            .map(str::to_string);

        Ok(ScopeConfig {
            scope,
            write_to,
            apparent_location,
            enable_webdav: args.enable_webdav,
            max_filesize: args.max_filesize,
            max_transaction_size: args.max_transaction_size,
            unicode_form,
            alphabet,
            randomized_suffix_len: args.random_suffix_len,
            timestamp_tolerance: 1u64 << args.timestamp_tolerance,
            hmac_secrets: parse_hmac_keys(&args.hmac_keys)?,
            silent_auth_errors: args.silent_auth_errors,
        })
    }
}

/// Decodes `key_id=base64(secret)` tuples into the shared secret map.
fn parse_hmac_keys(tuples: &[String]) -> Result<HashMap<String, Vec<u8>>, ConfigError> {
    let mut secrets = HashMap::new();
    for tuple in tuples {
        let (key_id, encoded) = tuple
            .split_once('=')
            .ok_or_else(|| ConfigError::BadHmacKey(tuple.clone()))?;
        let secret = BASE64
            .decode(encoded)
            .map_err(|_| ConfigError::BadHmacKey(tuple.clone()))?;
        secrets.insert(key_id.to_string(), secret);
    }
    Ok(secrets)
}
