//! Translation of caller-supplied URL paths into storage targets.
//!
//! Strips the scope prefix, resolves `.`/`..` lexically, and refuses anything
//! that would land outside the configured root. Filenames are additionally
//! screened against an optional Unicode alphabet and normalization form, and
//! can receive a randomized suffix before their extension.

use std::path::PathBuf;

use unicode_normalization::{is_nfc, is_nfd};
use uuid::Uuid;

use crate::config::{ScopeConfig, UnicodeForm};
use crate::error::UploadError;

/// Runes that are never acceptable in a filename, network shares in mind.
const ALWAYS_REJECTED: &str = "\"*:<>?|\\";

const SPATIUM: char = '\u{2009}';

/// A URL path translated to its on-disk target.
#[derive(Debug)]
pub struct Resolved {
    /// Absolute target path, a descendant of `write_to`.
    pub path: PathBuf,
    /// Directory portion of `path`.
    pub dir: PathBuf,
    /// Leaf name, empty when the path resolves to the storage root.
    pub filename: String,
    /// Path relative to `write_to` with `/` separators; feeds `Location`.
    pub key: String,
}

impl Resolved {
    /// True when the path names the storage root itself.
    pub fn is_root(&self) -> bool {
        self.filename.is_empty()
    }
}

/// Translates `url_path` (already percent-decoded) into a [`Resolved`] target.
///
/// `randomize` selects whether the configured randomized suffix is applied;
/// upload targets get one, MOVE/COPY/DELETE operands do not.
pub fn resolve(
    config: &ScopeConfig,
    url_path: &str,
    randomize: bool,
) -> Result<Resolved, UploadError> {
    let rel = url_path
        .strip_prefix(config.scope.as_str())
        .unwrap_or(url_path)
        .trim_start_matches('/');

    // Lexical cleaning; popping past the root is the traversal escape.
    let mut segments: Vec<&str> = Vec::new();
    for segment in rel.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                if segments.pop().is_none() {
                    return Err(UploadError::InvalidPath);
                }
            }
            other => segments.push(other),
        }
    }

    if let Some(form) = config.unicode_form
        && !in_form(rel, form)
    {
        return Err(UploadError::InvalidPath);
    }
    if !in_alphabet(rel, &config.alphabet) {
        return Err(UploadError::InvalidPath);
    }

    let (dir, filename) = match segments.split_last() {
        None => (config.write_to.clone(), String::new()),
        Some((leaf, parents)) => {
            let mut dir = config.write_to.clone();
            for parent in parents {
                dir.push(parent);
            }
            let leaf = if randomize && config.randomized_suffix_len > 0 {
                with_random_suffix(leaf, config.randomized_suffix_len)
            } else {
                (*leaf).to_string()
            };
            (dir, leaf)
        }
    };

    let path = if filename.is_empty() { dir.clone() } else { dir.join(&filename) };
    if !path.starts_with(&config.write_to) {
        return Err(UploadError::InvalidPath);
    }

    let mut key_parts: Vec<&str> = segments;
    if let Some(last) = key_parts.last_mut() {
        *last = filename.as_str();
    }
    let key = key_parts.join("/");

    Ok(Resolved { path, dir, filename, key })
}

fn in_form(s: &str, form: UnicodeForm) -> bool {
    match form {
        UnicodeForm::Nfc => is_nfc(s),
        UnicodeForm::Nfd => is_nfd(s),
    }
}

/// True for strings exclusively in the given alphabet, without any of the
/// always-rejected or non-printable runes.
///
/// Whitespace other than U+0020 (space) and U+2009 (spatium) is rejected.
pub fn in_alphabet(s: &str, alphabet: &[AlphabetRange]) -> bool {
    if !alphabet.is_empty() {
        for c in s.chars() {
            if !alphabet.iter().any(|range| range.contains(c)) {
                return false;
            }
        }
    }

    for c in s.chars() {
        if ALWAYS_REJECTED.contains(c) {
            return false;
        }
        if c == ' ' || c == SPATIUM || c == '/' {
            continue;
        }
        if c.is_control() || c.is_whitespace() {
            return false;
        }
        // Line/paragraph separators and the specials block make poor names.
        if ('\u{2028}'..='\u{202F}').contains(&c) || ('\u{FFF0}'..='\u{FFFF}').contains(&c) {
            return false;
        }
    }

    true
}

/// One inclusive range of Unicode code points, with an optional stride.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AlphabetRange {
    pub lo: u32,
    pub hi: u32,
    pub stride: u32,
}

impl AlphabetRange {
    fn contains(&self, c: char) -> bool {
        let cp = c as u32;
        cp >= self.lo && cp <= self.hi && (cp - self.lo) % self.stride == 0
    }
}

/// Parses a space-delimited list of Unicode ranges.
///
/// The format of one range is `<low>-<high>[:<stride>]`, bounds in hex and
/// optionally prefixed with `x` or `U+`. Stride defaults to 1.
pub fn parse_ranges(list: &str) -> Result<Vec<AlphabetRange>, String> {
    let mut ranges = Vec::new();
    for token in list.split_whitespace() {
        let (bounds, stride) = match token.split_once(':') {
            Some((bounds, stride)) => {
                let stride: u32 = stride
                    .parse()
                    .map_err(|_| format!("bad stride in range {token:?}"))?;
                if stride == 0 {
                    return Err(format!("zero stride in range {token:?}"));
                }
                (bounds, stride)
            }
            None => (token, 1),
        };
        let (lo, hi) = bounds
            .split_once('-')
            .ok_or_else(|| format!("range {token:?} is missing its upper bound"))?;
        let lo = parse_codepoint(lo).ok_or_else(|| format!("bad lower bound in {token:?}"))?;
        let hi = parse_codepoint(hi).ok_or_else(|| format!("bad upper bound in {token:?}"))?;
        if lo > hi {
            return Err(format!("range {token:?} must begin with its lower bound"));
        }
        ranges.push(AlphabetRange { lo, hi, stride });
    }
    Ok(ranges)
}

fn parse_codepoint(s: &str) -> Option<u32> {
    let digits = s
        .trim_start_matches("U+")
        .trim_start_matches("u+")
        .trim_start_matches(['x', 'X', 'u', 'U']);
    u32::from_str_radix(digits, 16).ok()
}

/// Inserts `_XXXX` (lowercase alphanumerics) before the last extension.
///
/// A name that is all extension, like `.gitignore`, gets the suffix as its
/// stem: `XXXX.gitignore`.
fn with_random_suffix(name: &str, len: u32) -> String {
    let suffix = random_suffix(len);
    match name.rfind('.') {
        Some(idx) if idx > 0 => format!("{}_{}{}", &name[..idx], suffix, &name[idx..]),
        Some(idx) => format!("{}{}", suffix, &name[idx..]),
        None => format!("{name}_{suffix}"),
    }
}

/// Draws `len` characters from `[0-9a-z]` out of CSPRNG bytes.
fn random_suffix(len: u32) -> String {
    let len = len as usize;
    let mut out = String::with_capacity(len);
    'fill: loop {
        for byte in Uuid::new_v4().into_bytes() {
            if out.len() == len {
                break 'fill;
            }
            let c = byte % 36;
            out.push(char::from(if c < 10 { b'0' + c } else { b'a' + c - 10 }));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScopeConfig;
    use std::collections::HashMap;
    use std::path::Path;

    fn make_config() -> ScopeConfig {
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
            timestamp_tolerance: 4,
            hmac_secrets: HashMap::new(),
            silent_auth_errors: false,
        }
    }

    #[test]
    fn strips_the_scope_prefix() {
        let resolved = resolve(&make_config(), "/s/mine/my.blob", false).expect("resolve");
        assert_eq!(resolved.path, Path::new("/tmp/up/mine/my.blob"));
        assert_eq!(resolved.dir, Path::new("/tmp/up/mine"));
        assert_eq!(resolved.filename, "my.blob");
        assert_eq!(resolved.key, "mine/my.blob");
    }

    #[test]
    fn cleans_inner_parent_segments() {
        let resolved = resolve(&make_config(), "/s/a/../b.txt", false).expect("resolve");
        assert_eq!(resolved.path, Path::new("/tmp/up/b.txt"));
    }

    #[test]
    fn rejects_escape_below_the_root() {
        for path in ["/s/../etc/passwd", "/s/../../x", "/s/a/../../../etc"] {
            let result = resolve(&make_config(), path, false);
            assert!(matches!(result, Err(UploadError::InvalidPath)), "{path}");
        }
    }

    #[test]
    fn scope_alone_resolves_to_the_root() {
        let resolved = resolve(&make_config(), "/s", false).expect("resolve");
        assert!(resolved.is_root());
        assert_eq!(resolved.path, Path::new("/tmp/up"));
    }

    #[test]
    fn accepts_ordinary_names() {
        for name in ["file.name", "the space", "Döner macht schöner."] {
            assert!(in_alphabet(name, &[]), "{name}");
        }
    }

    #[test]
    fn rejects_undesired_runes() {
        for name in [
            "line\nbreak",
            "the\tTAB",
            "Samba?",
            "a null\u{0}.",
            "NEL\u{85}",
            "line\u{2028}",
            "paragraph\u{2029}",
            "stray box \u{fffe}",
            "back\\slash",
        ] {
            assert!(!in_alphabet(name, &[]), "{name:?}");
        }
    }

    #[test]
    fn restricts_to_configured_ranges() {
        let az = parse_ranges("x0061-x007a").expect("parse");
        assert!(in_alphabet("az", &az));
        assert!(!in_alphabet("äz", &az));
        // Separators count too; nested targets need '/' in a range.
        assert!(!in_alphabet("a/z", &az));
    }

    #[test]
    fn parses_range_lists_with_strides() {
        let ranges = parse_ranges("x0000-x007F U+0100-U+017F x2152-x217F:2").expect("parse");
        assert_eq!(
            ranges,
            vec![
                AlphabetRange { lo: 0x0000, hi: 0x007f, stride: 1 },
                AlphabetRange { lo: 0x0100, hi: 0x017f, stride: 1 },
                AlphabetRange { lo: 0x2152, hi: 0x217f, stride: 2 },
            ]
        );
        assert!(parse_ranges("x0080-x0010").is_err());
        assert!(parse_ranges("x0000").is_err());
    }

    #[test]
    fn enforces_normalization_forms() {
        let mut config = make_config();
        config.unicode_form = Some(UnicodeForm::Nfc);
        assert!(resolve(&config, "/s/säet", false).is_ok());

        let decomposed = "/s/sa\u{0308}et";
        assert!(matches!(
            resolve(&config, decomposed, false),
            Err(UploadError::InvalidPath)
        ));

        config.unicode_form = Some(UnicodeForm::Nfd);
        assert!(resolve(&config, decomposed, false).is_ok());
    }

    #[test]
    fn randomized_suffix_sits_before_the_extension() {
        let mut config = make_config();
        config.randomized_suffix_len = 4;

        let resolved = resolve(&config, "/s/name.ext", true).expect("resolve");
        assert_eq!(resolved.filename.len(), "name_XXXX.ext".len());
        assert!(resolved.filename.starts_with("name_"));
        assert!(resolved.filename.ends_with(".ext"));
        let middle = &resolved.filename["name_".len()..resolved.filename.len() - ".ext".len()];
        assert!(middle.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));

        let resolved = resolve(&config, "/s/.ext", true).expect("resolve");
        assert_eq!(resolved.filename.len(), "XXXX.ext".len());
        assert!(resolved.filename.ends_with(".ext"));
        assert!(!resolved.filename.starts_with('.'));

        let resolved = resolve(&config, "/s/name", true).expect("resolve");
        assert!(resolved.filename.starts_with("name_"));
        assert_eq!(resolved.filename.len(), "name_XXXX".len());
    }

    #[test]
    fn suffix_is_skipped_for_literal_operands() {
        let mut config = make_config();
        config.randomized_suffix_len = 4;
        let resolved = resolve(&config, "/s/name.ext", false).expect("resolve");
        assert_eq!(resolved.filename, "name.ext");
    }
}
