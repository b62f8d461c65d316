//! Utility functions for agencycomm

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS, NON_ALPHANUMERIC};
use std::time::Duration;

/// Percent-encoding set for URL paths (keeps `/` so the key hierarchy survives)
const PATH_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b'%')
    .add(b' ')
    .add(b'?')
    .add(b'#')
    .add(b'&')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Percent-encoding set for form fields and query values
const FORM_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Encode an Agency key: `_` becomes `@U`, `@` becomes `@@`
pub fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for c in key.chars() {
        match c {
            '_' => out.push_str("@U"),
            '@' => out.push_str("@@"),
            other => out.push(other),
        }
    }
    out
}

/// Decode an Agency key, the inverse of [`encode_key`]
///
/// An `@` that is not followed by `U` or `@` is kept verbatim.
pub fn decode_key(encoded: &str) -> String {
    let mut out = String::with_capacity(encoded.len());
    let mut chars = encoded.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '@' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('U') => {
                chars.next();
                out.push('_');
            }
            Some('@') => {
                chars.next();
                out.push('@');
            }
            _ => out.push('@'),
        }
    }
    out
}

/// Escape a key path for use in a request URL
pub fn escape_path(path: &str) -> String {
    utf8_percent_encode(path, PATH_ENCODE_SET).to_string()
}

/// Undo [`escape_path`]
pub fn unescape_path(path: &str) -> String {
    percent_decode_str(path).decode_utf8_lossy().into_owned()
}

/// Encode a single form field or query value
pub fn form_encode(value: &str) -> String {
    utf8_percent_encode(value, FORM_ENCODE_SET).to_string()
}

/// Decode a form field or query value (`+` is a space)
pub fn form_decode(value: &str) -> String {
    let spaced = value.replace('+', " ");
    percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}

/// Split an `a=1&b=2` string into decoded pairs
pub fn parse_form(input: &str) -> Vec<(String, String)> {
    input
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((k, v)) => (form_decode(k), form_decode(v)),
            None => (form_decode(part), String::new()),
        })
        .collect()
}

/// Normalize a global key prefix so it begins and ends with `/`
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}/", trimmed)
    }
}

/// Parse duration string (e.g., "500ms", "30s", "5m", "1h")
pub fn parse_duration(s: &str) -> crate::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::InvalidConfig("empty duration".into()));
    }

    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| crate::Error::InvalidConfig(format!("missing duration unit: {}", s)))?;
    let (num_str, unit) = s.split_at(split);

    let num: u64 = num_str
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid duration: {}", s)))?;

    let duration = match unit {
        "ms" => Duration::from_millis(num),
        "s" => Duration::from_secs(num),
        "m" => Duration::from_secs(scaled(num, 60, s)?),
        "h" => Duration::from_secs(scaled(num, 3600, s)?),
        _ => {
            return Err(crate::Error::InvalidConfig(format!(
                "unknown duration unit: {}",
                unit
            )))
        }
    };

    Ok(duration)
}

fn scaled(num: u64, factor: u64, input: &str) -> crate::Result<u64> {
    num.checked_mul(factor)
        .ok_or_else(|| crate::Error::InvalidConfig(format!("duration out of range: {}", input)))
}

/// Current wall-clock time as an RFC 3339 string
pub fn timestamp_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
