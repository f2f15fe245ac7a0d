use serde_json::Value;
use std::borrow::Cow;

pub const LINE_PREVIEW_LIMIT: usize = 256;

/// Character substituted for every `\xHH` escape nginx writes for non-printable bytes.
pub const HEX_PLACEHOLDER: char = '?';

/// Splits every complete (`\n`-terminated) line off the front of `buffer`.
///
/// Bytes after the last newline stay in the buffer for the next call.
pub(crate) fn drain_complete_lines(buffer: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut lines = Vec::new();
    let mut start = 0usize;

    for (idx, byte) in buffer.iter().enumerate() {
        if *byte == b'\n' {
            let line = buffer[start..idx].to_vec();
            lines.push(line);
            start = idx + 1;
        }
    }

    if start > 0 {
        buffer.drain(0..start);
    }

    lines
}

pub(crate) fn trim_line_bytes(mut line: Vec<u8>) -> Vec<u8> {
    while line.last().map(|b| *b == b'\r' || *b == b' ') == Some(true) {
        line.pop();
    }
    line
}

pub(crate) fn line_preview(line: &str, limit: usize) -> String {
    let mut preview = String::new();
    for (idx, ch) in line.chars().enumerate() {
        if idx >= limit {
            preview.push('…');
            return preview;
        }
        preview.push(ch);
    }
    preview
}

/// Replaces each `\xHH` escape with [`HEX_PLACEHOLDER`].
///
/// With the default `escape` setting nginx writes raw bytes from user-controlled variables
/// (user agent, referrer, request line) as `\xHH`, which is not a valid JSON escape and would
/// make the whole line undecodable. The original bytes are not recovered.
///
/// Only a backslash that starts an escape counts: in `\\x41` the first two characters are an
/// escaped backslash and `x41` is literal text, so nothing is replaced.
pub fn normalize_hex_escapes(line: &str) -> Cow<'_, str> {
    let bytes = line.as_bytes();
    let mut normalized: Option<String> = None;
    let mut copied = 0usize;
    let mut idx = 0usize;

    while idx < bytes.len() {
        if bytes[idx] != b'\\' {
            idx += 1;
            continue;
        }
        if is_hex_escape(&bytes[idx..]) {
            let out = normalized.get_or_insert_with(|| String::with_capacity(line.len()));
            out.push_str(&line[copied..idx]);
            out.push(HEX_PLACEHOLDER);
            idx += 4;
            copied = idx;
        } else {
            // Skip the escaped character so `\\` never starts a second escape.
            idx += 2;
        }
    }

    match normalized {
        Some(mut out) => {
            out.push_str(&line[copied..]);
            Cow::Owned(out)
        }
        None => Cow::Borrowed(line),
    }
}

fn is_hex_escape(rest: &[u8]) -> bool {
    rest.len() >= 4 && rest[1] == b'x' && rest[2].is_ascii_hexdigit() && rest[3].is_ascii_hexdigit()
}

/// Accepts a string, number, boolean or null and yields its text, if any.
pub(crate) fn deserialize_option_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected string, number or null, got {other}"
        ))),
    }
}
