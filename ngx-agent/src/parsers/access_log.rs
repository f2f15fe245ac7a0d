use crate::parsers::utils::{deserialize_option_text, normalize_hex_escapes};
use crate::parsers::ParseError;
use crate::record::AccessRecord;
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Value nginx writes for variables that are not set.
pub const PLACEHOLDER: &str = "-";

/// Length of the `uid=` style tag in front of `$uid_got` / `$uid_set` values.
const USER_ID_PREFIX_LEN: usize = 4;

#[derive(Deserialize, Default)]
struct RawAccessLine {
    #[serde(default, deserialize_with = "deserialize_option_text")]
    time_local: Option<String>,
    #[serde(default, deserialize_with = "deserialize_option_text")]
    path: Option<String>,
    #[serde(default, deserialize_with = "deserialize_option_text")]
    ip: Option<String>,
    #[serde(default, deserialize_with = "deserialize_option_text")]
    server_name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_option_text")]
    remote_user: Option<String>,
    #[serde(default, deserialize_with = "deserialize_option_text")]
    remote_port: Option<String>,
    #[serde(default, deserialize_with = "deserialize_option_text")]
    time: Option<String>,
    #[serde(default, deserialize_with = "deserialize_option_text")]
    user_agent: Option<String>,
    #[serde(default, deserialize_with = "deserialize_option_text")]
    user_id_got: Option<String>,
    #[serde(default, deserialize_with = "deserialize_option_text")]
    user_id_set: Option<String>,
    #[serde(default, deserialize_with = "deserialize_option_text")]
    request: Option<String>,
    #[serde(default, deserialize_with = "deserialize_option_text")]
    status: Option<String>,
    #[serde(default, deserialize_with = "deserialize_option_text")]
    body_bytes_sent: Option<String>,
    #[serde(default, deserialize_with = "deserialize_option_text")]
    request_time: Option<String>,
    #[serde(default, deserialize_with = "deserialize_option_text")]
    request_method: Option<String>,
    #[serde(default, deserialize_with = "deserialize_option_text")]
    geoip_country_code: Option<String>,
    #[serde(default, deserialize_with = "deserialize_option_text")]
    http_referrer: Option<String>,
}

/// Parses one access-log line.
///
/// `\xHH` escapes are normalized before JSON decoding, `-` becomes `None` for every field, and
/// the numeric fields are coerced. A missing or malformed `time` is an error, never a null.
pub fn parse_line(raw: &str) -> Result<AccessRecord, ParseError> {
    let normalized = normalize_hex_escapes(raw);
    let line: RawAccessLine = serde_json::from_str(&normalized).map_err(ParseError::Malformed)?;

    Ok(AccessRecord {
        time_local: text(line.time_local),
        path: text(line.path),
        ip: text(line.ip),
        server_name: text(line.server_name),
        remote_user: text(line.remote_user),
        remote_port: integer("remote_port", line.remote_port)?,
        event_time: event_time(line.time)?,
        user_agent: text(line.user_agent),
        user_id_got: user_id(line.user_id_got),
        user_id_set: user_id(line.user_id_set),
        request: text(line.request),
        status: integer("status", line.status)?,
        body_bytes_sent: integer("body_bytes_sent", line.body_bytes_sent)?,
        request_time: float("request_time", line.request_time)?,
        request_method: text(line.request_method),
        geoip_country_code: text(line.geoip_country_code),
        http_referrer: text(line.http_referrer),
    })
}

fn text(value: Option<String>) -> Option<String> {
    value.filter(|v| v != PLACEHOLDER)
}

fn integer(field: &'static str, value: Option<String>) -> Result<Option<i64>, ParseError> {
    let Some(raw) = text(value) else {
        return Ok(None);
    };
    raw.parse::<i64>()
        .map(Some)
        .map_err(|_| ParseError::BadNumeric { field, value: raw })
}

fn float(field: &'static str, value: Option<String>) -> Result<Option<f64>, ParseError> {
    let Some(raw) = text(value) else {
        return Ok(None);
    };
    raw.parse::<f64>()
        .map(Some)
        .map_err(|_| ParseError::BadNumeric { field, value: raw })
}

// Values too short to carry the tag are treated as absent.
fn user_id(value: Option<String>) -> Option<String> {
    text(value)
        .and_then(|tagged| tagged.get(USER_ID_PREFIX_LEN..).map(str::to_owned))
        .and_then(|id| text(Some(id)))
}

fn event_time(value: Option<String>) -> Result<DateTime<Utc>, ParseError> {
    let raw = text(value).ok_or(ParseError::MissingTimestamp)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|source| ParseError::BadTimestamp { value: raw, source })
}
