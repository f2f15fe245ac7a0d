//! Typed access-log record and the column layout it is stored under.

use chrono::{DateTime, Utc};

/// Destination columns, in the exact order `AccessRecord` fields are written.
///
/// The bulk loader names these columns explicitly, so this list is a wire contract with the
/// table layout created by `PgSink::ensure_schema`.
pub const COLUMNS: [&str; 17] = [
    "time_local",
    "path",
    "ip",
    "server_name",
    "remote_user",
    "remote_port",
    "time",
    "user_agent",
    "user_id_got",
    "user_id_set",
    "request",
    "status",
    "body_bytes_sent",
    "request_time",
    "request_method",
    "geoip_country_code",
    "http_referrer",
];

/// One HTTP access-log event.
///
/// Every field except `event_time` is nullable; nginx writes `-` for values it does not have
/// and the parser maps those to `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessRecord {
    pub time_local: Option<String>,
    pub path: Option<String>,
    pub ip: Option<String>,
    pub server_name: Option<String>,
    pub remote_user: Option<String>,
    pub remote_port: Option<i64>,
    /// Ordering key, stored in the `time` column.
    pub event_time: DateTime<Utc>,
    pub user_agent: Option<String>,
    pub user_id_got: Option<String>,
    pub user_id_set: Option<String>,
    pub request: Option<String>,
    pub status: Option<i64>,
    pub body_bytes_sent: Option<i64>,
    pub request_time: Option<f64>,
    pub request_method: Option<String>,
    pub geoip_country_code: Option<String>,
    pub http_referrer: Option<String>,
}

impl AccessRecord {
    /// A record carrying only its timestamp.
    pub fn at(event_time: DateTime<Utc>) -> Self {
        Self {
            time_local: None,
            path: None,
            ip: None,
            server_name: None,
            remote_user: None,
            remote_port: None,
            event_time,
            user_agent: None,
            user_id_got: None,
            user_id_set: None,
            request: None,
            status: None,
            body_bytes_sent: None,
            request_time: None,
            request_method: None,
            geoip_country_code: None,
            http_referrer: None,
        }
    }
}

/// Earliest and latest `event_time` in `records`, if any.
pub fn time_range(records: &[AccessRecord]) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let first = records.first()?.event_time;
    Some(records.iter().fold((first, first), |(lo, hi), record| {
        (lo.min(record.event_time), hi.max(record.event_time))
    }))
}
