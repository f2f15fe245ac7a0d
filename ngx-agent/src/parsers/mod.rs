//! Conversion of raw access-log lines into [`AccessRecord`]s.
//!
//! nginx is expected to log with a JSON `log_format`, one object per line. Parsing is a pure
//! function of the line: it never touches the sink or any shared state, and it reports failures
//! through [`ParseError`] so the caller decides whether a bad line is skipped or fatal.
//!
//! # Examples
//!
//! ```
//! use ngx_agent::parsers::parse_line;
//!
//! let record = parse_line(r#"{"time":"2024-01-01T00:00:05Z","status":"200","remote_port":"-"}"#)
//!     .unwrap();
//! assert_eq!(record.status, Some(200));
//! assert_eq!(record.remote_port, None);
//! ```
//!
//! [`AccessRecord`]: crate::record::AccessRecord

mod access_log;
pub mod utils;

pub use access_log::{parse_line, PLACEHOLDER};

use thiserror::Error;

/// Why a line could not be turned into a record.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("line is not a JSON object: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("line has no `time` field")]
    MissingTimestamp,

    #[error("invalid RFC3339 timestamp {value:?}: {source}")]
    BadTimestamp {
        value: String,
        #[source]
        source: chrono::ParseError,
    },

    #[error("non-numeric value {value:?} for field `{field}`")]
    BadNumeric { field: &'static str, value: String },
}

impl ParseError {
    /// Stable label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ParseError::Malformed(_) => "malformed",
            ParseError::MissingTimestamp => "missing_timestamp",
            ParseError::BadTimestamp { .. } => "bad_timestamp",
            ParseError::BadNumeric { .. } => "bad_numeric",
        }
    }
}
