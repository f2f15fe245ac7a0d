//! ngx-agent follows an nginx JSON access log and bulk-loads the parsed entries into PostgreSQL.
//!
//! Lines flow from the [`tailer`] through a bounded queue into the [`pipeline`] coordinator,
//! which parses them ([`parsers`]), batches them by time ([`batch`]), drops anything already
//! stored ([`watermark`]) and hands each batch to the [`sink`] as one bulk write.

pub mod batch;
pub mod config;
pub mod metrics;
pub mod parsers;
pub mod pipeline;
pub mod record;
pub mod runner;
pub mod sink;
pub mod tailer;
pub mod watermark;
