//! PostgreSQL sink.
//!
//! Batches are streamed with `COPY ... FROM STDIN` in the text format, which PostgreSQL applies as
//! a single statement: either every row of the batch is stored or none is.

use crate::config::SinkConfig;
use crate::record::{AccessRecord, COLUMNS};
use crate::sink::{RecordSink, SinkError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolCopyExt, PgPoolOptions};
use std::fmt::Write as _;
use std::time::Duration;
use tracing::{debug, info};

const COPY_NULL: &str = "\\N";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

#[derive(Debug, Clone)]
pub struct PgSink {
    pool: PgPool,
    schema: String,
    table: String,
}

impl PgSink {
    pub async fn connect(config: &SinkConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(Duration::from_millis(config.acquire_timeout_ms))
            .connect(&config.database_url)
            .await
            .context("failed to connect to database")?;

        info!(
            schema = %config.schema,
            table = %config.table,
            max_connections = config.max_connections,
            "connected to database"
        );

        Ok(Self::from_pool(
            pool,
            config.schema.clone(),
            config.table.clone(),
        ))
    }

    pub fn from_pool(pool: PgPool, schema: String, table: String) -> Self {
        Self {
            pool,
            schema,
            table,
        }
    }

    fn qualified_table(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }
}

#[async_trait]
impl RecordSink for PgSink {
    async fn ensure_schema(&self) -> Result<(), SinkError> {
        sqlx::query(&format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            quote_ident(&self.schema)
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&create_table_sql(&self.schema, &self.table))
            .execute(&self.pool)
            .await?;

        info!(table = %self.qualified_table(), "database initialized");
        Ok(())
    }

    async fn max_event_time(&self) -> Result<Option<DateTime<Utc>>, SinkError> {
        let sql = format!("SELECT MAX(\"time\") FROM {}", self.qualified_table());
        let max = sqlx::query_scalar::<_, Option<NaiveDateTime>>(&sql)
            .fetch_one(&self.pool)
            .await?;
        Ok(max.map(|naive| naive.and_utc()))
    }

    async fn write_batch(&self, records: &[AccessRecord]) -> Result<u64, SinkError> {
        let statement = copy_statement(&self.schema, &self.table);
        let payload = encode_copy_rows(records);
        debug!(
            record_count = records.len(),
            payload_bytes = payload.len(),
            "starting COPY"
        );

        let mut copy = self.pool.copy_in_raw(&statement).await?;
        let sent = copy.send(payload).await.map(|_| ());
        if let Err(err) = sent {
            let _ = copy.abort("ngx-agent failed to stream batch").await;
            return Err(err.into());
        }
        Ok(copy.finish().await?)
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("database connections closed");
    }
}

/// Double-quotes an SQL identifier, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub fn create_table_sql(schema: &str, table: &str) -> String {
    format!(
        r#"CREATE TABLE IF NOT EXISTS {}.{}
(
    id serial PRIMARY KEY,
    time_local varchar(256),
    path text,
    ip varchar(256),
    server_name varchar(256),
    remote_user varchar(256),
    remote_port int,
    "time" timestamp,
    user_agent text,
    user_id_got text,
    user_id_set text,
    request text,
    status int,
    body_bytes_sent bigint,
    request_time float,
    request_method varchar(128),
    geoip_country_code varchar(256),
    http_referrer text
)"#,
        quote_ident(schema),
        quote_ident(table)
    )
}

pub fn copy_statement(schema: &str, table: &str) -> String {
    let columns = COLUMNS
        .iter()
        .map(|column| quote_ident(column))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "COPY {}.{} ({}) FROM STDIN",
        quote_ident(schema),
        quote_ident(table),
        columns
    )
}

/// Encodes `records` as PostgreSQL COPY text-format rows, columns in [`COLUMNS`] order.
pub fn encode_copy_rows(records: &[AccessRecord]) -> Vec<u8> {
    let mut out = String::with_capacity(records.len() * 256);
    for record in records {
        push_text(&mut out, record.time_local.as_deref());
        out.push('\t');
        push_text(&mut out, record.path.as_deref());
        out.push('\t');
        push_text(&mut out, record.ip.as_deref());
        out.push('\t');
        push_text(&mut out, record.server_name.as_deref());
        out.push('\t');
        push_text(&mut out, record.remote_user.as_deref());
        out.push('\t');
        push_display(&mut out, record.remote_port);
        out.push('\t');
        let _ = write!(out, "{}", record.event_time.naive_utc().format(TIMESTAMP_FORMAT));
        out.push('\t');
        push_text(&mut out, record.user_agent.as_deref());
        out.push('\t');
        push_text(&mut out, record.user_id_got.as_deref());
        out.push('\t');
        push_text(&mut out, record.user_id_set.as_deref());
        out.push('\t');
        push_text(&mut out, record.request.as_deref());
        out.push('\t');
        push_display(&mut out, record.status);
        out.push('\t');
        push_display(&mut out, record.body_bytes_sent);
        out.push('\t');
        push_display(&mut out, record.request_time);
        out.push('\t');
        push_text(&mut out, record.request_method.as_deref());
        out.push('\t');
        push_text(&mut out, record.geoip_country_code.as_deref());
        out.push('\t');
        push_text(&mut out, record.http_referrer.as_deref());
        out.push('\n');
    }
    out.into_bytes()
}

fn push_text(out: &mut String, value: Option<&str>) {
    let Some(value) = value else {
        out.push_str(COPY_NULL);
        return;
    };
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            // PostgreSQL text columns cannot hold NUL.
            '\0' => out.push('?'),
            other => out.push(other),
        }
    }
}

fn push_display<T: std::fmt::Display>(out: &mut String, value: Option<T>) {
    match value {
        Some(value) => {
            let _ = write!(out, "{value}");
        }
        None => out.push_str(COPY_NULL),
    }
}
