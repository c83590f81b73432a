//! ClickHouse client wrapper

use crate::config::ClickHouseSettings;
use crate::query::{BuiltQuery, SqlArg};
use ::clickhouse::query::Query;
use ::clickhouse::{Client, Row};
use meterline_common::{DatabaseError, MeteringError, RequestContext, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Shared ClickHouse handle; cheap to clone
#[derive(Clone)]
pub struct ClickHouseStore {
    client: Client,
    chunk_size: usize,
    query_timeout: Duration,
}

impl ClickHouseStore {
    pub fn new(settings: &ClickHouseSettings) -> Self {
        let client = Client::default()
            .with_url(&settings.url)
            .with_database(&settings.database)
            .with_user(&settings.user)
            .with_password(&settings.password);
        Self::with_client(client, settings.write_chunk_size, settings.query_timeout())
    }

    pub fn with_client(client: Client, chunk_size: usize, query_timeout: Duration) -> Self {
        Self {
            client,
            chunk_size: chunk_size.max(1),
            query_timeout,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Request context bounded by the store's default query timeout
    pub(crate) fn bounded(&self, ctx: &RequestContext) -> RequestContext {
        ctx.clone().with_timeout(self.query_timeout)
    }

    fn query(&self, built: &BuiltQuery) -> Query {
        bind_args(self.client.query(&built.sql), &built.args)
    }

    /// Fetch every row; failures before the first row are query errors,
    /// failures after it are row-iteration errors
    pub(crate) async fn fetch_rows<T>(&self, built: &BuiltQuery, hint: &str) -> Result<Vec<T>>
    where
        T: Row + DeserializeOwned,
    {
        debug!(sql = %built.sql, args = built.args.len(), "Executing query");
        let mut cursor = self
            .query(built)
            .fetch::<T>()
            .map_err(|e| classify(hint, e, false))?;

        let mut rows = Vec::new();
        loop {
            match cursor.next().await {
                Ok(Some(row)) => rows.push(row),
                Ok(None) => break,
                Err(e) => return Err(classify(hint, e, !rows.is_empty())),
            }
        }
        Ok(rows)
    }

    /// Single-row result, `None` for an empty result
    pub(crate) async fn fetch_first<T>(&self, built: &BuiltQuery, hint: &str) -> Result<Option<T>>
    where
        T: Row + DeserializeOwned,
    {
        Ok(self.fetch_rows(built, hint).await?.into_iter().next())
    }

    /// Write rows in chunks, one insert round trip per chunk
    pub(crate) async fn insert_chunked<T>(&self, table: &str, rows: &[T], hint: &str) -> Result<()>
    where
        T: Row + Serialize,
    {
        for (i, chunk) in rows.chunks(self.chunk_size).enumerate() {
            if let Err(e) = self.insert_rows(table, chunk, hint).await {
                warn!(table, chunk = i, rows = chunk.len(), error = %e, "Chunk insert failed");
                return Err(e);
            }
        }
        Ok(())
    }

    pub(crate) async fn insert_rows<T>(&self, table: &str, rows: &[T], hint: &str) -> Result<()>
    where
        T: Row + Serialize,
    {
        let mut insert = self
            .client
            .insert::<T>(table)
            .map_err(|e| DatabaseError::insert(hint, e))?;
        for row in rows {
            insert
                .write(row)
                .await
                .map_err(|e| DatabaseError::insert(hint, e))?;
        }
        insert.end().await.map_err(|e| DatabaseError::insert(hint, e))?;
        Ok(())
    }

    /// Run a statement without a result set
    pub(crate) async fn execute(&self, sql: &str, hint: &str) -> Result<()> {
        self.client
            .query(sql)
            .execute()
            .await
            .map_err(|e| DatabaseError::query(hint, e))?;
        Ok(())
    }

    /// Round trip to the server
    pub async fn ping(&self) -> Result<()> {
        self.execute("SELECT 1", "Failed to reach ClickHouse").await
    }
}

/// Attach positional arguments in order
pub(crate) fn bind_args(mut query: Query, args: &[SqlArg]) -> Query {
    for arg in args {
        query = match arg {
            SqlArg::Str(s) => query.bind(s.as_str()),
            SqlArg::Int(i) => query.bind(*i),
            SqlArg::UInt(u) => query.bind(*u),
            SqlArg::Float(f) => query.bind(*f),
        };
    }
    query
}

/// Server-side parse failures of an aggregation target surface as cast errors
fn classify(hint: &str, err: impl std::fmt::Display, after_rows: bool) -> MeteringError {
    let message = err.to_string();
    if message.contains("Cannot parse") || message.contains("CANNOT_PARSE") {
        return MeteringError::Cast(format!("{}: {}", hint, message));
    }
    if after_rows {
        DatabaseError::row_iteration(hint, message).into()
    } else {
        DatabaseError::query(hint, message).into()
    }
}
