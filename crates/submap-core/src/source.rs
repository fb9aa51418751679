//! Identity source reader.
//!
//! Identities are read from a table in an external PostgreSQL database,
//! ordered by the key column and skipping the identities a run has already
//! processed. Rows come through a server-side cursor in bounded chunks so
//! memory use does not depend on the table size.

use std::collections::VecDeque;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Default number of rows fetched from the cursor per round trip.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Validate and double-quote a table or column name. A single `schema.`
/// prefix is allowed.
pub fn quote_identifier(name: &str) -> Result<String> {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > 2 || !parts.iter().all(|part| is_plain_identifier(part)) {
        return Err(Error::InvalidIdentifier(name.to_string()));
    }
    Ok(parts
        .iter()
        .map(|part| format!("\"{part}\""))
        .collect::<Vec<_>>()
        .join("."))
}

fn is_plain_identifier(part: &str) -> bool {
    let mut chars = part.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// `SELECT COUNT(*)` over the identity table.
pub fn count_query(table: &str) -> Result<String> {
    Ok(format!("SELECT COUNT(*) FROM {}", quote_identifier(table)?))
}

/// Ordered identity query resuming after `offset` rows.
pub fn identity_query(table: &str, column: &str, offset: u64) -> Result<String> {
    let table = quote_identifier(table)?;
    let column = quote_identifier(column)?;
    Ok(format!(
        "SELECT {column}::text FROM {table} ORDER BY {column} OFFSET {offset}"
    ))
}

/// An open, forward-only cursor over identity keys.
#[async_trait]
pub trait IdentityCursor: Send {
    /// Fetch up to `count` identities. An empty batch means the cursor is exhausted.
    async fn fetch(&mut self, count: usize) -> Result<Vec<Uuid>>;

    /// Release the cursor and its transaction.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// A database holding the identities to migrate.
#[async_trait]
pub trait IdentitySource: Send + Sync {
    /// Count all rows in the table.
    async fn count(&self, table: &str) -> Result<u64>;

    /// Open a cursor over `column` of `table` in ascending order, skipping
    /// the first `offset` rows.
    async fn open(
        &self,
        table: &str,
        column: &str,
        offset: u64,
    ) -> Result<Box<dyn IdentityCursor>>;
}

/// Buffered, chunked reader over an identity cursor.
pub struct IdentityReader {
    cursor: Option<Box<dyn IdentityCursor>>,
    buffer: VecDeque<Uuid>,
    chunk_size: usize,
}

impl IdentityReader {
    /// Open a reader starting after `offset` already-processed identities.
    pub async fn open(
        source: &dyn IdentitySource,
        table: &str,
        column: &str,
        offset: u64,
        chunk_size: usize,
    ) -> Result<Self> {
        let cursor = source.open(table, column, offset).await?;
        Ok(Self {
            cursor: Some(cursor),
            buffer: VecDeque::new(),
            chunk_size: chunk_size.max(1),
        })
    }

    /// Next identity in order, or `None` once the table is exhausted.
    pub async fn next(&mut self) -> Result<Option<Uuid>> {
        loop {
            if let Some(identity) = self.buffer.pop_front() {
                return Ok(Some(identity));
            }
            let Some(cursor) = self.cursor.as_mut() else {
                return Ok(None);
            };

            let chunk = cursor.fetch(self.chunk_size).await?;
            debug!(rows = chunk.len(), "fetched identity chunk");
            if chunk.is_empty() {
                self.close_cursor().await?;
                return Ok(None);
            }
            self.buffer.extend(chunk);
        }
    }

    /// Release the cursor early.
    pub async fn close(mut self) -> Result<()> {
        self.close_cursor().await
    }

    async fn close_cursor(&mut self) -> Result<()> {
        match self.cursor.take() {
            Some(cursor) => cursor.close().await,
            None => Ok(()),
        }
    }
}

/// Identity source backed by a PostgreSQL database.
#[derive(Clone)]
pub struct PgIdentitySource {
    pool: PgPool,
}

impl PgIdentitySource {
    /// Wrap an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the identity database.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl IdentitySource for PgIdentitySource {
    async fn count(&self, table: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(&count_query(table)?)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn open(
        &self,
        table: &str,
        column: &str,
        offset: u64,
    ) -> Result<Box<dyn IdentityCursor>> {
        let query = identity_query(table, column, offset)?;
        let name = format!("_cur_get_identities_{}", Uuid::new_v4().simple());

        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("DECLARE {name} NO SCROLL CURSOR FOR {query}"))
            .execute(&mut *tx)
            .await?;
        debug!(cursor = %name, offset, "declared identity cursor");

        Ok(Box::new(PgIdentityCursor { tx, name }))
    }
}

struct PgIdentityCursor {
    tx: Transaction<'static, Postgres>,
    name: String,
}

#[async_trait]
impl IdentityCursor for PgIdentityCursor {
    async fn fetch(&mut self, count: usize) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(&format!("FETCH {count} FROM {}", self.name))
            .fetch_all(&mut *self.tx)
            .await?;

        rows.iter()
            .map(|row| -> Result<Uuid> {
                let raw: Option<String> = row.try_get(0)?;
                let raw = raw.ok_or_else(|| Error::Source("identity column is NULL".to_string()))?;
                Uuid::parse_str(raw.trim())
                    .map_err(|e| Error::Source(format!("invalid identity {raw:?}: {e}")))
            })
            .collect()
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let PgIdentityCursor { mut tx, name } = *self;
        sqlx::query(&format!("CLOSE {name}"))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryIdentitySource;

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("identities").unwrap(), "\"identities\"");
        assert_eq!(
            quote_identifier("registrations.identities").unwrap(),
            "\"registrations\".\"identities\""
        );
        for bad in ["", "1abc", "a-b", "a.b.c", "x\"; DROP", "a..b", "name "] {
            assert!(quote_identifier(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_queries() {
        assert_eq!(
            count_query("identities").unwrap(),
            "SELECT COUNT(*) FROM \"identities\""
        );
        assert_eq!(
            identity_query("identities", "identity_id", 42).unwrap(),
            "SELECT \"identity_id\"::text FROM \"identities\" ORDER BY \"identity_id\" OFFSET 42"
        );
        assert!(identity_query("identities", "id)--", 0).is_err());
    }

    #[tokio::test]
    async fn test_reader_fetches_in_chunks() {
        let source = MemoryIdentitySource::with_count(25);
        let mut reader = IdentityReader::open(&source, "identities", "id", 0, 10)
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Some(identity) = reader.next().await.unwrap() {
            seen.push(identity);
        }

        assert_eq!(seen, source.identities());
        assert_eq!(source.fetches(), vec![10, 10, 5, 0]);
        assert_eq!(source.open_cursors(), 0);
    }

    #[tokio::test]
    async fn test_reader_resumes_after_offset() {
        let source = MemoryIdentitySource::with_count(7);
        let mut reader = IdentityReader::open(&source, "identities", "id", 4, 1000)
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Some(identity) = reader.next().await.unwrap() {
            seen.push(identity);
        }

        assert_eq!(seen, source.identities()[4..].to_vec());
    }

    #[tokio::test]
    async fn test_reader_close_releases_cursor() {
        let source = MemoryIdentitySource::with_count(5);
        let mut reader = IdentityReader::open(&source, "identities", "id", 0, 2)
            .await
            .unwrap();
        assert!(reader.next().await.unwrap().is_some());
        assert_eq!(source.open_cursors(), 1);

        reader.close().await.unwrap();
        assert_eq!(source.open_cursors(), 0);
    }
}
