//! Persistent movie table access and the transactional loader.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tmdb_core::{ReportSourceRow, StoredMovieRow, STORED_COLUMNS, STORE_SCHEMA, STORE_TABLE};
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const CREATE_TABLES_SQL: &str = include_str!("../sql/create_tables.sql");

pub const DEFAULT_LOAD_CHUNK_SIZE: usize = 1000;

/// Postgres caps one statement at `u16::MAX` bind parameters.
const MAX_BIND_PARAMS: usize = u16::MAX as usize;

/// Largest multi-row INSERT that stays under the bind-parameter cap.
pub const MAX_LOAD_CHUNK_SIZE: usize = MAX_BIND_PARAMS / STORED_COLUMNS.len();

/// Chunk size actually used for INSERTs: at least one row, at most
/// [`MAX_LOAD_CHUNK_SIZE`].
pub fn effective_chunk_size(requested: usize) -> usize {
    requested.clamp(1, MAX_LOAD_CHUNK_SIZE)
}

/// Storage seam for the movie table. The loader is the only writer.
#[async_trait]
pub trait MovieStore: Send + Sync {
    async fn ensure_schema(&self) -> Result<()>;

    /// Replace the table contents with `rows` as one unit of work: on error
    /// the previous contents stay in place.
    async fn replace_all(&self, rows: &[StoredMovieRow], chunk_size: usize) -> Result<u64>;

    async fn fetch_report_rows(&self) -> Result<Vec<ReportSourceRow>>;
}

fn qualified_table() -> String {
    format!("{STORE_SCHEMA}.{STORE_TABLE}")
}

#[derive(Debug, Clone)]
pub struct PgMovieStore {
    pool: PgPool,
}

impl PgMovieStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl MovieStore for PgMovieStore {
    async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(CREATE_TABLES_SQL)
            .execute(&self.pool)
            .await
            .context("creating movie table")?;
        Ok(())
    }

    async fn replace_all(&self, rows: &[StoredMovieRow], chunk_size: usize) -> Result<u64> {
        let table = qualified_table();
        let mut tx = self.pool.begin().await.context("beginning load transaction")?;
        sqlx::query(&format!("TRUNCATE {table}"))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("truncating {table}"))?;

        let effective = effective_chunk_size(chunk_size);
        if effective != chunk_size {
            warn!(requested = chunk_size, effective, "load chunk size clamped");
        }

        let mut inserted = 0u64;
        for chunk in rows.chunks(effective) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {table} ({}) ",
                STORED_COLUMNS.join(", ")
            ));
            builder.push_values(chunk, |mut values, row| {
                values
                    .push_bind(row.id)
                    .push_bind(row.title.clone())
                    .push_bind(row.release_date)
                    .push_bind(row.vote_average)
                    .push_bind(row.vote_count)
                    .push_bind(row.popularity)
                    .push_bind(row.runtime)
                    .push_bind(row.genres.clone())
                    .push_bind(row.cast_top3.clone());
            });
            inserted += builder
                .build()
                .execute(&mut *tx)
                .await
                .with_context(|| format!("inserting {} rows into {table}", chunk.len()))?
                .rows_affected();
        }

        tx.commit().await.context("committing load transaction")?;
        Ok(inserted)
    }

    async fn fetch_report_rows(&self) -> Result<Vec<ReportSourceRow>> {
        let rows = sqlx::query(&format!(
            "SELECT id, title, vote_average, vote_count, genres FROM {} ORDER BY id",
            qualified_table()
        ))
        .fetch_all(&self.pool)
        .await
        .context("querying stored movies")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(ReportSourceRow {
                id: row.try_get("id")?,
                title: row.try_get("title")?,
                vote_average: row.try_get("vote_average")?,
                vote_count: row.try_get("vote_count")?,
                genres: row.try_get("genres")?,
            });
        }
        Ok(out)
    }
}

/// In-process store with the same replace semantics, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryMovieStore {
    rows: Mutex<Vec<StoredMovieRow>>,
    fail_next_load: AtomicBool,
}

impl MemoryMovieStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: Vec<StoredMovieRow>) -> Self {
        Self {
            rows: Mutex::new(rows),
            fail_next_load: AtomicBool::new(false),
        }
    }

    /// Make the next `replace_all` fail after it has staged its rows.
    pub fn fail_next_load(&self) {
        self.fail_next_load.store(true, Ordering::SeqCst);
    }

    pub async fn rows(&self) -> Vec<StoredMovieRow> {
        self.rows.lock().await.clone()
    }
}

#[async_trait]
impl MovieStore for MemoryMovieStore {
    async fn ensure_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn replace_all(&self, rows: &[StoredMovieRow], chunk_size: usize) -> Result<u64> {
        let mut table = self.rows.lock().await;
        let mut staged = Vec::with_capacity(rows.len());
        for chunk in rows.chunks(effective_chunk_size(chunk_size)) {
            staged.extend_from_slice(chunk);
        }
        if self.fail_next_load.swap(false, Ordering::SeqCst) {
            bail!("load into {} aborted", qualified_table());
        }
        *table = staged;
        Ok(rows.len() as u64)
    }

    async fn fetch_report_rows(&self) -> Result<Vec<ReportSourceRow>> {
        let mut rows = self
            .rows
            .lock()
            .await
            .iter()
            .map(ReportSourceRow::from)
            .collect::<Vec<_>>();
        // Same order as `ORDER BY id`: nulls last.
        rows.sort_by_key(|row| (row.id.is_none(), row.id));
        Ok(rows)
    }
}

/// Replace the stored table with the merged rows.
pub async fn load_rows(store: &dyn MovieStore, rows: &[StoredMovieRow], chunk_size: usize) -> Result<u64> {
    let inserted = store
        .replace_all(rows, chunk_size)
        .await
        .with_context(|| format!("loading {} rows into {}", rows.len(), qualified_table()))?;
    info!(rows = inserted, table = %qualified_table(), "replaced stored movies");
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i64, genres: &str) -> StoredMovieRow {
        StoredMovieRow {
            id: Some(id),
            title: Some(format!("movie-{id}")),
            release_date: None,
            vote_average: Some(7.0),
            vote_count: Some(100.0),
            popularity: None,
            runtime: None,
            genres: Some(genres.to_string()),
            cast_top3: None,
        }
    }

    #[tokio::test]
    async fn loading_twice_keeps_only_the_latest_run() {
        let store = MemoryMovieStore::new();
        let rows = vec![row(1, "Drama"), row(2, "Comedy"), row(3, "Action")];

        load_rows(&store, &rows, 2).await.expect("first load");
        load_rows(&store, &rows, 2).await.expect("second load");
        assert_eq!(store.rows().await, rows);

        load_rows(&store, &rows[..1], 2).await.expect("third load");
        assert_eq!(store.rows().await.len(), 1);
    }

    #[tokio::test]
    async fn failed_load_leaves_previous_contents() {
        let previous = vec![row(1, "Drama")];
        let store = MemoryMovieStore::with_rows(previous.clone());
        store.fail_next_load();

        let err = load_rows(&store, &[row(2, "Horror"), row(3, "Comedy")], 1)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("loading 2 rows"));
        assert_eq!(store.rows().await, previous);
    }

    #[tokio::test]
    async fn report_rows_come_back_ordered_by_id() {
        let store = MemoryMovieStore::with_rows(vec![row(9, "Drama"), row(3, "Comedy")]);
        let rows = store.fetch_report_rows().await.unwrap();
        assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![Some(3), Some(9)]);
    }

    #[tokio::test]
    async fn null_ids_sort_after_real_ids() {
        let mut orphan = row(0, "Drama");
        orphan.id = None;
        let store = MemoryMovieStore::with_rows(vec![orphan, row(7, "Drama"), row(2, "Comedy")]);
        let rows = store.fetch_report_rows().await.unwrap();
        assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![Some(2), Some(7), None]);
    }

    #[test]
    fn chunk_size_stays_within_bind_parameter_cap() {
        assert_eq!(MAX_LOAD_CHUNK_SIZE, 7281);
        assert!(MAX_LOAD_CHUNK_SIZE * STORED_COLUMNS.len() <= u16::MAX as usize);
        assert_eq!(effective_chunk_size(10_000), MAX_LOAD_CHUNK_SIZE);
        assert_eq!(effective_chunk_size(DEFAULT_LOAD_CHUNK_SIZE), DEFAULT_LOAD_CHUNK_SIZE);
        assert_eq!(effective_chunk_size(0), 1);
    }

    #[test]
    fn create_tables_sql_covers_stored_columns() {
        for column in STORED_COLUMNS {
            assert!(CREATE_TABLES_SQL.contains(column), "missing {column}");
        }
    }
}
