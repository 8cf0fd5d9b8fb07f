//! Parquet snapshot artifacts passed between pipeline stages, plus housekeeping.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use arrow_array::types::{ArrowPrimitiveType, Date32Type, Float64Type, Int64Type};
use arrow_array::{
    new_null_array, Array, ArrayRef, Date32Array, Float64Array, Int64Array, PrimitiveArray,
    RecordBatch, StringArray,
};
use arrow_schema::{ArrowError, DataType, Field as ArrowField, Schema, SchemaRef};
use chrono::{Datelike, NaiveDate};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::errors::ParquetError;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tmdb_core::{CreditRecord, MovieRecord, StoredMovieRow, STORED_COLUMNS};
use tokio::fs;
use tracing::{info, info_span, warn};
use uuid::Uuid;

pub const MOVIES_CSV: &str = "tmdb_5000_movies.csv";
pub const CREDITS_CSV: &str = "tmdb_5000_credits.csv";
pub const REPORT_CSV: &str = "top_genres_by_rating.csv";

// 1970-01-01 counted from 0001-01-01 (CE day 1).
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Directory layout of one pipeline data root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.root.join("raw")
    }

    pub fn bronze_dir(&self) -> PathBuf {
        self.root.join("bronze")
    }

    pub fn silver_dir(&self) -> PathBuf {
        self.root.join("silver")
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.root.join("outputs")
    }

    pub fn movies_csv(&self) -> PathBuf {
        self.raw_dir().join(MOVIES_CSV)
    }

    pub fn credits_csv(&self) -> PathBuf {
        self.raw_dir().join(CREDITS_CSV)
    }

    pub fn bronze_movies(&self) -> PathBuf {
        self.bronze_dir().join("movies.parquet")
    }

    pub fn bronze_credits(&self) -> PathBuf {
        self.bronze_dir().join("credits.parquet")
    }

    pub fn silver_merged(&self) -> PathBuf {
        self.silver_dir().join("movies_merged.parquet")
    }

    pub fn report_csv(&self) -> PathBuf {
        self.outputs_dir().join(REPORT_CSV)
    }

    pub async fn ensure_dirs(&self) -> anyhow::Result<()> {
        for dir in [self.bronze_dir(), self.silver_dir(), self.outputs_dir()] {
            fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Handle to a snapshot written by one stage and read by the next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotArtifact {
    pub path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
    pub rows: usize,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot is missing column {0:?}")]
    MissingColumn(String),
    #[error("column {column:?} has type {found}, expected {expected}")]
    ColumnType {
        column: String,
        found: DataType,
        expected: DataType,
    },
    #[error("column {0:?} contains null identifiers")]
    NullIdentifier(String),
    #[error(transparent)]
    Arrow(#[from] ArrowError),
    #[error(transparent)]
    Parquet(#[from] ParquetError),
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn encode_parquet(batch: &RecordBatch) -> Result<Vec<u8>, SnapshotError> {
    let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), None)?;
    writer.write(batch)?;
    Ok(writer.into_inner()?)
}

/// Write a record batch as Parquet through a temp file and an atomic rename,
/// so a reader never sees a half-written snapshot.
pub fn write_snapshot(path: &Path, batch: &RecordBatch) -> anyhow::Result<SnapshotArtifact> {
    let _guard = info_span!("write_snapshot", path = %path.display()).entered();
    let bytes = encode_parquet(batch).with_context(|| format!("encoding {}", path.display()))?;
    let parent = path
        .parent()
        .with_context(|| format!("snapshot path {} has no parent", path.display()))?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("creating snapshot directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    std::fs::write(&temp_path, &bytes)
        .with_context(|| format!("writing temp snapshot {}", temp_path.display()))?;
    if let Err(err) = std::fs::rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(err).with_context(|| {
            format!(
                "atomically renaming temp snapshot {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }

    let artifact = SnapshotArtifact {
        path: path.to_path_buf(),
        content_hash: sha256_hex(&bytes),
        byte_size: bytes.len(),
        rows: batch.num_rows(),
    };
    info!(rows = artifact.rows, bytes = artifact.byte_size, hash = %artifact.content_hash, "snapshot written");
    Ok(artifact)
}

/// Read every record batch of a snapshot along with its schema.
pub fn read_snapshot(path: &Path) -> anyhow::Result<(SchemaRef, Vec<RecordBatch>)> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("reading parquet metadata {}", path.display()))?;
    let schema = builder.schema().clone();
    let reader = builder
        .build()
        .with_context(|| format!("opening parquet reader {}", path.display()))?;
    let batches = reader
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("decoding record batches {}", path.display()))?;
    Ok((schema, batches))
}

fn typed_column<'a, A: Array + 'static>(
    batch: &'a RecordBatch,
    name: &str,
    expected: DataType,
) -> Result<&'a A, SnapshotError> {
    let column = batch
        .column_by_name(name)
        .ok_or_else(|| SnapshotError::MissingColumn(name.to_string()))?;
    column
        .as_any()
        .downcast_ref::<A>()
        .ok_or_else(|| SnapshotError::ColumnType {
            column: name.to_string(),
            found: column.data_type().clone(),
            expected,
        })
}

fn int64_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Int64Array, SnapshotError> {
    typed_column(batch, name, DataType::Int64)
}

fn float64_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Float64Array, SnapshotError> {
    typed_column(batch, name, DataType::Float64)
}

fn date32_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Date32Array, SnapshotError> {
    typed_column(batch, name, DataType::Date32)
}

fn utf8_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray, SnapshotError> {
    typed_column(batch, name, DataType::Utf8)
}

fn value_at<T: ArrowPrimitiveType>(array: &PrimitiveArray<T>, idx: usize) -> Option<T::Native> {
    array.is_valid(idx).then(|| array.value(idx))
}

fn string_at(array: &StringArray, idx: usize) -> Option<String> {
    array.is_valid(idx).then(|| array.value(idx).to_string())
}

fn required_id(array: &Int64Array, idx: usize, column: &str) -> Result<i64, SnapshotError> {
    value_at(array, idx).ok_or_else(|| SnapshotError::NullIdentifier(column.to_string()))
}

pub fn date_to_days(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE
}

pub fn days_to_date(days: i32) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(days.checked_add(UNIX_EPOCH_DAYS_FROM_CE)?)
}

fn date_at(array: &Date32Array, idx: usize) -> Option<NaiveDate> {
    value_at::<Date32Type>(array, idx).and_then(days_to_date)
}

pub fn movies_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Int64, false),
        ArrowField::new("title", DataType::Utf8, true),
        ArrowField::new("release_date", DataType::Date32, true),
        ArrowField::new("vote_average", DataType::Float64, true),
        ArrowField::new("vote_count", DataType::Float64, true),
        ArrowField::new("popularity", DataType::Float64, true),
        ArrowField::new("runtime", DataType::Float64, true),
        ArrowField::new("genres", DataType::Utf8, true),
    ]))
}

pub fn credits_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        ArrowField::new("movie_id", DataType::Int64, false),
        ArrowField::new("cast", DataType::Utf8, true),
    ]))
}

/// Schema of the merged snapshot and of the persisted table.
pub fn stored_schema() -> SchemaRef {
    let types = [
        DataType::Int64,
        DataType::Utf8,
        DataType::Date32,
        DataType::Float64,
        DataType::Float64,
        DataType::Float64,
        DataType::Float64,
        DataType::Utf8,
        DataType::Utf8,
    ];
    Arc::new(Schema::new(
        STORED_COLUMNS
            .iter()
            .zip(types)
            .map(|(name, data_type)| ArrowField::new(*name, data_type, true))
            .collect::<Vec<_>>(),
    ))
}

pub fn movies_to_batch(movies: &[MovieRecord]) -> Result<RecordBatch, SnapshotError> {
    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from(movies.iter().map(|m| m.id).collect::<Vec<_>>())),
        Arc::new(StringArray::from(
            movies.iter().map(|m| m.title.as_deref()).collect::<Vec<_>>(),
        )),
        Arc::new(Date32Array::from(
            movies
                .iter()
                .map(|m| m.release_date.map(date_to_days))
                .collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(movies.iter().map(|m| m.vote_average).collect::<Vec<_>>())),
        Arc::new(Float64Array::from(movies.iter().map(|m| m.vote_count).collect::<Vec<_>>())),
        Arc::new(Float64Array::from(movies.iter().map(|m| m.popularity).collect::<Vec<_>>())),
        Arc::new(Float64Array::from(movies.iter().map(|m| m.runtime).collect::<Vec<_>>())),
        Arc::new(StringArray::from(
            movies.iter().map(|m| m.genres_raw.as_deref()).collect::<Vec<_>>(),
        )),
    ];
    Ok(RecordBatch::try_new(movies_schema(), columns)?)
}

pub fn movies_from_batch(batch: &RecordBatch) -> Result<Vec<MovieRecord>, SnapshotError> {
    let ids = int64_column(batch, "id")?;
    let titles = utf8_column(batch, "title")?;
    let release_dates = date32_column(batch, "release_date")?;
    let vote_averages = float64_column(batch, "vote_average")?;
    let vote_counts = float64_column(batch, "vote_count")?;
    let popularity = float64_column(batch, "popularity")?;
    let runtimes = float64_column(batch, "runtime")?;
    let genres = utf8_column(batch, "genres")?;

    (0..batch.num_rows())
        .map(|i| {
            Ok(MovieRecord {
                id: required_id(ids, i, "id")?,
                title: string_at(titles, i),
                release_date: date_at(release_dates, i),
                vote_average: value_at::<Float64Type>(vote_averages, i),
                vote_count: value_at::<Float64Type>(vote_counts, i),
                popularity: value_at::<Float64Type>(popularity, i),
                runtime: value_at::<Float64Type>(runtimes, i),
                genres_raw: string_at(genres, i),
            })
        })
        .collect()
}

pub fn credits_to_batch(credits: &[CreditRecord]) -> Result<RecordBatch, SnapshotError> {
    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from(credits.iter().map(|c| c.movie_id).collect::<Vec<_>>())),
        Arc::new(StringArray::from(
            credits.iter().map(|c| c.cast_raw.as_deref()).collect::<Vec<_>>(),
        )),
    ];
    Ok(RecordBatch::try_new(credits_schema(), columns)?)
}

pub fn credits_from_batch(batch: &RecordBatch) -> Result<Vec<CreditRecord>, SnapshotError> {
    let ids = int64_column(batch, "movie_id")?;
    let casts = utf8_column(batch, "cast")?;
    (0..batch.num_rows())
        .map(|i| {
            Ok(CreditRecord {
                movie_id: required_id(ids, i, "movie_id")?,
                cast_raw: string_at(casts, i),
            })
        })
        .collect()
}

pub fn stored_rows_to_batch(rows: &[StoredMovieRow]) -> Result<RecordBatch, SnapshotError> {
    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from(rows.iter().map(|r| r.id).collect::<Vec<_>>())),
        Arc::new(StringArray::from(rows.iter().map(|r| r.title.as_deref()).collect::<Vec<_>>())),
        Arc::new(Date32Array::from(
            rows.iter()
                .map(|r| r.release_date.map(date_to_days))
                .collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(rows.iter().map(|r| r.vote_average).collect::<Vec<_>>())),
        Arc::new(Float64Array::from(rows.iter().map(|r| r.vote_count).collect::<Vec<_>>())),
        Arc::new(Float64Array::from(rows.iter().map(|r| r.popularity).collect::<Vec<_>>())),
        Arc::new(Float64Array::from(rows.iter().map(|r| r.runtime).collect::<Vec<_>>())),
        Arc::new(StringArray::from(rows.iter().map(|r| r.genres.as_deref()).collect::<Vec<_>>())),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.cast_top3.as_deref()).collect::<Vec<_>>(),
        )),
    ];
    Ok(RecordBatch::try_new(stored_schema(), columns)?)
}

/// Conform a batch to the stored column set: absent columns are back-filled
/// with typed nulls, extra columns are dropped, and a present column with the
/// wrong type is an error. Returns the names of back-filled columns.
pub fn reconcile_stored_columns(
    batch: &RecordBatch,
) -> Result<(RecordBatch, Vec<&'static str>), SnapshotError> {
    let schema = stored_schema();
    let mut backfilled = Vec::new();
    let mut columns = Vec::with_capacity(STORED_COLUMNS.len());
    for (name, field) in STORED_COLUMNS.iter().zip(schema.fields()) {
        match batch.column_by_name(name) {
            Some(column) if column.data_type() == field.data_type() => columns.push(column.clone()),
            Some(column) => {
                return Err(SnapshotError::ColumnType {
                    column: name.to_string(),
                    found: column.data_type().clone(),
                    expected: field.data_type().clone(),
                })
            }
            None => {
                backfilled.push(*name);
                columns.push(new_null_array(field.data_type(), batch.num_rows()));
            }
        }
    }
    Ok((RecordBatch::try_new(schema, columns)?, backfilled))
}

/// Decode a batch already conformed by [`reconcile_stored_columns`].
pub fn stored_rows_from_batch(batch: &RecordBatch) -> Result<Vec<StoredMovieRow>, SnapshotError> {
    let ids = int64_column(batch, "id")?;
    let titles = utf8_column(batch, "title")?;
    let release_dates = date32_column(batch, "release_date")?;
    let vote_averages = float64_column(batch, "vote_average")?;
    let vote_counts = float64_column(batch, "vote_count")?;
    let popularity = float64_column(batch, "popularity")?;
    let runtimes = float64_column(batch, "runtime")?;
    let genres = utf8_column(batch, "genres")?;
    let casts = utf8_column(batch, "cast_top3")?;

    Ok((0..batch.num_rows())
        .map(|i| StoredMovieRow {
            id: value_at::<Int64Type>(ids, i),
            title: string_at(titles, i),
            release_date: date_at(release_dates, i),
            vote_average: value_at::<Float64Type>(vote_averages, i),
            vote_count: value_at::<Float64Type>(vote_counts, i),
            popularity: value_at::<Float64Type>(popularity, i),
            runtime: value_at::<Float64Type>(runtimes, i),
            genres: string_at(genres, i),
            cast_top3: string_at(casts, i),
        })
        .collect())
}

pub fn write_movies_snapshot(path: &Path, movies: &[MovieRecord]) -> anyhow::Result<SnapshotArtifact> {
    let batch = movies_to_batch(movies).context("building movies record batch")?;
    write_snapshot(path, &batch)
}

pub fn read_movies_snapshot(path: &Path) -> anyhow::Result<Vec<MovieRecord>> {
    let (_schema, batches) = read_snapshot(path)?;
    let mut movies = Vec::new();
    for batch in &batches {
        movies.extend(
            movies_from_batch(batch).with_context(|| format!("decoding {}", path.display()))?,
        );
    }
    Ok(movies)
}

pub fn write_credits_snapshot(path: &Path, credits: &[CreditRecord]) -> anyhow::Result<SnapshotArtifact> {
    let batch = credits_to_batch(credits).context("building credits record batch")?;
    write_snapshot(path, &batch)
}

pub fn read_credits_snapshot(path: &Path) -> anyhow::Result<Vec<CreditRecord>> {
    let (_schema, batches) = read_snapshot(path)?;
    let mut credits = Vec::new();
    for batch in &batches {
        credits.extend(
            credits_from_batch(batch).with_context(|| format!("decoding {}", path.display()))?,
        );
    }
    Ok(credits)
}

pub fn write_merged_snapshot(path: &Path, rows: &[StoredMovieRow]) -> anyhow::Result<SnapshotArtifact> {
    let batch = stored_rows_to_batch(rows).context("building merged record batch")?;
    write_snapshot(path, &batch)
}

/// Read the merged snapshot, back-filling any stored column it lacks.
pub fn read_merged_snapshot(path: &Path) -> anyhow::Result<Vec<StoredMovieRow>> {
    let (_schema, batches) = read_snapshot(path)?;
    let mut rows = Vec::new();
    for batch in &batches {
        let (batch, backfilled) = reconcile_stored_columns(batch)
            .with_context(|| format!("reconciling columns of {}", path.display()))?;
        if !backfilled.is_empty() {
            warn!(path = %path.display(), columns = ?backfilled, "back-filled missing columns with null");
        }
        rows.extend(
            stored_rows_from_batch(&batch).with_context(|| format!("decoding {}", path.display()))?,
        );
    }
    Ok(rows)
}

/// Remove the Parquet snapshots under bronze/ and silver/. Missing files and
/// directories are not errors. Returns the removed paths, sorted.
pub async fn cleanup_intermediate(layout: &DataLayout) -> anyhow::Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for dir in [layout.bronze_dir(), layout.silver_dir()] {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err).with_context(|| format!("listing {}", dir.display())),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", dir.display()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("parquet") {
                continue;
            }
            match fs::remove_file(&path).await {
                Ok(()) => removed.push(path),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err).with_context(|| format!("removing {}", path.display())),
            }
        }
    }
    removed.sort();
    info!(removed = removed.len(), "removed intermediate snapshots");
    Ok(removed)
}
