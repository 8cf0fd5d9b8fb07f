//! Raw CSV ingestion, record normalization and semi-structured feature derivation.

pub mod literal;

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tmdb_core::{
    CreditCast, CreditRecord, MovieRecord, MovieWithGenres, ParsedField, TaggedRecord, CAST_TOP_N,
    NAME_SEPARATOR,
};
use tracing::{info, warn};

pub use literal::{parse_literal, parse_literal_list, LiteralError};

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"];
const DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dataset {
    Movies,
    Credits,
}

impl Dataset {
    pub fn id_column(self) -> &'static str {
        match self {
            Dataset::Movies => "id",
            Dataset::Credits => "movie_id",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Dataset::Movies => "movies",
            Dataset::Credits => "credits",
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("{dataset} input is missing required column {column:?}")]
    MissingColumn {
        dataset: &'static str,
        column: &'static str,
    },
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

/// Raw movies row as it appears in the CSV; every cell is untyped text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RawMovieRow {
    pub id: Option<String>,
    pub title: Option<String>,
    pub release_date: Option<String>,
    pub vote_average: Option<String>,
    pub vote_count: Option<String>,
    pub popularity: Option<String>,
    pub runtime: Option<String>,
    pub genres: Option<String>,
}

/// Raw credits row as it appears in the CSV.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RawCreditRow {
    pub movie_id: Option<String>,
    pub cast: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizeStats {
    pub rows_read: usize,
    pub rows_kept: usize,
    pub rows_dropped: usize,
}

pub fn read_movies_csv(path: impl AsRef<Path>) -> Result<Vec<RawMovieRow>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    read_movies(file).with_context(|| format!("reading movies from {}", path.display()))
}

pub fn read_credits_csv(path: impl AsRef<Path>) -> Result<Vec<RawCreditRow>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    read_credits(file).with_context(|| format!("reading credits from {}", path.display()))
}

pub fn read_movies<R: Read>(reader: R) -> Result<Vec<RawMovieRow>, IngestError> {
    read_rows(reader, Dataset::Movies)
}

pub fn read_credits<R: Read>(reader: R) -> Result<Vec<RawCreditRow>, IngestError> {
    read_rows(reader, Dataset::Credits)
}

fn read_rows<R, T>(reader: R, dataset: Dataset) -> Result<Vec<T>, IngestError>
where
    R: Read,
    T: for<'de> Deserialize<'de>,
{
    let mut rdr = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    let id_column = dataset.id_column();
    if !rdr.headers()?.iter().any(|h| h.trim() == id_column) {
        return Err(IngestError::MissingColumn {
            dataset: dataset.label(),
            column: id_column,
        });
    }

    Ok(rdr
        .deserialize::<T>()
        .filter_map(|row| {
            row.map_err(|err| warn!(dataset = dataset.label(), "skipping malformed CSV line: {err}"))
                .ok()
        })
        .collect())
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Numeric identifier coercion. Integral text parses directly; other finite
/// numerics are truncated toward zero like an int64 cast.
pub fn coerce_id(value: Option<&str>) -> Option<i64> {
    let text = non_blank(value)?;
    if let Ok(id) = text.parse::<i64>() {
        return Some(id);
    }
    let float = text.parse::<f64>().ok().filter(|v| v.is_finite())?.trunc();
    if float < i64::MIN as f64 || float >= i64::MAX as f64 {
        return None;
    }
    Some(float as i64)
}

pub fn coerce_f64(value: Option<&str>) -> Option<f64> {
    non_blank(value)?.parse::<f64>().ok().filter(|v| !v.is_nan())
}

pub fn coerce_date(value: Option<&str>) -> Option<NaiveDate> {
    let text = non_blank(value)?;
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
                .map(|dt| dt.date())
        })
        .or_else(|| DateTime::parse_from_rfc3339(text).ok().map(|dt| dt.date_naive()))
}

fn text_or_none(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

pub fn normalize_movies(rows: Vec<RawMovieRow>) -> (Vec<MovieRecord>, NormalizeStats) {
    let rows_read = rows.len();
    let movies = rows
        .into_iter()
        .filter_map(|row| {
            let id = coerce_id(row.id.as_deref())?;
            Some(MovieRecord {
                id,
                release_date: coerce_date(row.release_date.as_deref()),
                vote_average: coerce_f64(row.vote_average.as_deref()),
                vote_count: coerce_f64(row.vote_count.as_deref()),
                popularity: coerce_f64(row.popularity.as_deref()),
                runtime: coerce_f64(row.runtime.as_deref()),
                title: text_or_none(row.title),
                genres_raw: text_or_none(row.genres),
            })
        })
        .collect::<Vec<_>>();
    let stats = stats_for(Dataset::Movies, rows_read, movies.len());
    (movies, stats)
}

pub fn normalize_credits(rows: Vec<RawCreditRow>) -> (Vec<CreditRecord>, NormalizeStats) {
    let rows_read = rows.len();
    let credits = rows
        .into_iter()
        .filter_map(|row| {
            Some(CreditRecord {
                movie_id: coerce_id(row.movie_id.as_deref())?,
                cast_raw: text_or_none(row.cast),
            })
        })
        .collect::<Vec<_>>();
    let stats = stats_for(Dataset::Credits, rows_read, credits.len());
    (credits, stats)
}

fn stats_for(dataset: Dataset, rows_read: usize, rows_kept: usize) -> NormalizeStats {
    let stats = NormalizeStats {
        rows_read,
        rows_kept,
        rows_dropped: rows_read - rows_kept,
    };
    info!(
        dataset = dataset.label(),
        rows_read = stats.rows_read,
        rows_kept = stats.rows_kept,
        rows_dropped = stats.rows_dropped,
        "normalized dataset"
    );
    stats
}

/// A semi-structured cell before parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum RawField<'a> {
    Missing,
    Text(&'a str),
    Structured(Vec<JsonValue>),
}

impl<'a> From<Option<&'a str>> for RawField<'a> {
    fn from(value: Option<&'a str>) -> Self {
        value.map_or(RawField::Missing, RawField::Text)
    }
}

/// Parse a list of tagged records. Never fails: missing input, malformed
/// text and non-list values all yield [`ParsedField::Empty`], and non-mapping
/// elements are dropped.
pub fn parse_tagged_list(field: RawField<'_>) -> ParsedField {
    let items = match field {
        RawField::Missing => return ParsedField::Empty,
        RawField::Structured(items) => items,
        RawField::Text(text) => match parse_literal_list(text) {
            Ok(items) => items,
            Err(_) => return ParsedField::Empty,
        },
    };
    let records = items
        .into_iter()
        .filter_map(|item| match item {
            JsonValue::Object(map) => Some(TaggedRecord::new(map)),
            _ => None,
        })
        .collect();
    ParsedField::List(records)
}

fn joined_names(parsed: &ParsedField, limit: Option<usize>) -> String {
    let names = parsed.records().iter().filter_map(TaggedRecord::name);
    let names: Vec<&str> = match limit {
        Some(limit) => names.take(limit).collect(),
        None => names.collect(),
    };
    names.join(NAME_SEPARATOR)
}

/// All valid names in order; `""` when there are none.
pub fn genre_names(parsed: &ParsedField) -> String {
    joined_names(parsed, None)
}

/// First three valid names, filter-then-take.
pub fn cast_top3(parsed: &ParsedField) -> String {
    joined_names(parsed, Some(CAST_TOP_N))
}

pub fn movie_with_genres(movie: &MovieRecord) -> MovieWithGenres {
    let parsed = parse_tagged_list(movie.genres_raw.as_deref().into());
    MovieWithGenres {
        id: movie.id,
        title: movie.title.clone(),
        release_date: movie.release_date,
        vote_average: movie.vote_average,
        vote_count: movie.vote_count,
        popularity: movie.popularity,
        runtime: movie.runtime,
        genres: genre_names(&parsed),
    }
}

pub fn credit_cast(credit: &CreditRecord) -> CreditCast {
    let parsed = parse_tagged_list(credit.cast_raw.as_deref().into());
    CreditCast {
        movie_id: credit.movie_id,
        cast_top3: cast_top3(&parsed),
    }
}
