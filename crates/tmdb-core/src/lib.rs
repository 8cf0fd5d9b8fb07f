//! Core domain model for the TMDB batch pipeline.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Schema and table that hold the merged movie rows.
pub const STORE_SCHEMA: &str = "tmdb";
pub const STORE_TABLE: &str = "movies_final";

/// Minimum `vote_count` an exploded row needs to contribute to a genre aggregate.
pub const SUPPORT_THRESHOLD: f64 = 50.0;

/// Number of genre groups kept in the ranked report.
pub const REPORT_TOP_N: usize = 10;

/// Number of leading cast names kept in `cast_top3`.
pub const CAST_TOP_N: usize = 3;

/// Separator used when flattening tagged-record names.
pub const NAME_SEPARATOR: &str = ", ";

/// Fixed column set of the persisted movie table, in storage order.
pub const STORED_COLUMNS: [&str; 9] = [
    "id",
    "title",
    "release_date",
    "vote_average",
    "vote_count",
    "popularity",
    "runtime",
    "genres",
    "cast_top3",
];

/// Header of the genre report.
pub const REPORT_COLUMNS: [&str; 3] = ["genre", "n_movies", "avg_vote"];

/// Typed staging row for the movies dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovieRecord {
    pub id: i64,
    pub title: Option<String>,
    pub release_date: Option<NaiveDate>,
    pub vote_average: Option<f64>,
    pub vote_count: Option<f64>,
    pub popularity: Option<f64>,
    pub runtime: Option<f64>,
    pub genres_raw: Option<String>,
}

/// Typed staging row for the credits dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditRecord {
    pub movie_id: i64,
    pub cast_raw: Option<String>,
}

/// One mapping element of a semi-structured list field.
///
/// Only `name` matters downstream; the remaining attributes are kept so the
/// record round-trips, but nothing reads them.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaggedRecord {
    pub attributes: Map<String, JsonValue>,
}

impl TaggedRecord {
    pub fn new(attributes: Map<String, JsonValue>) -> Self {
        Self { attributes }
    }

    /// Non-empty string `name`, if the record carries one.
    pub fn name(&self) -> Option<&str> {
        match self.attributes.get("name") {
            Some(JsonValue::String(name)) if !name.is_empty() => Some(name.as_str()),
            _ => None,
        }
    }
}

/// Result of parsing a semi-structured field. Parsing never fails; anything
/// malformed collapses to `Empty`.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ParsedField {
    #[default]
    Empty,
    List(Vec<TaggedRecord>),
}

impl ParsedField {
    pub fn records(&self) -> &[TaggedRecord] {
        match self {
            ParsedField::Empty => &[],
            ParsedField::List(records) => records,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }
}

/// Movie row with its genre feature substituted for the raw genre field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovieWithGenres {
    pub id: i64,
    pub title: Option<String>,
    pub release_date: Option<NaiveDate>,
    pub vote_average: Option<f64>,
    pub vote_count: Option<f64>,
    pub popularity: Option<f64>,
    pub runtime: Option<f64>,
    pub genres: String,
}

/// Credit row reduced to its join key and cast feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditCast {
    pub movie_id: i64,
    pub cast_top3: String,
}

/// Denormalized output of the merge stage and the persisted row shape.
///
/// Every column is nullable on the storage side: rows read back from a
/// snapshot may have had columns back-filled with null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMovieRow {
    pub id: Option<i64>,
    pub title: Option<String>,
    pub release_date: Option<NaiveDate>,
    pub vote_average: Option<f64>,
    pub vote_count: Option<f64>,
    pub popularity: Option<f64>,
    pub runtime: Option<f64>,
    pub genres: Option<String>,
    pub cast_top3: Option<String>,
}

/// Merge output is already schema-complete, so it shares the stored shape.
pub type MergedRecord = StoredMovieRow;

/// Columns the aggregator reads back from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSourceRow {
    pub id: Option<i64>,
    pub title: Option<String>,
    pub vote_average: Option<f64>,
    pub vote_count: Option<f64>,
    pub genres: Option<String>,
}

impl From<&StoredMovieRow> for ReportSourceRow {
    fn from(row: &StoredMovieRow) -> Self {
        Self {
            id: row.id,
            title: row.title.clone(),
            vote_average: row.vote_average,
            vote_count: row.vote_count,
            genres: row.genres.clone(),
        }
    }
}

/// One ranked line of the genre report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenreAggregateRow {
    pub genre: String,
    pub n_movies: u64,
    pub avg_vote: Option<f64>,
}
