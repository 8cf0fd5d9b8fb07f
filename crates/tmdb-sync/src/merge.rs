//! Left-outer join of movies and credits on the movie identifier.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use tmdb_core::{CreditCast, CreditRecord, MergedRecord, MovieRecord, MovieWithGenres};
use tmdb_ingest::{credit_cast, movie_with_genres};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub movies: usize,
    pub matched: usize,
    pub unmatched: usize,
    pub duplicate_credits: usize,
}

/// Join every movie to at most one credit row. When several credit rows
/// share a `movie_id`, the first one in input order wins and the rest are
/// counted in [`MergeStats::duplicate_credits`]. Movie rows are never dropped.
pub fn merge(movies: &[MovieWithGenres], credits: &[CreditCast]) -> (Vec<MergedRecord>, MergeStats) {
    let mut cast_by_id: HashMap<i64, &str> = HashMap::with_capacity(credits.len());
    let mut stats = MergeStats {
        movies: movies.len(),
        ..MergeStats::default()
    };
    for credit in credits {
        match cast_by_id.entry(credit.movie_id) {
            Entry::Vacant(slot) => {
                slot.insert(credit.cast_top3.as_str());
            }
            Entry::Occupied(_) => stats.duplicate_credits += 1,
        }
    }
    if stats.duplicate_credits > 0 {
        warn!(
            duplicate_credits = stats.duplicate_credits,
            "credits share a movie_id; keeping the first row per movie"
        );
    }

    let merged = movies
        .iter()
        .map(|movie| {
            let cast_top3 = cast_by_id.get(&movie.id).map(|cast| cast.to_string());
            if cast_top3.is_some() {
                stats.matched += 1;
            } else {
                stats.unmatched += 1;
            }
            MergedRecord {
                id: Some(movie.id),
                title: movie.title.clone(),
                release_date: movie.release_date,
                vote_average: movie.vote_average,
                vote_count: movie.vote_count,
                popularity: movie.popularity,
                runtime: movie.runtime,
                genres: Some(movie.genres.clone()),
                cast_top3,
            }
        })
        .collect();
    (merged, stats)
}

/// Derive the genre and cast features from the staging records, then merge.
pub fn transform(movies: &[MovieRecord], credits: &[CreditRecord]) -> (Vec<MergedRecord>, MergeStats) {
    let movies = movies.iter().map(movie_with_genres).collect::<Vec<_>>();
    let credits = credits.iter().map(credit_cast).collect::<Vec<_>>();
    let (merged, stats) = merge(&movies, &credits);
    info!(
        movies = stats.movies,
        matched = stats.matched,
        unmatched = stats.unmatched,
        "merged movies with credits"
    );
    (merged, stats)
}
