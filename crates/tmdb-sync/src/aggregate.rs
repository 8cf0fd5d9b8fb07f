//! Genre explode -> support filter -> group -> rank -> top-N report.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use tmdb_core::{GenreAggregateRow, ReportSourceRow, REPORT_COLUMNS, REPORT_TOP_N, SUPPORT_THRESHOLD};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Default)]
struct GenreAccumulator {
    rows: u64,
    vote_sum: f64,
    votes: u64,
}

/// One exploded `(genre, vote_average, vote_count)` row per non-empty genre token.
fn explode(rows: &[ReportSourceRow]) -> impl Iterator<Item = (&str, Option<f64>, Option<f64>)> + '_ {
    rows.iter().flat_map(|row| {
        row.genres
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(move |token| (token, row.vote_average, row.vote_count))
    })
}

/// Rank genres by mean `vote_average`, counting only exploded rows whose
/// `vote_count` meets the support threshold. Null means sort last; equal
/// means fall back to the genre name.
pub fn aggregate_genres(rows: &[ReportSourceRow]) -> Vec<GenreAggregateRow> {
    let mut groups: BTreeMap<&str, GenreAccumulator> = BTreeMap::new();
    for (genre, vote_average, vote_count) in explode(rows) {
        if !vote_count.is_some_and(|count| count >= SUPPORT_THRESHOLD) {
            continue;
        }
        let acc = groups.entry(genre).or_default();
        acc.rows += 1;
        if let Some(vote) = vote_average {
            acc.vote_sum += vote;
            acc.votes += 1;
        }
    }

    let mut ranked = groups
        .into_iter()
        .map(|(genre, acc)| GenreAggregateRow {
            genre: genre.to_string(),
            n_movies: acc.rows,
            avg_vote: (acc.votes > 0).then(|| acc.vote_sum / acc.votes as f64),
        })
        .collect::<Vec<_>>();
    ranked.sort_by(|a, b| match (a.avg_vote, b.avg_vote) {
        (Some(x), Some(y)) => y.total_cmp(&x).then_with(|| a.genre.cmp(&b.genre)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.genre.cmp(&b.genre),
    });
    ranked.truncate(REPORT_TOP_N);
    ranked
}

/// Whole numbers keep one fractional digit (`8.0`); everything else uses the
/// shortest round-trip form.
pub fn format_vote(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 {
        format!("{value:.1}")
    } else {
        format!("{value}")
    }
}

pub fn render_report(rows: &[GenreAggregateRow]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(REPORT_COLUMNS).context("writing report header")?;
    for row in rows {
        writer
            .write_record([
                row.genre.clone(),
                row.n_movies.to_string(),
                row.avg_vote.map(format_vote).unwrap_or_default(),
            ])
            .with_context(|| format!("writing report row for {}", row.genre))?;
    }
    writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("flushing report: {err}"))
}

/// Write the report through a temp file and rename, header-only when empty.
pub fn write_report(path: &Path, rows: &[GenreAggregateRow]) -> Result<()> {
    let bytes = render_report(rows)?;
    let parent = path
        .parent()
        .with_context(|| format!("report path {} has no parent", path.display()))?;
    std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    let temp_path = parent.join(format!(".{}.report.tmp", Uuid::new_v4()));
    std::fs::write(&temp_path, &bytes)
        .with_context(|| format!("writing temp report {}", temp_path.display()))?;
    if let Err(err) = std::fs::rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(err).with_context(|| format!("renaming report into {}", path.display()));
    }
    info!(path = %path.display(), rows = rows.len(), "genre report written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(genres: Option<&str>, vote_average: Option<f64>, vote_count: Option<f64>) -> ReportSourceRow {
        ReportSourceRow {
            id: None,
            title: None,
            vote_average,
            vote_count,
            genres: genres.map(str::to_string),
        }
    }

    #[test]
    fn explodes_trims_and_averages() {
        let rows = vec![
            source(Some("Drama, Comedy"), Some(8.0), Some(100.0)),
            source(Some(" Drama ,, "), Some(6.0), Some(60.0)),
            source(None, Some(9.9), Some(1000.0)),
        ];
        let report = aggregate_genres(&rows);
        assert_eq!(
            report,
            vec![
                GenreAggregateRow { genre: "Comedy".into(), n_movies: 1, avg_vote: Some(8.0) },
                GenreAggregateRow { genre: "Drama".into(), n_movies: 2, avg_vote: Some(7.0) },
            ]
        );
    }

    #[test]
    fn low_support_groups_are_excluded() {
        let rows = vec![
            source(Some("Documentary"), Some(9.5), Some(10.0)),
            source(Some("Documentary"), Some(9.0), Some(49.9)),
            source(Some("Western"), Some(6.0), Some(60.0)),
            source(Some("Foreign"), Some(7.0), None),
        ];
        let report = aggregate_genres(&rows);
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].genre, "Western");
    }

    #[test]
    fn threshold_is_inclusive() {
        let report = aggregate_genres(&[source(Some("Music"), Some(5.0), Some(50.0))]);
        assert_eq!(report[0].n_movies, 1);
    }

    #[test]
    fn ranks_descending_and_keeps_top_ten() {
        let rows = (0..12)
            .map(|i| source(Some(&format!("G{i:02}")), Some(i as f64), Some(100.0)))
            .collect::<Vec<_>>();
        let report = aggregate_genres(&rows);
        assert_eq!(report.len(), 10);
        assert_eq!(report[0].genre, "G11");
        assert_eq!(report[9].genre, "G02");
    }

    #[test]
    fn ties_and_null_means_order_deterministically() {
        let rows = vec![
            source(Some("Zeta"), Some(7.0), Some(100.0)),
            source(Some("Alpha"), Some(7.0), Some(100.0)),
            source(Some("Unrated"), None, Some(100.0)),
        ];
        let report = aggregate_genres(&rows);
        let genres = report.iter().map(|r| r.genre.as_str()).collect::<Vec<_>>();
        assert_eq!(genres, vec!["Alpha", "Zeta", "Unrated"]);
        assert_eq!(report[2].avg_vote, None);
        assert_eq!(report[2].n_movies, 1);
    }

    #[test]
    fn empty_input_renders_header_only() {
        assert!(aggregate_genres(&[]).is_empty());
        let bytes = render_report(&[]).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), "genre,n_movies,avg_vote\n");
    }

    #[test]
    fn report_formats_votes_like_the_source_data() {
        let rows = vec![
            GenreAggregateRow { genre: "Drama".into(), n_movies: 1, avg_vote: Some(8.0) },
            GenreAggregateRow { genre: "Sci, Fi".into(), n_movies: 3, avg_vote: Some(7.25) },
            GenreAggregateRow { genre: "Unrated".into(), n_movies: 2, avg_vote: None },
        ];
        let text = String::from_utf8(render_report(&rows).unwrap()).unwrap();
        assert_eq!(
            text,
            "genre,n_movies,avg_vote\nDrama,1,8.0\n\"Sci, Fi\",3,7.25\nUnrated,2,\n"
        );
    }
}
