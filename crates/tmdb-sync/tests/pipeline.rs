use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tmdb_core::{ReportSourceRow, StoredMovieRow};
use tmdb_sync::{
    bronze_credits, bronze_movies, MemoryMovieStore, MovieStore, Pipeline, PipelineConfig,
};
use tempfile::{tempdir, TempDir};

const MOVIES_HEADER: &str = "id,title,release_date,vote_average,vote_count,popularity,runtime,genres\n";
const CREDITS_HEADER: &str = "movie_id,title,cast,crew\n";

fn config_for(root: &Path) -> PipelineConfig {
    PipelineConfig {
        database_url: "postgres://unused".into(),
        data_dir: root.to_path_buf(),
        scheduler_enabled: false,
        sync_cron: "0 0 0 * * *".into(),
        load_chunk_size: 2,
    }
}

fn seed_raw(movies_rows: &str, credits_rows: &str) -> TempDir {
    let dir = tempdir().expect("tempdir");
    let raw = dir.path().join("raw");
    std::fs::create_dir_all(&raw).unwrap();
    std::fs::write(raw.join("tmdb_5000_movies.csv"), format!("{MOVIES_HEADER}{movies_rows}")).unwrap();
    std::fs::write(raw.join("tmdb_5000_credits.csv"), format!("{CREDITS_HEADER}{credits_rows}")).unwrap();
    dir
}

fn report_text(root: &Path) -> String {
    std::fs::read_to_string(root.join("outputs/top_genres_by_rating.csv")).expect("report")
}

#[tokio::test]
async fn single_movie_flows_through_to_report() {
    let dir = seed_raw(
        "1,A,2020-01-01,8.0,100,1.5,120,\"[{'name':'Drama'}]\"\n",
        "1,A,\"[{'name':'X'},{'name':'Y'}]\",[]\n",
    );
    let store = Arc::new(MemoryMovieStore::new());
    let pipeline = Pipeline::new(config_for(dir.path()), store.clone());

    let summary = pipeline.run_once().await.expect("run");

    let rows = store.rows().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, Some(1));
    assert_eq!(rows[0].genres.as_deref(), Some("Drama"));
    assert_eq!(rows[0].cast_top3.as_deref(), Some("X, Y"));
    assert_eq!(report_text(dir.path()), "genre,n_movies,avg_vote\nDrama,1,8.0\n");
    assert_eq!(summary.loaded_rows, 1);
    assert_eq!(summary.report_rows, 1);

    let mut expected_removed = vec![
        dir.path().join("bronze/credits.parquet"),
        dir.path().join("bronze/movies.parquet"),
        dir.path().join("silver/movies_merged.parquet"),
    ];
    expected_removed.sort();
    assert_eq!(summary.removed_artifacts, expected_removed);
}

#[tokio::test]
async fn non_numeric_movie_id_never_reaches_store_or_report() {
    let dir = seed_raw(
        "abc,Bad,2020-01-01,9.9,500,1,90,\"[{'name':'Horror'}]\"\n\
         2,Good,2020-01-01,7.0,80,1,90,\"[{'name':'Comedy'}]\"\n",
        "",
    );
    let store = Arc::new(MemoryMovieStore::new());
    let summary = Pipeline::new(config_for(dir.path()), store.clone())
        .run_once()
        .await
        .expect("run");

    assert_eq!(summary.movies_dropped, 1);
    assert_eq!(summary.unmatched_movies, 1);
    let rows = store.rows().await;
    assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![Some(2)]);
    assert_eq!(rows[0].cast_top3, None);
    assert_eq!(report_text(dir.path()), "genre,n_movies,avg_vote\nComedy,1,7.0\n");
}

#[tokio::test]
async fn below_threshold_genre_is_suppressed() {
    let dir = seed_raw(
        "1,Quiet,2020-01-01,9.0,10,1,90,\"[{'name':'Documentary'}]\"\n\
         2,Loud,2020-01-01,6.5,60,1,90,\"[{'name':'Action'}]\"\n",
        "1,Quiet,[],[]\n2,Loud,[],[]\n",
    );
    let store = Arc::new(MemoryMovieStore::new());
    Pipeline::new(config_for(dir.path()), store)
        .run_once()
        .await
        .expect("run");
    assert_eq!(report_text(dir.path()), "genre,n_movies,avg_vote\nAction,1,6.5\n");
}

#[tokio::test]
async fn empty_inputs_produce_header_only_report() {
    let dir = seed_raw("", "");
    let store = Arc::new(MemoryMovieStore::new());
    let summary = Pipeline::new(config_for(dir.path()), store.clone())
        .run_once()
        .await
        .expect("run");
    assert!(store.rows().await.is_empty());
    assert_eq!(summary.report_rows, 0);
    assert_eq!(report_text(dir.path()), "genre,n_movies,avg_vote\n");
}

#[tokio::test]
async fn rerun_replaces_store_and_reproduces_report() {
    let dir = seed_raw(
        "1,A,2020-01-01,8.0,100,1,90,\"[{'name':'Drama'},{'name':'Crime'}]\"\n\
         2,B,2020-01-01,6.0,100,1,90,\"[{'name':'Drama'}]\"\n\
         3,C,,7.5,55,,,\n",
        "1,A,\"[{'name':'P'},{'name':'Q'},{'name':'R'},{'name':'S'}]\",[]\n",
    );
    let store = Arc::new(MemoryMovieStore::new());
    let pipeline = Pipeline::new(config_for(dir.path()), store.clone());

    pipeline.run_once().await.expect("first run");
    let first_rows = store.rows().await;
    let first_report = report_text(dir.path());

    pipeline.run_once().await.expect("second run");
    assert_eq!(store.rows().await, first_rows);
    assert_eq!(report_text(dir.path()), first_report);
    assert_eq!(first_rows.len(), 3);
    assert_eq!(first_rows[0].cast_top3.as_deref(), Some("P, Q, R"));
    assert_eq!(first_rows[2].genres.as_deref(), Some(""));
    assert_eq!(
        first_report,
        "genre,n_movies,avg_vote\nCrime,1,8.0\nDrama,2,7.0\n"
    );
}

#[test]
fn bronze_stages_are_byte_for_byte_repeatable() {
    let dir = seed_raw(
        "1,A,2020-01-01,8.0,100,1.5,120,\"[{'name':'Drama'}]\"\nx,B,,,,,,\n",
        "1,A,\"[{'name':'X'}]\",[]\n",
    );
    let raw: PathBuf = dir.path().join("raw");
    let out = dir.path().join("bronze");

    let first = bronze_movies(&raw.join("tmdb_5000_movies.csv"), &out.join("a.parquet")).unwrap();
    let second = bronze_movies(&raw.join("tmdb_5000_movies.csv"), &out.join("b.parquet")).unwrap();
    assert_eq!(first.artifact.content_hash, second.artifact.content_hash);
    assert_eq!(first.stats.rows_kept, 1);

    let credits = bronze_credits(&raw.join("tmdb_5000_credits.csv"), &out.join("c.parquet")).unwrap();
    assert_eq!(credits.artifact.rows, 1);
}

#[tokio::test]
async fn missing_raw_input_is_fatal_and_leaves_store_untouched() {
    let dir = tempdir().expect("tempdir");
    let previous = vec![StoredMovieRow {
        id: Some(42),
        title: Some("Kept".into()),
        release_date: None,
        vote_average: None,
        vote_count: None,
        popularity: None,
        runtime: None,
        genres: None,
        cast_top3: None,
    }];
    let store = Arc::new(MemoryMovieStore::with_rows(previous.clone()));
    let err = Pipeline::new(config_for(dir.path()), store.clone())
        .run_once()
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("bronze movies stage"));
    assert_eq!(store.rows().await, previous);
}

struct ReportFailingStore {
    inner: MemoryMovieStore,
}

#[async_trait]
impl MovieStore for ReportFailingStore {
    async fn ensure_schema(&self) -> Result<()> {
        self.inner.ensure_schema().await
    }

    async fn replace_all(&self, rows: &[StoredMovieRow], chunk_size: usize) -> Result<u64> {
        self.inner.replace_all(rows, chunk_size).await
    }

    async fn fetch_report_rows(&self) -> Result<Vec<ReportSourceRow>> {
        bail!("report query failed")
    }
}

#[tokio::test]
async fn report_failure_keeps_store_and_skips_cleanup() {
    let dir = seed_raw(
        "1,A,2020-01-01,8.0,100,1,90,\"[{'name':'Drama'}]\"\n",
        "1,A,[],[]\n",
    );
    let store = Arc::new(ReportFailingStore {
        inner: MemoryMovieStore::new(),
    });
    let err = Pipeline::new(config_for(dir.path()), store.clone())
        .run_once()
        .await
        .unwrap_err();

    assert!(format!("{err:#}").contains("analyze stage"));
    assert_eq!(store.inner.rows().await.len(), 1);
    assert!(dir.path().join("silver/movies_merged.parquet").exists());
    assert!(dir.path().join("bronze/movies.parquet").exists());
}
