//! Import pipeline: fetch the published TSV export and rebuild the store.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use num_format::{Locale, ToFormattedString};
use serde::Serialize;
use sheetdash_core::{header_width, DashboardRecord, RowParseError};
use sheetdash_storage::{
    insert_record, insert_sql, DashboardStore, FetchError, HttpClientConfig, HttpFetcher,
    SchemaError, StoreStats, BROWSER_USER_AGENT,
};
use sqlx::Connection;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "sheetdash-sync";

pub const DEFAULT_TSV_URL: &str = "https://docs.google.com/spreadsheets/d/e/2PACX-1vT5Qu2gRWD_hZX45QY1AyOK0Wl2QEKtR1yjMqQNWWUv7RuAPWwjLCsxsPSp7RcD0HU0tgeiXlwfRMB0/pub?gid=558973433&single=true&output=tsv";

const PROGRESS_EVERY: usize = 1000;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub db_path: PathBuf,
    pub tsv_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            db_path: std::env::var("SHEETDASH_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("dashboard.db")),
            tsv_url: std::env::var("SHEETDASH_TSV_URL")
                .or_else(|_| std::env::var("GOOGLE_SHEETS_TSV_URL"))
                .unwrap_or_else(|_| DEFAULT_TSV_URL.to_string()),
            user_agent: std::env::var("SHEETDASH_USER_AGENT")
                .unwrap_or_else(|_| BROWSER_USER_AGENT.to_string()),
            http_timeout_secs: std::env::var("SHEETDASH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }
}

/// Why a single data line was skipped.
#[derive(Debug, Error)]
pub enum RowError {
    #[error("parse: {0}")]
    Parse(#[from] RowParseError),
    #[error("insert: {0}")]
    Insert(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoadOutcome {
    pub header_columns: usize,
    pub inserted_rows: usize,
    pub skipped_rows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sync_timestamp: String,
    pub fetched_lines: usize,
    pub header_columns: usize,
    pub inserted_rows: usize,
    pub skipped_rows: usize,
    pub stats: StoreStats,
}

impl ImportSummary {
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

pub struct ImportPipeline {
    config: SyncConfig,
    store: DashboardStore,
    http: HttpFetcher,
}

impl ImportPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let store = DashboardStore::new(config.db_path.clone());
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        Ok(Self {
            config,
            store,
            http,
        })
    }

    pub fn store(&self) -> &DashboardStore {
        &self.store
    }

    pub async fn create_schema(&self) -> Result<(), SchemaError> {
        info!(path = %self.store.path().display(), "recreating dashboard table");
        self.store.create_schema().await
    }

    /// Fetch the export and split it into lines. Not retried.
    pub async fn fetch_source(&self, run_id: Uuid) -> Result<Vec<String>, FetchError> {
        let text = self.http.fetch_text(run_id, &self.config.tsv_url).await?;
        let lines = text.trim().lines().map(str::to_owned).collect::<Vec<_>>();
        info!(lines = lines.len(), "fetched TSV export");
        Ok(lines)
    }

    /// Insert every data line under one shared stamp.
    ///
    /// Row failures are logged and counted, never returned. Only failing to
    /// open, begin or commit the batch is an error.
    pub async fn parse_and_load(&self, lines: &[String], sync_timestamp: &str) -> Result<LoadOutcome> {
        let Some((header, rows)) = lines.split_first() else {
            info!("no data to insert");
            return Ok(LoadOutcome {
                header_columns: 0,
                inserted_rows: 0,
                skipped_rows: 0,
            });
        };
        let header_columns = header_width(header);
        info!(columns = header_columns, "parsed header");
        if rows.is_empty() {
            info!("no data to insert");
            return Ok(LoadOutcome {
                header_columns,
                inserted_rows: 0,
                skipped_rows: 0,
            });
        }

        let sql = insert_sql();
        let mut conn = self
            .store
            .connect()
            .await
            .with_context(|| format!("opening store {}", self.store.path().display()))?;
        let mut tx = conn.begin().await.context("starting import transaction")?;

        let mut inserted_rows = 0usize;
        let mut skipped_rows = 0usize;
        for (line_no, line) in rows.iter().enumerate().map(|(i, l)| (i + 1, l)) {
            let outcome: Result<(), RowError> = async {
                let record = DashboardRecord::parse_line(line, header_columns, sync_timestamp)?;
                insert_record(&mut *tx, &sql, &record).await?;
                Ok(())
            }
            .await;

            match outcome {
                Ok(()) => {
                    inserted_rows += 1;
                    if inserted_rows % PROGRESS_EVERY == 0 {
                        info!(inserted = inserted_rows, "inserted rows");
                    }
                }
                Err(err) => {
                    skipped_rows += 1;
                    warn!(line = line_no, error = %err, "skipping row");
                }
            }
        }

        tx.commit().await.context("committing import transaction")?;
        conn.close().await.context("closing store connection")?;
        info!(inserted = inserted_rows, skipped = skipped_rows, "load finished");

        Ok(LoadOutcome {
            header_columns,
            inserted_rows,
            skipped_rows,
        })
    }

    pub async fn summarize(&self) -> Result<StoreStats> {
        self.store.summarize().await
    }

    /// Full refresh: recreate the table, fetch, load, then report.
    pub async fn run_once(&self) -> Result<ImportSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("import", %run_id);
        async move {
            let started_at = Utc::now();
            info!(url = %self.config.tsv_url, "starting data sync");

            self.create_schema().await?;
            let lines = self
                .fetch_source(run_id)
                .await
                .with_context(|| format!("fetching {}", self.config.tsv_url))?;

            let sync_timestamp = new_sync_timestamp(Utc::now());
            let outcome = self.parse_and_load(&lines, &sync_timestamp).await?;
            let stats = self.summarize().await?;
            let finished_at = Utc::now();

            Ok(ImportSummary {
                run_id,
                started_at,
                finished_at,
                sync_timestamp,
                fetched_lines: lines.len(),
                header_columns: outcome.header_columns,
                inserted_rows: outcome.inserted_rows,
                skipped_rows: outcome.skipped_rows,
                stats,
            })
        }
        .instrument(span)
        .await
    }
}

/// ISO-8601 stamp shared by every row of one import.
pub fn new_sync_timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn render_stats_report(stats: &StoreStats) -> String {
    let mut lines = vec![
        "=== Database Statistics ===".to_string(),
        format!(
            "Total records: {}",
            stats.total_rows.to_formatted_string(&Locale::en)
        ),
        format!(
            "Unique projects: {}",
            stats.unique_projects.to_formatted_string(&Locale::en)
        ),
        format!("Unique install statuses: {}", stats.unique_statuses),
        String::new(),
        "Top install statuses:".to_string(),
    ];
    for entry in &stats.top_statuses {
        let count = entry.count.to_formatted_string(&Locale::en);
        lines.push(format!("  {}: {count}", entry.status));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;
    use sheetdash_storage::StatusCount;
    use tempfile::{tempdir, TempDir};
    use tokio::net::TcpListener;

    const WIDTH: usize = 57;

    fn tsv_line(cells: &[(usize, &str)]) -> String {
        let mut row = vec![String::new(); WIDTH];
        for (index, value) in cells {
            row[*index] = value.to_string();
        }
        row.join("\t")
    }

    fn header() -> String {
        (0..WIDTH).map(|i| format!("col{i}")).collect::<Vec<_>>().join("\t")
    }

    fn sample_document() -> String {
        [
            header(),
            tsv_line(&[(0, "SO-1"), (6, "P1"), (47, "done"), (48, "1,234.50"), (53, "3"), (54, "2025")]),
            tsv_line(&[(0, "SO-2"), (6, "P1"), (47, "pending"), (56, "B2\r")]),
            tsv_line(&[(0, "SO-3"), (6, "P2"), (47, "done"), (25, "Acme")]),
        ]
        .join("\r\n")
    }

    fn pipeline_for(dir: &TempDir, url: &str) -> ImportPipeline {
        ImportPipeline::new(SyncConfig {
            db_path: dir.path().join("dashboard.db"),
            tsv_url: url.to_string(),
            user_agent: BROWSER_USER_AGENT.to_string(),
            http_timeout_secs: 5,
        })
        .expect("pipeline")
    }

    async fn spawn_sheet_server(body: String) -> String {
        let app = Router::new()
            .route(
                "/sheet.tsv",
                get(move || {
                    let body = body.clone();
                    async move { body }
                }),
            )
            .route(
                "/broken.tsv",
                get(|| async { (axum::http::StatusCode::SERVICE_UNAVAILABLE, "down") }),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        format!("http://{addr}")
    }

    async fn distinct_stamps(pipeline: &ImportPipeline) -> Vec<String> {
        let mut conn = pipeline.store().connect().await.expect("connect");
        let stamps: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT sync_timestamp FROM dashboard_data")
                .fetch_all(&mut conn)
                .await
                .expect("stamps");
        conn.close().await.expect("close");
        stamps
    }

    #[tokio::test]
    async fn load_shares_one_stamp_and_skips_bad_rows() {
        let dir = tempdir().expect("tempdir");
        let pipeline = pipeline_for(&dir, "http://unused.invalid/");
        pipeline.create_schema().await.expect("schema");

        let lines = vec![
            header(),
            tsv_line(&[(0, "SO-1"), (6, "P1"), (53, "abc")]),
            "SO-2\t2024-01-01".to_string(),
            tsv_line(&[(0, "SO-3"), (54, "1e30")]),
            String::new(),
        ];
        let outcome = pipeline
            .parse_and_load(&lines, "2026-10-16T00:00:00.000000Z")
            .await
            .expect("load");

        assert_eq!(
            outcome,
            LoadOutcome {
                header_columns: WIDTH,
                inserted_rows: 3,
                skipped_rows: 1,
            }
        );
        assert_eq!(distinct_stamps(&pipeline).await, vec!["2026-10-16T00:00:00.000000Z"]);

        let mut conn = pipeline.store().connect().await.expect("connect");
        let (order_date, month): (String, Option<i64>) = sqlx::query_as(
            "SELECT order_date, sales_month FROM dashboard_data WHERE order_number = 'SO-2'",
        )
        .fetch_one(&mut conn)
        .await
        .expect("short row");
        assert_eq!(order_date, "2024-01-01");
        assert_eq!(month, None);
        conn.close().await.expect("close");
    }

    #[tokio::test]
    async fn rejected_insert_is_skipped_past_progress_milestone() {
        let dir = tempdir().expect("tempdir");
        let pipeline = pipeline_for(&dir, "http://unused.invalid/");
        pipeline.create_schema().await.expect("schema");

        let mut conn = pipeline.store().connect().await.expect("connect");
        sqlx::query(
            r#"
            CREATE TRIGGER reject_blocked_order BEFORE INSERT ON dashboard_data
            WHEN NEW.order_number = 'SO-BLOCKED'
            BEGIN SELECT RAISE(ABORT, 'order blocked'); END
            "#,
        )
        .execute(&mut conn)
        .await
        .expect("trigger");
        conn.close().await.expect("close");

        let mut lines = vec![header()];
        for i in 0..1200 {
            let order = format!("SO-{i:04}");
            lines.push(tsv_line(&[(0, order.as_str()), (6, "P1")]));
        }
        lines.insert(600, tsv_line(&[(0, "SO-BLOCKED"), (6, "P1")]));

        let outcome = pipeline
            .parse_and_load(&lines, "2026-10-16T00:00:00.000000Z")
            .await
            .expect("load");
        assert_eq!(
            outcome,
            LoadOutcome {
                header_columns: WIDTH,
                inserted_rows: 1200,
                skipped_rows: 1,
            }
        );

        let mut conn = pipeline.store().connect().await.expect("connect");
        let blocked: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM dashboard_data WHERE order_number = 'SO-BLOCKED'",
        )
        .fetch_one(&mut conn)
        .await
        .expect("count");
        assert_eq!(blocked, 0);
        conn.close().await.expect("close");
        assert_eq!(pipeline.summarize().await.expect("stats").total_rows, 1200);
    }

    #[tokio::test]
    async fn header_only_document_loads_nothing() {
        let dir = tempdir().expect("tempdir");
        let pipeline = pipeline_for(&dir, "http://unused.invalid/");
        pipeline.create_schema().await.expect("schema");

        let outcome = pipeline
            .parse_and_load(&[header()], "ts")
            .await
            .expect("load");
        assert_eq!(outcome.inserted_rows, 0);
        assert_eq!(outcome.header_columns, WIDTH);
        assert_eq!(pipeline.summarize().await.expect("stats").total_rows, 0);
    }

    #[tokio::test]
    async fn rerun_replaces_previous_import() {
        let base = spawn_sheet_server(sample_document()).await;
        let dir = tempdir().expect("tempdir");
        let pipeline = pipeline_for(&dir, &format!("{base}/sheet.tsv"));

        let first = pipeline.run_once().await.expect("first run");
        assert_eq!(first.fetched_lines, 4);
        assert_eq!(first.inserted_rows, 3);
        assert_eq!(first.header_columns, WIDTH);
        assert_eq!(first.stats.total_rows, 3);
        assert_eq!(first.stats.unique_projects, 2);
        assert_eq!(
            first.stats.top_statuses[0],
            StatusCount {
                status: "done".into(),
                count: 2
            }
        );

        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = pipeline.run_once().await.expect("second run");
        assert_eq!(second.stats.total_rows, 3);
        assert!(second.sync_timestamp > first.sync_timestamp);
        assert_eq!(distinct_stamps(&pipeline).await, vec![second.sync_timestamp.clone()]);

        let mut conn = pipeline.store().connect().await.expect("connect");
        let (cost, floor): (Option<f64>, String) = sqlx::query_as(
            "SELECT cost_total_ex_vat, floor_level FROM dashboard_data WHERE order_number = 'SO-1'",
        )
        .fetch_one(&mut conn)
        .await
        .expect("row");
        assert_eq!(cost, Some(1234.5));
        assert_eq!(floor, "");
        let floor: String = sqlx::query_scalar(
            "SELECT floor_level FROM dashboard_data WHERE order_number = 'SO-2'",
        )
        .fetch_one(&mut conn)
        .await
        .expect("row");
        assert_eq!(floor, "B2");
        conn.close().await.expect("close");
    }

    #[tokio::test]
    async fn fetch_failure_aborts_run() {
        let base = spawn_sheet_server(sample_document()).await;
        let dir = tempdir().expect("tempdir");
        let pipeline = pipeline_for(&dir, &format!("{base}/broken.tsv"));

        let err = pipeline.run_once().await.unwrap_err();
        let fetch = err.downcast_ref::<FetchError>().expect("fetch error");
        assert!(matches!(fetch, FetchError::HttpStatus { status: 503, .. }));
    }

    #[test]
    fn sync_timestamp_is_rfc3339_with_micros() {
        let now = DateTime::parse_from_rfc3339("2026-10-16T08:30:00.5Z")
            .expect("ts")
            .with_timezone(&Utc);
        assert_eq!(new_sync_timestamp(now), "2026-10-16T08:30:00.500000Z");
    }

    #[test]
    fn stats_report_groups_thousands() {
        let report = render_stats_report(&StoreStats {
            total_rows: 1_234_567,
            unique_projects: 42,
            unique_statuses: 2,
            top_statuses: vec![
                StatusCount {
                    status: "ติดตั้งแล้ว".into(),
                    count: 1_000,
                },
                StatusCount {
                    status: "pending".into(),
                    count: 7,
                },
            ],
        });
        assert!(report.contains("Total records: 1,234,567"));
        assert!(report.contains("Unique projects: 42"));
        assert!(report.contains("  ติดตั้งแล้ว: 1,000"));
        assert!(report.contains("  pending: 7"));
    }
}
