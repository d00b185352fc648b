//! SQLite record store + HTTP fetch utilities for sheetdash.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use sheetdash_core::{DashboardRecord, FieldValue, COLUMN_MAP};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::{Connection, Row, SqliteConnection};
use thiserror::Error;
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "sheetdash-storage";

pub const TABLE_NAME: &str = "dashboard_data";

/// Some publishing endpoints refuse requests without a browser user agent.
pub const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("opening store {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("recreating table dashboard_data: {0}")]
    Ddl(#[source] sqlx::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusCount {
    pub status: String,
    pub count: i64,
}

/// Post-load statistics printed after an import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total_rows: i64,
    pub unique_projects: i64,
    pub unique_statuses: i64,
    pub top_statuses: Vec<StatusCount>,
}

/// File-backed SQLite store holding the single dashboard table.
#[derive(Debug, Clone)]
pub struct DashboardStore {
    path: PathBuf,
}

impl DashboardStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read-write connection, creating the file when missing.
    pub async fn connect(&self) -> Result<SqliteConnection, sqlx::Error> {
        let options = SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete);
        SqliteConnection::connect_with(&options).await
    }

    /// Read-only connection; fails when the store file does not exist.
    pub async fn connect_read_only(&self) -> Result<SqliteConnection, sqlx::Error> {
        let options = SqliteConnectOptions::new()
            .filename(&self.path)
            .read_only(true);
        SqliteConnection::connect_with(&options).await
    }

    /// Drop and recreate the dashboard table. Destroys any previous import.
    pub async fn create_schema(&self) -> Result<(), SchemaError> {
        let mut conn = self.connect().await.map_err(|source| SchemaError::Open {
            path: self.path.display().to_string(),
            source,
        })?;

        let drop = format!("DROP TABLE IF EXISTS {TABLE_NAME}");
        sqlx::query(&drop)
            .execute(&mut conn)
            .await
            .map_err(SchemaError::Ddl)?;
        sqlx::query(&create_table_sql())
            .execute(&mut conn)
            .await
            .map_err(SchemaError::Ddl)?;

        conn.close().await.map_err(SchemaError::Ddl)?;
        Ok(())
    }

    pub async fn summarize(&self) -> anyhow::Result<StoreStats> {
        let mut conn = self
            .connect_read_only()
            .await
            .with_context(|| format!("opening store {}", self.path.display()))?;
        let stats = summarize_with(&mut conn).await;
        conn.close().await.context("closing store connection")?;
        stats
    }
}

async fn summarize_with(conn: &mut SqliteConnection) -> anyhow::Result<StoreStats> {
    let total_rows: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {TABLE_NAME}"))
        .fetch_one(&mut *conn)
        .await
        .context("counting rows")?;
    let unique_projects: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(DISTINCT project_code) FROM {TABLE_NAME} WHERE project_code != ''"
    ))
    .fetch_one(&mut *conn)
    .await
    .context("counting projects")?;
    let unique_statuses: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(DISTINCT install_status) FROM {TABLE_NAME} WHERE install_status != ''"
    ))
    .fetch_one(&mut *conn)
    .await
    .context("counting install statuses")?;

    let rows = sqlx::query(&format!(
        r#"
        SELECT install_status, COUNT(*) AS count
          FROM {TABLE_NAME}
         WHERE install_status != ''
         GROUP BY install_status
         ORDER BY count DESC
         LIMIT 5
        "#
    ))
    .fetch_all(&mut *conn)
    .await
    .context("ranking install statuses")?;

    let mut top_statuses = Vec::with_capacity(rows.len());
    for row in rows {
        top_statuses.push(StatusCount {
            status: row.try_get("install_status")?,
            count: row.try_get("count")?,
        });
    }

    Ok(StoreStats {
        total_rows,
        unique_projects,
        unique_statuses,
        top_statuses,
    })
}

pub fn create_table_sql() -> String {
    let columns = COLUMN_MAP
        .iter()
        .map(|m| format!("    {} {}", m.field, m.kind.sql_type()))
        .collect::<Vec<_>>()
        .join(",\n");
    format!(
        "CREATE TABLE {TABLE_NAME} (\n    id INTEGER PRIMARY KEY AUTOINCREMENT,\n{columns},\n    sync_timestamp TEXT,\n    created_at TEXT DEFAULT CURRENT_TIMESTAMP\n)"
    )
}

/// Parameterised insert covering every mapped column plus the sync stamp.
pub fn insert_sql() -> String {
    let names = COLUMN_MAP.iter().map(|m| m.field).collect::<Vec<_>>();
    let placeholders = vec!["?"; names.len() + 1].join(", ");
    format!(
        "INSERT INTO {TABLE_NAME} ({}, sync_timestamp) VALUES ({placeholders})",
        names.join(", ")
    )
}

/// Insert one record using a statement from [`insert_sql`].
pub async fn insert_record(
    conn: &mut SqliteConnection,
    sql: &str,
    record: &DashboardRecord,
) -> Result<(), sqlx::Error> {
    let mut query = sqlx::query(sql);
    for value in record.values() {
        query = match value {
            FieldValue::Text(text) => query.bind(text),
            FieldValue::Real(real) => query.bind(real),
            FieldValue::Integer(int) => query.bind(int),
        };
    }
    query
        .bind(record.sync_timestamp.as_str())
        .execute(conn)
        .await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some(BROWSER_USER_AGENT.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response body from {url} is not valid UTF-8")]
    Decode {
        url: String,
        #[source]
        source: std::string::FromUtf8Error,
    },
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Request(err) if err.is_timeout())
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub final_url: String,
    pub body: Vec<u8>,
}

/// Single-shot GET client. Failures are returned to the caller untouched.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_bytes(&self, run_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            tracing::debug!(bytes = body.len(), "fetched response body");
            Ok(FetchedResponse {
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }

    /// Fetch and strictly decode a UTF-8 text body.
    pub async fn fetch_text(&self, run_id: Uuid, url: &str) -> Result<String, FetchError> {
        let response = self.fetch_bytes(run_id, url).await?;
        String::from_utf8(response.body).map_err(|source| FetchError::Decode {
            url: response.final_url,
            source,
        })
    }
}
