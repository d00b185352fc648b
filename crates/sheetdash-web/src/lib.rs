//! Read-only JSON query API over the imported dashboard table.

use std::num::{IntErrorKind, ParseIntError};
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Query, Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use indexmap::IndexMap;
use serde::Serialize;
use sheetdash_storage::DashboardStore;
use sqlx::{Connection, QueryBuilder, Row, Sqlite, SqliteConnection};
use thiserror::Error;
use tokio::net::TcpListener;

pub const CRATE_NAME: &str = "sheetdash-web";

pub const ENDPOINTS: [&str; 4] = ["/api/stats", "/api/data", "/api/projects", "/api/status"];

pub const DEFAULT_LIMIT: i64 = 100;
pub const MAX_LIMIT: i64 = 1000;

const DATA_COLUMNS: &str = "order_number, order_date, project_code, project_name, unit_no, house_number, \
     contact_name, contact_phone, product_detail, brand, product_size, \
     install_date, install_status, document_status, building, floor_level, \
     items_group, room_type, install_point, color, sync_timestamp";

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub db_path: PathBuf,
    pub port: u16,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            db_path: std::env::var("SHEETDASH_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("dashboard.db")),
            port: std::env::var("SHEETDASH_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3001),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: DashboardStore,
}

impl AppState {
    pub fn new(config: &WebConfig) -> Self {
        Self {
            store: DashboardStore::new(config.db_path.clone()),
        }
    }

    /// Fresh read-only connection; every request gets its own.
    async fn open(&self) -> Result<SqliteConnection, RequestError> {
        self.store
            .connect_read_only()
            .await
            .map_err(|err| RequestError::Internal(err.into()))
    }
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("Endpoint not found")]
    NotFound,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<sqlx::Error> for RequestError {
    fn from(err: sqlx::Error) -> Self {
        RequestError::Internal(err.into())
    }
}

impl IntoResponse for RequestError {
    fn into_response(self) -> Response {
        match self {
            RequestError::NotFound => (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({
                    "error": "Endpoint not found",
                    "available_endpoints": ENDPOINTS,
                })),
            )
                .into_response(),
            RequestError::Internal(err) => {
                tracing::error!(error = %err, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({
                        "error": "Internal server error",
                        "details": err.to_string(),
                    })),
                )
                    .into_response()
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MonthlyCount {
    pub year: i64,
    pub month: i64,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    pub total_records: i64,
    pub unique_projects: i64,
    pub install_status_breakdown: IndexMap<String, i64>,
    pub monthly_breakdown: Vec<MonthlyCount>,
    pub top_brands: IndexMap<String, i64>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DataRow {
    pub order_number: Option<String>,
    pub order_date: Option<String>,
    pub project_code: Option<String>,
    pub project_name: Option<String>,
    pub unit_no: Option<String>,
    pub house_number: Option<String>,
    pub contact_name: Option<String>,
    pub contact_phone: Option<String>,
    pub product_detail: Option<String>,
    pub brand: Option<String>,
    pub product_size: Option<String>,
    pub install_date: Option<String>,
    pub install_status: Option<String>,
    pub document_status: Option<String>,
    pub building: Option<String>,
    pub floor_level: Option<String>,
    pub items_group: Option<String>,
    pub room_type: Option<String>,
    pub install_point: Option<String>,
    pub color: Option<String>,
    pub sync_timestamp: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Pagination {
    pub limit: i64,
    pub offset: i64,
    pub returned_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DataResponse {
    pub data: Vec<DataRow>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectRow {
    pub project_code: String,
    pub project_name: Option<String>,
    pub record_count: i64,
    pub latest_install: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectsResponse {
    pub projects: Vec<ProjectRow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusRow {
    pub status: String,
    pub count: i64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub status_summary: Vec<StatusRow>,
}

/// Resolved `/api/data` parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataFilter {
    pub project_code: Option<String>,
    pub install_status: Option<String>,
    pub brand: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl DataFilter {
    /// Build from raw query pairs. The first occurrence of a key wins.
    pub fn from_pairs(pairs: &[(String, String)]) -> Self {
        let first = |key: &str| {
            pairs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };
        let equality = |key: &str| {
            first(key)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let limit = match first("limit").map(parse_paging) {
            Some(Ok(n)) if n >= 0 => n.min(MAX_LIMIT),
            _ => DEFAULT_LIMIT,
        };
        let offset = match first("offset").map(parse_paging) {
            Some(Ok(n)) => n.max(0),
            _ => 0,
        };

        Self {
            project_code: equality("project_code"),
            install_status: equality("install_status"),
            brand: equality("brand"),
            limit,
            offset,
        }
    }
}

/// Digits beyond `i64` saturate instead of reading as non-numeric.
fn parse_paging(raw: &str) -> Result<i64, ParseIntError> {
    match raw.trim().parse::<i64>() {
        Err(err) if *err.kind() == IntErrorKind::PosOverflow => Ok(i64::MAX),
        Err(err) if *err.kind() == IntErrorKind::NegOverflow => Ok(i64::MIN),
        other => other,
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/stats", get(stats_handler))
        .route("/api/data", get(data_handler))
        .route("/api/projects", get(projects_handler))
        .route("/api/status", get(status_handler))
        .fallback(not_found_handler)
        .layer(middleware::from_fn(cors))
        .with_state(Arc::new(state))
}

pub async fn serve(config: WebConfig) -> anyhow::Result<()> {
    let state = AppState::new(&config);
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    tracing::info!(
        port = config.port,
        db = %config.db_path.display(),
        endpoints = ?ENDPOINTS,
        "dashboard API listening"
    );
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Permissive CORS on every response; preflight never reaches the router.
async fn cors(req: Request, next: Next) -> Response {
    let mut response = if req.method() == Method::OPTIONS {
        StatusCode::OK.into_response()
    } else {
        next.run(req).await
    };
    apply_cors_headers(response.headers_mut());
    response
}

fn apply_cors_headers(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
}

async fn not_found_handler() -> RequestError {
    RequestError::NotFound
}

async fn stats_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StatsResponse>, RequestError> {
    let mut conn = state.open().await?;
    let result = load_stats(&mut conn).await;
    release(conn).await;
    Ok(Json(result?))
}

async fn data_handler(
    State(state): State<Arc<AppState>>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Json<DataResponse>, RequestError> {
    let filter = DataFilter::from_pairs(&pairs);
    let mut conn = state.open().await?;
    let result = load_data(&mut conn, &filter).await;
    release(conn).await;
    Ok(Json(result?))
}

async fn projects_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ProjectsResponse>, RequestError> {
    let mut conn = state.open().await?;
    let result = load_projects(&mut conn).await;
    release(conn).await;
    Ok(Json(result?))
}

async fn status_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StatusResponse>, RequestError> {
    let mut conn = state.open().await?;
    let result = load_status_summary(&mut conn).await;
    release(conn).await;
    Ok(Json(result?))
}

async fn release(conn: SqliteConnection) {
    if let Err(err) = conn.close().await {
        tracing::warn!(error = %err, "closing store connection failed");
    }
}

async fn count_by(
    conn: &mut SqliteConnection,
    sql: &str,
) -> Result<IndexMap<String, i64>, sqlx::Error> {
    let rows = sqlx::query(sql).fetch_all(&mut *conn).await?;
    let mut out: IndexMap<String, i64> = IndexMap::with_capacity(rows.len());
    for row in rows {
        out.insert(row.try_get(0)?, row.try_get(1)?);
    }
    Ok(out)
}

pub async fn load_stats(conn: &mut SqliteConnection) -> Result<StatsResponse, RequestError> {
    let total_records: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dashboard_data")
        .fetch_one(&mut *conn)
        .await?;
    let unique_projects: i64 = sqlx::query_scalar(
        "SELECT COUNT(DISTINCT project_code) FROM dashboard_data WHERE project_code != ''",
    )
    .fetch_one(&mut *conn)
    .await?;

    let install_status_breakdown = count_by(
        conn,
        r#"
        SELECT install_status, COUNT(*) AS count
          FROM dashboard_data
         WHERE install_status != ''
         GROUP BY install_status
         ORDER BY count DESC
        "#,
    )
    .await?;

    let monthly = sqlx::query(
        r#"
        SELECT sales_year, sales_month, COUNT(*) AS count
          FROM dashboard_data
         WHERE sales_year IS NOT NULL
           AND sales_month IS NOT NULL
         GROUP BY sales_year, sales_month
         ORDER BY sales_year DESC, sales_month DESC
         LIMIT 12
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;
    let mut monthly_breakdown = Vec::with_capacity(monthly.len());
    for row in monthly {
        monthly_breakdown.push(MonthlyCount {
            year: row.try_get("sales_year")?,
            month: row.try_get("sales_month")?,
            count: row.try_get("count")?,
        });
    }

    let top_brands = count_by(
        conn,
        r#"
        SELECT brand, COUNT(*) AS count
          FROM dashboard_data
         WHERE brand != ''
         GROUP BY brand
         ORDER BY count DESC
         LIMIT 10
        "#,
    )
    .await?;

    Ok(StatsResponse {
        total_records,
        unique_projects,
        install_status_breakdown,
        monthly_breakdown,
        top_brands,
    })
}

pub async fn load_data(
    conn: &mut SqliteConnection,
    filter: &DataFilter,
) -> Result<DataResponse, RequestError> {
    let mut builder = QueryBuilder::<Sqlite>::new(format!("SELECT {DATA_COLUMNS} FROM dashboard_data"));

    let conditions = [
        ("project_code", &filter.project_code),
        ("install_status", &filter.install_status),
        ("brand", &filter.brand),
    ];
    let mut first = true;
    for (column, value) in conditions {
        let Some(value) = value else { continue };
        builder.push(if first { " WHERE " } else { " AND " });
        builder.push(column).push(" = ").push_bind(value.clone());
        first = false;
    }

    builder
        .push(" ORDER BY order_date DESC LIMIT ")
        .push_bind(filter.limit)
        .push(" OFFSET ")
        .push_bind(filter.offset);

    let data = builder
        .build_query_as::<DataRow>()
        .fetch_all(&mut *conn)
        .await?;
    let returned_count = data.len();

    Ok(DataResponse {
        data,
        pagination: Pagination {
            limit: filter.limit,
            offset: filter.offset,
            returned_count,
        },
    })
}

pub async fn load_projects(conn: &mut SqliteConnection) -> Result<ProjectsResponse, RequestError> {
    let rows = sqlx::query(
        r#"
        SELECT project_code, project_name, COUNT(*) AS record_count,
               MAX(install_date) AS latest_install
          FROM dashboard_data
         WHERE project_code != ''
         GROUP BY project_code, project_name
         ORDER BY record_count DESC
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    let mut projects = Vec::with_capacity(rows.len());
    for row in rows {
        projects.push(ProjectRow {
            project_code: row.try_get("project_code")?,
            project_name: row.try_get("project_name")?,
            record_count: row.try_get("record_count")?,
            latest_install: row.try_get("latest_install")?,
        });
    }
    Ok(ProjectsResponse { projects })
}

pub async fn load_status_summary(
    conn: &mut SqliteConnection,
) -> Result<StatusResponse, RequestError> {
    let rows = sqlx::query(
        r#"
        SELECT install_status, COUNT(*) AS count,
               ROUND(COUNT(*) * 100.0 / (SELECT COUNT(*) FROM dashboard_data), 2) AS percentage
          FROM dashboard_data
         WHERE install_status != ''
         GROUP BY install_status
         ORDER BY count DESC
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    let mut status_summary = Vec::with_capacity(rows.len());
    for row in rows {
        status_summary.push(StatusRow {
            status: row.try_get("install_status")?,
            count: row.try_get("count")?,
            percentage: row.try_get("percentage")?,
        });
    }
    Ok(StatusResponse { status_summary })
}
