use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use emg_ingest_core::{EmgRecord, IngestError};
use emg_ingest_store_sqlite::SqliteEmgStore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing_subscriber::EnvFilter;

const SAVE_STATUS: &str = "Data Saved";

/// Handle to the Storage Writer. Opens a fresh connection per call so each
/// request gets scoped acquisition with unconditional release, success or
/// failure.
#[derive(Debug, Clone)]
struct EmgIngestApi {
    db_path: PathBuf,
}

impl EmgIngestApi {
    fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn migrate(&self) -> Result<()> {
        let store = SqliteEmgStore::open(&self.db_path)?;
        store.migrate()
    }

    fn append_records(&self, records: &[EmgRecord]) -> Result<()> {
        SqliteEmgStore::open(&self.db_path)
            .and_then(|mut store| store.append_records(records))
            .map_err(|err| {
                err.context(IngestError::Storage(
                    "batch commit failed, no rows persisted".to_string(),
                ))
            })
    }
}

#[derive(Debug, Clone)]
struct ServiceState {
    api: EmgIngestApi,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    error: ServiceErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorPayload {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
struct SaveResponse {
    status: &'static str,
    count: usize,
}

#[derive(Debug, Clone, Deserialize)]
struct HelloParams {
    name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct HelloResponse {
    message: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    timeout_ms: u64,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    invalid_json_total: AtomicU64,
    validation_error_total: AtomicU64,
    storage_error_total: AtomicU64,
    internal_error_total: AtomicU64,
    other_error_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    invalid_json_total: u64,
    validation_error_total: u64,
    storage_error_total: u64,
    internal_error_total: u64,
    other_error_total: u64,
}

#[derive(Debug, Parser)]
#[command(name = "emg-ingest-service")]
#[command(about = "HTTP ingestion service for EMG sample records")]
struct Args {
    /// Storage connection string: path to the sqlite database file.
    #[arg(long, default_value = "./emg_ingest.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, default_value_t = 2500)]
    operation_timeout_ms: u64,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            error: ServiceErrorPayload {
                code: self.code,
                message: self.message.clone(),
                details: self.details,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    fn failure(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> ServiceFailure {
        ServiceFailure { status, code, message: message.into(), details }
    }

    /// Maps a body rejection onto the error taxonomy: anything serde fails
    /// to deserialize (wrong shape, missing field, truncated JSON) surfaces
    /// as a data error and is reported as `validation_error` (422 from
    /// axum); transport-level problems such as a missing JSON content type
    /// are `invalid_json`.
    fn client_error(rejection: &JsonRejection) -> ServiceFailure {
        let code = if matches!(rejection, JsonRejection::JsonDataError(_)) {
            "validation_error"
        } else {
            "invalid_json"
        };
        Self::failure(
            rejection.status(),
            code,
            rejection.body_text(),
            Some(json!({"rejection": rejection.to_string()})),
        )
    }

    fn client_error_with_telemetry(&self, rejection: &JsonRejection) -> ServiceFailure {
        let failure = Self::client_error(rejection);
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        self.telemetry.record_failure(failure.code, false);
        tracing::warn!(code = failure.code, "rejected request body: {}", failure.message);
        failure
    }

    fn classify_api_error(
        err: &anyhow::Error,
        default_status: StatusCode,
        default_code: &'static str,
    ) -> ServiceFailure {
        if let Some(ingest) = err.downcast_ref::<IngestError>() {
            return match ingest {
                IngestError::Validation(_) => Self::failure(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "validation_error",
                    format!("{err:#}"),
                    None,
                ),
                IngestError::Storage(_) => Self::failure(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "storage_error",
                    format!("{err:#}"),
                    None,
                ),
            };
        }

        let message = err.to_string();
        let normalized = format!("{err:#}").to_ascii_lowercase();

        if normalized.contains("sqlite")
            || normalized.contains("database")
            || normalized.contains("transaction")
            || normalized.contains("constraint")
            || normalized.contains("emg record")
        {
            return Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage_error",
                message,
                None,
            );
        }

        Self::failure(default_status, default_code, message, None)
    }

    async fn run_blocking<T, F>(
        &self,
        default_status: StatusCode,
        default_code: &'static str,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(EmgIngestApi) -> anyhow::Result<T> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let api = self.api.clone();
        let handle = tokio::task::spawn_blocking(move || op(api));
        let join_result =
            tokio::time::timeout(self.operation_timeout, handle).await.map_err(|_| {
                self.telemetry.record_failure(default_code, true);
                Self::failure(
                    default_status,
                    default_code,
                    format!(
                        "{operation_label} timed out after {} ms",
                        self.operation_timeout.as_millis()
                    ),
                    Some(json!({ "timeout_ms": self.operation_timeout.as_millis() })),
                )
            })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
                None,
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry.requests_success_total.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                let failure = Self::classify_api_error(&err, default_status, default_code);
                self.telemetry.record_failure(failure.code, false);
                tracing::warn!(code = failure.code, "{operation_label} failed: {err:#}");
                Err(failure)
            }
        }
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        match code {
            "invalid_json" => {
                self.invalid_json_total.fetch_add(1, Ordering::Relaxed);
            }
            "validation_error" => {
                self.validation_error_total.fetch_add(1, Ordering::Relaxed);
            }
            "storage_error" => {
                self.storage_error_total.fetch_add(1, Ordering::Relaxed);
            }
            "internal_error" => {
                self.internal_error_total.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.other_error_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            storage_error_total: self.storage_error_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
            other_error_total: self.other_error_total.load(Ordering::Relaxed),
        }
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/hello", get(say_hello))
        .route("/health", get(health))
        .route("/emg/record", post(receive_emg_record))
        .route("/emg/records", post(receive_emg_records))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let api = EmgIngestApi::new(args.db.clone());
    // Table creation is a one-time idempotent step, run before traffic.
    api.migrate().context("failed to initialize emg schema")?;

    let state = ServiceState {
        api,
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        telemetry: Arc::new(ServiceTelemetry::default()),
    };

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, db = %args.db.display(), "emg ingest service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn say_hello(Query(params): Query<HelloParams>) -> Json<HelloResponse> {
    let name = params.name.unwrap_or_else(|| "World".to_string());
    Json(HelloResponse { message: format!("Hello, {name}!") })
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    let timeout_ms = u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    Json(HealthResponse {
        status: "ok",
        timeout_ms,
        telemetry: state.telemetry.snapshot(),
    })
}

async fn receive_emg_record(
    State(state): State<ServiceState>,
    payload: Result<Json<EmgRecord>, JsonRejection>,
) -> Result<(StatusCode, Json<SaveResponse>), ServiceFailure> {
    let Json(record) =
        payload.map_err(|rejection| state.client_error_with_telemetry(&rejection))?;
    // None when the millisecond offset overflows the calendar range.
    let sampled_at = record.occurred_at();
    state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "storage_error",
            "append_record",
            move |api| api.append_records(&[record]),
        )
        .await?;
    tracing::debug!(sampled_at = ?sampled_at, "emg record persisted");
    Ok((StatusCode::CREATED, Json(SaveResponse { status: SAVE_STATUS, count: 1 })))
}

async fn receive_emg_records(
    State(state): State<ServiceState>,
    payload: Result<Json<Vec<EmgRecord>>, JsonRejection>,
) -> Result<(StatusCode, Json<SaveResponse>), ServiceFailure> {
    let Json(records) =
        payload.map_err(|rejection| state.client_error_with_telemetry(&rejection))?;
    let count = records.len();
    let first_sampled_at = records.first().and_then(EmgRecord::occurred_at);
    state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "storage_error",
            "append_records",
            move |api| api.append_records(&records),
        )
        .await?;
    tracing::debug!(count, first_sampled_at = ?first_sampled_at, "emg batch persisted");
    Ok((StatusCode::CREATED, Json(SaveResponse { status: SAVE_STATUS, count })))
}
