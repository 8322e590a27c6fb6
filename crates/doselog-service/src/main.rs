use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use clap::Parser;
use doselog_api::{
    mirror_endpoint_from_env, HttpMirror, Journal, API_CONTRACT_VERSION, MIRROR_URL_ENV,
};
use doselog_core::{DataPoint, Entry, FieldMap, QuestionDef, DEFAULT_SERIES_WINDOW};
use doselog_store_sqlite::SqliteSlots;
use serde::{Deserialize, Serialize};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    db_path: PathBuf,
    mirror_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
struct SeriesParams {
    window: Option<usize>,
}

#[derive(Debug, Parser)]
#[command(name = "doselog-service")]
#[command(about = "Local HTTP facade for the doselog journal")]
struct Args {
    #[arg(long, default_value = "./doselog.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, Json(self)).into_response()
    }
}

impl ServiceState {
    fn error(message: impl Into<String>) -> ServiceError {
        ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
        }
    }

    fn journal(&self) -> Result<Journal<SqliteSlots>, ServiceError> {
        let journal =
            Journal::open(&self.db_path).map_err(|err| Self::error(err.to_string()))?;
        Ok(match &self.mirror_url {
            Some(url) => journal.with_mirror(Box::new(HttpMirror::new(url.clone()))),
            None => journal,
        })
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/schema", get(schema_show).put(schema_save))
        .route("/v1/entries", get(entries_list).post(entry_submit))
        .route("/v1/entries/:id", delete(entry_delete))
        .route("/v1/series", get(series_show))
        .route("/v1/export/csv", get(export_csv))
        .route("/v1/export/json", get(export_json))
        .route("/v1/import/json", post(import_json))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mirror_url = mirror_endpoint_from_env();
    if mirror_url.is_none() {
        eprintln!("[mirror] {MIRROR_URL_ENV} is not set; remote mirroring disabled");
    }

    let state = ServiceState { db_path: args.db, mirror_url };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn schema_show(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Vec<QuestionDef>>>, ServiceError> {
    let journal = state.journal()?;
    let questions = journal.schema().map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(questions)))
}

async fn schema_save(
    State(state): State<ServiceState>,
    body: String,
) -> Result<Json<ServiceEnvelope<Vec<QuestionDef>>>, ServiceError> {
    let mut journal = state.journal()?;
    let questions = journal
        .save_schema_raw(&body)
        .map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(questions)))
}

async fn entries_list(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Vec<Entry>>>, ServiceError> {
    let journal = state.journal()?;
    let entries = journal.entries().map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(entries)))
}

async fn entry_submit(
    State(state): State<ServiceState>,
    Json(fields): Json<FieldMap>,
) -> Result<Json<ServiceEnvelope<Entry>>, ServiceError> {
    let mut journal = state.journal()?;
    let mut session =
        journal.new_session().map_err(|err| ServiceState::error(err.to_string()))?;
    for (key, value) in fields {
        session.set(&key, value);
    }
    let (entry, _fresh) =
        journal.submit(&session).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(entry)))
}

async fn entry_delete(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
) -> Result<Json<ServiceEnvelope<serde_json::Value>>, ServiceError> {
    let mut journal = state.journal()?;
    let deleted = journal.delete(&id).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(serde_json::json!({ "id": id, "deleted": deleted }))))
}

async fn series_show(
    State(state): State<ServiceState>,
    Query(params): Query<SeriesParams>,
) -> Result<Json<ServiceEnvelope<Vec<DataPoint>>>, ServiceError> {
    let journal = state.journal()?;
    let window = params.window.unwrap_or(DEFAULT_SERIES_WINDOW);
    let points = journal.series(window).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(points)))
}

async fn export_csv(State(state): State<ServiceState>) -> Result<Response, ServiceError> {
    let journal = state.journal()?;
    let body = journal.export_csv().map_err(|err| ServiceState::error(err.to_string()))?;
    Ok((StatusCode::OK, [("content-type", "text/csv; charset=utf-8")], body).into_response())
}

async fn export_json(State(state): State<ServiceState>) -> Result<Response, ServiceError> {
    let journal = state.journal()?;
    let body = journal.export_json().map_err(|err| ServiceState::error(err.to_string()))?;
    Ok((
        StatusCode::OK,
        [("content-type", "application/json; charset=utf-8")],
        body,
    )
        .into_response())
}

async fn import_json(
    State(state): State<ServiceState>,
    body: String,
) -> Result<Json<ServiceEnvelope<serde_json::Value>>, ServiceError> {
    let mut journal = state.journal()?;
    let imported =
        journal.import_json(&body).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(serde_json::json!({ "imported": imported }))))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::util::ServiceExt;
    use ulid::Ulid;

    use super::*;

    fn test_state() -> (ServiceState, PathBuf) {
        let db_path =
            std::env::temp_dir().join(format!("doselog-service-{}.sqlite3", Ulid::new()));
        (ServiceState { db_path: db_path.clone(), mirror_url: None }, db_path)
    }

    fn cleanup(db_path: &std::path::Path) {
        for suffix in ["", "-wal", "-shm"] {
            let candidate = PathBuf::from(format!("{}{}", db_path.display(), suffix));
            if candidate.exists() {
                let _ = fs::remove_file(&candidate);
            }
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), usize::MAX).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to collect response body: {err}"),
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}"),
        }
    }

    fn request(method: &str, uri: &str, body: Option<&str>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let result = match body {
            Some(content) => builder.body(Body::from(content.to_string())),
            None => builder.body(Body::empty()),
        };
        match result {
            Ok(request) => request,
            Err(err) => panic!("failed to build request: {err}"),
        }
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (state, db_path) = test_state();
        let response = match app(state).oneshot(request("GET", "/v1/health", None)).await {
            Ok(response) => response,
            Err(err) => panic!("health request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::OK);
        let payload = body_json(response).await;
        assert_eq!(payload["data"]["status"], "ok");
        assert_eq!(payload["service_contract_version"], "service.v1");
        cleanup(&db_path);
    }

    #[tokio::test]
    async fn submit_list_series_delete_flow() {
        let (state, db_path) = test_state();
        let app = app(state);

        let response = match app
            .clone()
            .oneshot(request(
                "POST",
                "/v1/entries",
                Some(r#"{"mood": 7, "anxiety": 3, "focus": 5, "energy": 6, "date": "2024-01-01"}"#),
            ))
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("submit request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::OK);
        let created = body_json(response).await;
        let id = match created["data"]["id"].as_str() {
            Some(id) => id.to_string(),
            None => panic!("created entry payload missing id: {created}"),
        };

        let response = match app.clone().oneshot(request("GET", "/v1/entries", None)).await {
            Ok(response) => response,
            Err(err) => panic!("list request failed: {err}"),
        };
        let listed = body_json(response).await;
        assert_eq!(listed["data"].as_array().map(Vec::len), Some(1));

        let response = match app
            .clone()
            .oneshot(request("GET", "/v1/series?window=30", None))
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("series request failed: {err}"),
        };
        let series = body_json(response).await;
        assert_eq!(series["data"][0]["date"], "2024-01-01");
        assert_eq!(series["data"][0]["metrics"]["Mood"], 7.0);

        let response = match app
            .clone()
            .oneshot(request("DELETE", &format!("/v1/entries/{id}"), None))
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("delete request failed: {err}"),
        };
        let deleted = body_json(response).await;
        assert_eq!(deleted["data"]["deleted"], true);

        let response = match app.oneshot(request("GET", "/v1/entries", None)).await {
            Ok(response) => response,
            Err(err) => panic!("list request failed: {err}"),
        };
        let listed = body_json(response).await;
        assert_eq!(listed["data"].as_array().map(Vec::len), Some(0));

        cleanup(&db_path);
    }

    #[tokio::test]
    async fn malformed_schema_body_is_rejected_with_400() {
        let (state, db_path) = test_state();
        let response = match app(state)
            .oneshot(request("PUT", "/v1/schema", Some("[{\"key\": \"broken\"}]")))
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("schema request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let payload = body_json(response).await;
        assert!(payload["error"]
            .as_str()
            .is_some_and(|message| message.contains("parse error")));
        cleanup(&db_path);
    }

    #[tokio::test]
    async fn import_round_trips_through_export() {
        let (state, db_path) = test_state();
        let app = app(state);

        for body in [r#"{"mood": 2}"#, r#"{"mood": 8}"#] {
            let response = match app
                .clone()
                .oneshot(request("POST", "/v1/entries", Some(body)))
                .await
            {
                Ok(response) => response,
                Err(err) => panic!("submit request failed: {err}"),
            };
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = match app.clone().oneshot(request("GET", "/v1/export/json", None)).await {
            Ok(response) => response,
            Err(err) => panic!("export request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::OK);
        let exported = match to_bytes(response.into_body(), usize::MAX).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to collect export body: {err}"),
        };
        let exported = String::from_utf8_lossy(&exported).to_string();

        let response = match app
            .clone()
            .oneshot(request("POST", "/v1/import/json", Some(&exported)))
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("import request failed: {err}"),
        };
        let imported = body_json(response).await;
        assert_eq!(imported["data"]["imported"], 2);

        let response = match app.oneshot(request("GET", "/v1/export/csv", None)).await {
            Ok(response) => response,
            Err(err) => panic!("csv request failed: {err}"),
        };
        let csv = match to_bytes(response.into_body(), usize::MAX).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to collect csv body: {err}"),
        };
        let csv = String::from_utf8_lossy(&csv);
        assert_eq!(csv.lines().count(), 3);

        cleanup(&db_path);
    }
}
