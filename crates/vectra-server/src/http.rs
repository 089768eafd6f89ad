//! HTTP surface over the engine. Thin handlers: decode, call the registry,
//! wrap the result in the `{"status": "ok", "data": …}` envelope.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use vectra_core::{
    AddDocumentRequest, BatchAddDocumentsRequest, Error, QueryOptions, Result, TrainRequest,
    UpdateDocumentMetadataRequest,
};
use vectra_engine::Registry;

type AppState = State<Arc<Registry>>;

pub async fn serve(registry: Arc<Registry>, addr: &str) -> Result<()> {
    let app = router(registry);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/api/ping", get(ping))
        .route("/api/stats", get(statistics))
        .route(
            "/api/collections/{name}",
            post(create_collection).delete(drop_collection),
        )
        .route("/api/collections/{name}/search", post(search))
        .route("/api/collections/{name}/train", post(train))
        .route("/api/collections/{name}/dump", post(dump))
        .route("/api/collections/{name}/dump/metadata", post(dump_metadata))
        .route("/api/collections/{name}/dump/index", post(dump_index))
        .route("/api/collections/{name}/load", post(load))
        .route(
            "/api/collections/{name}/documents",
            post(add_document)
                .put(update_document)
                .delete(delete_document)
                .get(get_document),
        )
        .route(
            "/api/collections/{name}/documents/batch",
            post(batch_add_documents),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(registry)
}

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::AlreadyExists(_)
            | Error::InvalidInput(_)
            | Error::VidOverflow { .. }
            | Error::Serde(_) => StatusCode::BAD_REQUEST,
            Error::Loading(_) | Error::IndexUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Error::Timeout => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

fn ok(data: Value) -> Json<Value> {
    Json(json!({ "status": "ok", "data": data }))
}

fn ok_empty() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn ping() -> Json<Value> {
    ok_empty()
}

async fn statistics(State(registry): AppState) -> Result<Json<Value>, ApiError> {
    let stats = registry.statistics().await?;
    Ok(ok(serde_json::to_value(stats).map_err(Error::from)?))
}

#[derive(Deserialize)]
struct CreateCollectionBody {
    dim: i64,
}

async fn create_collection(
    Path(name): Path<String>,
    State(registry): AppState,
    Json(body): Json<CreateCollectionBody>,
) -> Result<Json<Value>, ApiError> {
    let collection = registry.create_collection(&name, body.dim)?;
    let stats = collection.stats().await?;
    Ok(ok(serde_json::to_value(stats).map_err(Error::from)?))
}

async fn drop_collection(
    Path(name): Path<String>,
    State(registry): AppState,
) -> Result<Json<Value>, ApiError> {
    registry.drop_collection(&name)?;
    Ok(ok_empty())
}

#[derive(Deserialize)]
struct SearchBody {
    vectors: Vec<Vec<f32>>,
    #[serde(default)]
    opt: QueryOptions,
}

async fn search(
    Path(name): Path<String>,
    State(registry): AppState,
    Json(body): Json<SearchBody>,
) -> Result<Json<Value>, ApiError> {
    let results = registry.search(&name, &body.vectors, &body.opt).await?;
    Ok(ok(serde_json::to_value(results).map_err(Error::from)?))
}

async fn train(
    Path(name): Path<String>,
    State(registry): AppState,
    body: Option<Json<TrainRequest>>,
) -> Result<Json<Value>, ApiError> {
    let request = body.map_or_else(TrainRequest::default, |Json(r)| r);
    registry.train_collection(&name, request).await?;
    Ok(ok_empty())
}

async fn dump(
    Path(name): Path<String>,
    State(registry): AppState,
) -> Result<Json<Value>, ApiError> {
    registry.dump_collection(&name).await?;
    Ok(ok_empty())
}

async fn dump_metadata(
    Path(name): Path<String>,
    State(registry): AppState,
) -> Result<Json<Value>, ApiError> {
    registry.dump_collection_metadata(&name)?;
    Ok(ok_empty())
}

async fn dump_index(
    Path(name): Path<String>,
    State(registry): AppState,
) -> Result<Json<Value>, ApiError> {
    registry.dump_collection_index(&name).await?;
    Ok(ok_empty())
}

async fn load(
    Path(name): Path<String>,
    State(registry): AppState,
) -> Result<Json<Value>, ApiError> {
    registry.load_collection(&name).await?;
    Ok(ok_empty())
}

async fn add_document(
    Path(name): Path<String>,
    State(registry): AppState,
    Json(doc): Json<AddDocumentRequest>,
) -> Result<Json<Value>, ApiError> {
    registry.add_document(&name, &doc).await?;
    Ok(ok_empty())
}

async fn batch_add_documents(
    Path(name): Path<String>,
    State(registry): AppState,
    Json(batch): Json<BatchAddDocumentsRequest>,
) -> Result<Json<Value>, ApiError> {
    registry.batch_add_documents(&name, &batch).await?;
    Ok(ok_empty())
}

#[derive(Deserialize)]
struct DeleteDocumentBody {
    vqid: String,
}

async fn delete_document(
    Path(name): Path<String>,
    State(registry): AppState,
    Json(body): Json<DeleteDocumentBody>,
) -> Result<Json<Value>, ApiError> {
    let deleted = registry.delete_document(&name, &body.vqid)?;
    Ok(ok(json!({ "deleted_count": deleted })))
}

async fn update_document(
    Path(name): Path<String>,
    State(registry): AppState,
    Json(body): Json<UpdateDocumentMetadataRequest>,
) -> Result<Json<Value>, ApiError> {
    let updated = registry.update_document_metadata(&name, &body)?;
    Ok(ok(json!({ "updated_count": updated })))
}

#[derive(Deserialize)]
struct GetDocumentQuery {
    vqid: String,
    #[serde(default)]
    check_duplicate: bool,
}

async fn get_document(
    Path(name): Path<String>,
    State(registry): AppState,
    Query(query): Query<GetDocumentQuery>,
) -> Result<Json<Value>, ApiError> {
    let hits = registry.get_document_metadata(&name, &query.vqid, query.check_duplicate)?;
    Ok(ok(serde_json::to_value(hits).map_err(Error::from)?))
}
