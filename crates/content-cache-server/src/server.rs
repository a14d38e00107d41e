//! HTTP server for the content cache tier
//!
//! Provides /health, /content/{*address} (GET, PUT, DELETE), /records/{id}
//! (PUT, DELETE) and /evict endpoints.

use crate::types::{
    DeleteParams, DeleteResponse, EvictRequest, EvictResponse, HealthResponse, PutResponse,
    RecordBody, RecordDeleteParams, RecordDeleteResponse,
};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use chrono::{DateTime, Utc};
use content_blob_cache::{
    CachingContentStore, ContentAddress, ContentDestroyer, DestroyOptions, DestructionContext,
    DestructionCoordinator, DestructionReport, EvictionMode, EvictionTrigger, FileContentStore,
    MemoryRecordStore, OwningRecord, RecordId, RecordStore, ReferenceGuard, WriteOutcome,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

/// Shared state for the HTTP server
pub struct ServerState {
    pub store: CachingContentStore,
    /// Durable store behind the cache, written directly on upload
    pub backing: Arc<FileContentStore>,
    pub coordinator: DestructionCoordinator,
    /// Records owning content; also answers whether an address is shared
    pub records: Arc<MemoryRecordStore>,
    pub destroyer: ContentDestroyer,
    pub cleansing_enabled: bool,
    pub target_usage_pct: f64,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(
        store: CachingContentStore,
        backing: Arc<FileContentStore>,
        coordinator: DestructionCoordinator,
        records: Arc<MemoryRecordStore>,
        cleansing_enabled: bool,
        target_usage_pct: f64,
    ) -> Self {
        let destroyer = ContentDestroyer::new(
            records.clone(),
            records.clone(),
            coordinator.clone(),
            cleansing_enabled,
        );
        Self {
            store,
            backing,
            coordinator,
            records,
            destroyer,
            cleansing_enabled,
            target_usage_pct,
            started_at: Utc::now(),
        }
    }

    /// Bytes above the target usage, i.e. what an aggressive pass should free
    fn excess_bytes(&self) -> u64 {
        let ledger = self.store.cache().ledger();
        let usage = ledger.snapshot();
        if ledger.max_bytes() == 0 {
            return usage;
        }
        let target = (ledger.max_bytes() as f64 * self.target_usage_pct / 100.0) as u64;
        usage.saturating_sub(target)
    }
}

pub type SharedState = Arc<ServerState>;

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}

/// Create the HTTP router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/content/{*address}",
            get(get_content).put(put_content).delete(delete_content),
        )
        .route("/records/{id}", put(put_record).delete(delete_record))
        .route("/evict", post(evict))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server, persisting cache usage once it stops
pub async fn start_server(state: SharedState, port: u16) -> std::io::Result<()> {
    let router = create_router(Arc::clone(&state));
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.store.cache().shutdown().await;
    info!("Cache usage saved, server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Health check endpoint
async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let cache = state.store.cache();
    let uptime_secs = (Utc::now() - state.started_at).num_seconds() as u64;

    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs,
        cache: cache.stats().await,
        eviction_running: cache.evictor().is_running(),
        last_eviction: cache.evictor().last_report(),
    })
}

/// Read a blob through the cache
async fn get_content(State(state): State<SharedState>, Path(address): Path<String>) -> Response {
    let address = ContentAddress::new(address);

    match state.store.read_through(&address).await {
        Ok(Some((data, from_cache))) => {
            let cache_header = if from_cache { "HIT" } else { "MISS" };
            (
                StatusCode::OK,
                [
                    (
                        header::CONTENT_TYPE,
                        HeaderValue::from_static("application/octet-stream"),
                    ),
                    (X_CACHE, HeaderValue::from_static(cache_header)),
                ],
                data,
            )
                .into_response()
        }
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Content not found"),
        Err(e) => {
            error!(address = %address, error = %e, "Failed to read content");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read content")
        }
    }
}

/// Store a blob durably, then offer it to the cache
async fn put_content(
    State(state): State<SharedState>,
    Path(address): Path<String>,
    body: Bytes,
) -> Response {
    let address = ContentAddress::new(address);

    let size = match state.backing.write(&address, &body).await {
        Ok(size) => size,
        Err(e) => {
            error!(address = %address, error = %e, "Failed to store content");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to store content");
        }
    };

    // The durable write already succeeded; a cache failure only costs a future miss
    let cache = match state.store.cache().put(&address, &body).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(address = %address, error = %e, "Failed to cache content");
            WriteOutcome::Rejected
        }
    };

    (
        StatusCode::CREATED,
        Json(PutResponse {
            address,
            size,
            cache,
        }),
    )
        .into_response()
}

/// Destroy a blob in both tiers, optionally cleansing it first.
///
/// Content still referenced by a record is left alone and answered with 409.
async fn delete_content(
    State(state): State<SharedState>,
    Path(address): Path<String>,
    Query(params): Query<DeleteParams>,
) -> Response {
    let address = ContentAddress::new(address);

    // No record owns this request, so any referencing record counts
    match state
        .records
        .has_other_reference(&address, &RecordId::default())
        .await
    {
        Ok(false) => {}
        Ok(true) => {
            info!(address = %address, "Content still referenced, skipping delete");
            let response = DeleteResponse {
                shared: true,
                report: DestructionReport::default(),
            };
            return (StatusCode::CONFLICT, Json(response)).into_response();
        }
        Err(e) => {
            error!(address = %address, error = %e, "Reference check failed, nothing deleted");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Reference check failed");
        }
    }

    let mut ctx = DestructionContext::new();
    let cleanse = params.cleanse.unwrap_or(state.cleansing_enabled);
    state.coordinator.register(&mut ctx, &address, cleanse);
    let report = state.coordinator.commit(ctx, &state.store).await;

    let status = if !report.failed.is_empty() {
        StatusCode::INTERNAL_SERVER_ERROR
    } else if report.deleted.is_empty() {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::OK
    };
    let response = DeleteResponse {
        shared: false,
        report,
    };
    (status, Json(response)).into_response()
}

/// Create or replace a record that owns content
async fn put_record(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<RecordBody>,
) -> Response {
    let record = OwningRecord {
        id: RecordId::new(id),
        attributes: body.attributes,
        derived: body.derived,
    };
    state.records.insert(record.clone()).await;
    (StatusCode::CREATED, Json(record)).into_response()
}

/// Delete a record, destroying whatever content no other record still references
async fn delete_record(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(params): Query<RecordDeleteParams>,
) -> Response {
    let id = RecordId::new(id);
    if state.records.get(&id).await.is_none() {
        return error_response(StatusCode::NOT_FOUND, "Record not found");
    }

    let options = DestroyOptions {
        clear_attributes: true,
        cascade_derived: params.cascade_derived,
    };
    let mut ctx = DestructionContext::new();
    let outcome = match state.destroyer.destroy_content(&mut ctx, &id, options).await {
        Ok(outcome) => outcome,
        Err(e) => {
            state.coordinator.rollback(ctx);
            error!(record = %id, error = %e, "Failed to destroy record content");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to destroy record content",
            );
        }
    };

    let report = state.coordinator.commit(ctx, &state.store).await;
    if let Err(e) = state.records.delete_record(&id).await {
        error!(record = %id, error = %e, "Failed to delete record");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to delete record");
    }

    let status = if report.failed.is_empty() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(RecordDeleteResponse { outcome, report })).into_response()
}

/// Manually request an eviction pass
async fn evict(State(state): State<SharedState>, Json(request): Json<EvictRequest>) -> Response {
    let evictor = state.store.cache().evictor();

    let started = match request.mode {
        EvictionMode::Normal => evictor.trigger_normal("manual"),
        EvictionMode::Aggressive => {
            let target_bytes = request
                .target_bytes
                .unwrap_or_else(|| state.excess_bytes());
            if target_bytes == 0 {
                info!("Usage already at or below target, skipping manual eviction");
                false
            } else {
                evictor.trigger_aggressive("manual", target_bytes)
            }
        }
    };

    (
        StatusCode::ACCEPTED,
        Json(EvictResponse {
            mode: request.mode,
            started,
        }),
    )
        .into_response()
}
