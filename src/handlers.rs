// Les handlers de l'API de contrôle. Chaque handler valide les champs requis
// (absent ou vide -> 400), délègue au broker et construit le corps de
// réponse ; les appels au dispatcher se font dans le broker, verrou relâché.
use axum::extract::{Path, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::app_state::AppState;
use crate::error::ApiError;
use crate::models::{AckRequest, DeclareRequest, PublishRequest, SubscribeRequest};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/declarar_cola", post(declare_handler))
        .route("/publicar", post(publish_handler))
        .route("/consumir", post(subscribe_handler))
        .route("/ack", post(ack_handler))
        .route("/colas", get(list_queues_handler))
        .route("/colas/{nombre}", delete(delete_queue_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

// Champ requis : présent et non vide, sinon 400 avec la raison donnée.
fn required<'a>(value: &'a Option<String>, missing: &str) -> Result<&'a str, ApiError> {
    match value.as_deref() {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ApiError::Validation(missing.to_string())),
    }
}

pub async fn declare_handler(
    State(state): State<AppState>,
    Json(request): Json<DeclareRequest>,
) -> Result<Json<Value>, ApiError> {
    let name = required(&request.queue, "Falta 'nombre'")?;

    state.broker.declare(name, request.durable).await;
    Ok(Json(json!({ "status": "ok", "cola": name })))
}

pub async fn publish_handler(
    State(state): State<AppState>,
    Json(request): Json<PublishRequest>,
) -> Result<Json<Value>, ApiError> {
    let name = required(&request.queue, "Faltan 'nombre' o 'mensaje'")?;
    let Some(payload) = request.payload else {
        return Err(ApiError::Validation("Faltan 'nombre' o 'mensaje'".to_string()));
    };

    state.broker.publish(name, payload, request.durable).await?;
    Ok(Json(json!({ "status": "mensaje publicado" })))
}

pub async fn subscribe_handler(
    State(state): State<AppState>,
    Json(request): Json<SubscribeRequest>,
) -> Result<Json<Value>, ApiError> {
    let name = required(&request.queue, "Faltan 'nombre' o 'callback_url'")?;
    let callback_url = required(&request.callback_url, "Faltan 'nombre' o 'callback_url'")?;

    state.broker.subscribe(name, callback_url).await?;
    Ok(Json(json!({ "status": "suscrito correctamente" })))
}

pub async fn ack_handler(
    State(state): State<AppState>,
    Json(request): Json<AckRequest>,
) -> Result<Json<Value>, ApiError> {
    let message_id = required(&request.message_id, "Faltan 'message_id' o 'nombre_cola'")?;
    let name = required(&request.queue, "Faltan 'message_id' o 'nombre_cola'")?;

    state.broker.ack(name, message_id).await?;
    Ok(Json(json!({ "status": "ack recibido" })))
}

pub async fn list_queues_handler(State(state): State<AppState>) -> Json<Value> {
    let names = state.broker.queue_names().await;
    info!("Queue listing requested ({} queues)", names.len());
    Json(json!({ "colas": names }))
}

pub async fn delete_queue_handler(
    State(state): State<AppState>,
    Path(nombre): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.broker.delete(&nombre).await?;
    Ok(Json(json!({ "status": "cola eliminada", "cola": nombre })))
}
