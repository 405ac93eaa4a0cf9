// Erreurs de l'API de contrôle, converties en réponses HTTP.
// Les pannes opérationnelles (snapshot, callbacks) ne passent jamais par ici :
// elles sont absorbées et journalisées là où elles se produisent.
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    // Champ requis absent ou vide -> 400.
    #[error("{0}")]
    Validation(String),
    // File ou livraison inconnue -> 404.
    #[error("{0}")]
    NotFound(String),
    // Publication vers une file inexistante : le payload est jeté, jamais
    // mis en tampon. Le corps de réponse est un statut, pas une erreur.
    #[error("mensaje perdido (cola no existe)")]
    LostPublish,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(reason) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": reason })),
            )
                .into_response(),
            ApiError::NotFound(reason) => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": reason })),
            )
                .into_response(),
            ApiError::LostPublish => (
                StatusCode::NOT_FOUND,
                Json(json!({ "status": "mensaje perdido (cola no existe)" })),
            )
                .into_response(),
        }
    }
}
