//! Persona listing endpoints

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::get,
};
use serde::Serialize;

use super::ApiState;
use crate::persona::Persona;

/// Build personas router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/", get(list_personas))
        .route("/{persona_id}", get(get_persona))
        .with_state(state)
}

/// Persona info for API responses
#[derive(Debug, Serialize)]
pub struct PersonaResponse {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tagline: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl From<&Persona> for PersonaResponse {
    fn from(p: &Persona) -> Self {
        Self {
            id: p.identity.id.clone(),
            name: p.identity.name.clone(),
            tagline: p.identity.tagline.clone(),
            language: p.voice.language.clone(),
        }
    }
}

/// Response for listing all personas
#[derive(Debug, Serialize)]
pub struct PersonaListResponse {
    pub personas: Vec<PersonaResponse>,
    pub default_id: String,
}

/// List callable personas
async fn list_personas(State(state): State<Arc<ApiState>>) -> Json<PersonaListResponse> {
    let registry = state.pipeline.personas();
    let mut personas: Vec<PersonaResponse> = registry.iter().map(PersonaResponse::from).collect();
    personas.sort_by(|a, b| a.name.cmp(&b.name));

    let default_id = registry
        .resolve(None)
        .map(|p| p.id().to_string())
        .unwrap_or_default();

    Json(PersonaListResponse {
        personas,
        default_id,
    })
}

/// Get a single persona
async fn get_persona(
    State(state): State<Arc<ApiState>>,
    Path(persona_id): Path<String>,
) -> Result<Json<PersonaResponse>, StatusCode> {
    state
        .pipeline
        .personas()
        .get(&persona_id)
        .map(|p| Json(PersonaResponse::from(p)))
        .ok_or_else(|| {
            tracing::debug!(persona_id = %persona_id, "persona not found");
            StatusCode::NOT_FOUND
        })
}
