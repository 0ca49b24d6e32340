use std::sync::Arc;

use axum::{extract::State, response::Response, Json};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{entry_response, get_query, require, scoped_key, write_mutation, ScreenError, WriteMethod};
use crate::AppState;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectFields {
    pub project_name: String,
    pub project_description: String,
    pub language: String,
    pub framework: String,
    pub cloud: String,
    pub project_manager: String,
    pub client: String,
}

pub async fn list(State(state): State<Arc<AppState>>) -> Response {
    let query = get_query(&state, scoped_key(&state, "projects"), "/get-projects".into())
        .error_context("Error fetching projects");
    entry_response(state.queries.run(query).await)
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(fields): Json<ProjectFields>,
) -> Result<Json<Value>, ScreenError> {
    require(&fields.project_name, "projectName")?;

    let descriptor = write_mutation(&state, WriteMethod::Post, "/post-project".into())
        .invalidates(scoped_key(&state, "projects"))
        .success_message("Project created successfully")
        .error_context("Error creating project");

    let created = state
        .mutations
        .run(descriptor, serde_json::to_value(&fields)?)
        .await?;
    Ok(Json(created))
}
