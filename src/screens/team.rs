use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::Response,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{entry_response, get_query, require, scoped_key, write_mutation, ScreenError, WriteMethod};
use crate::AppState;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InviteRequest {
    pub email: String,
    pub organization_id: String,
}

impl InviteRequest {
    fn validate(&self) -> Result<(), ScreenError> {
        require(&self.email, "email")?;
        if !self.email.contains('@') {
            return Err(ScreenError::Validation("email is not a valid address".into()));
        }
        require(&self.organization_id, "organizationId")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrgRequest {
    pub name: String,
}

pub async fn invites(State(state): State<Arc<AppState>>) -> Response {
    let query = get_query(&state, scoped_key(&state, "invites"), "/get-invites".into())
        .error_context("Error fetching invites");
    entry_response(state.queries.run(query).await)
}

pub async fn send_invite(
    State(state): State<Arc<AppState>>,
    Json(request): Json<InviteRequest>,
) -> Result<Json<Value>, ScreenError> {
    request.validate()?;

    let descriptor = write_mutation(&state, WriteMethod::Post, "/create-invite".into())
        .success_message("Invite sent successfully")
        .error_context("Error sending invite");

    let sent = state
        .mutations
        .run(descriptor, serde_json::to_value(&request)?)
        .await?;
    Ok(Json(sent))
}

pub async fn accept_invite(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ScreenError> {
    let descriptor = write_mutation(&state, WriteMethod::Post, "/accept-invite".into())
        .invalidates(scoped_key(&state, "invites"))
        .success_message("Invite accepted successfully")
        .error_context("Error accepting invite");

    let accepted = state
        .mutations
        .run(descriptor, json!({ "inviteId": id }))
        .await?;
    Ok(Json(accepted))
}

pub async fn create_org(
    State(state): State<Arc<AppState>>,
    Json(request): Json<OrgRequest>,
) -> Result<Json<Value>, ScreenError> {
    require(&request.name, "name")?;

    let descriptor = write_mutation(&state, WriteMethod::Post, "/create-org".into())
        .success_message("Organization created successfully")
        .error_context("Error creating organization");

    let created = state
        .mutations
        .run(descriptor, serde_json::to_value(&request)?)
        .await?;
    Ok(Json(created))
}
