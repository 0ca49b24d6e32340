use std::sync::Arc;

use axum::{extract::State, response::Response, Json};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    entry_response, form_response, require, scoped_key, text, write_mutation, FormView,
    ScreenError, WriteMethod,
};
use crate::api::ResourceError;
use crate::form::{FormError, FormFields};
use crate::query::QueryDescriptor;
use crate::AppState;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProfileFields {
    pub username: String,
    pub age: String,
    pub bio: String,
    pub email: String,
    pub position: String,
    pub location: String,
    pub organization: String,
    pub avatar_url: String,
}

impl FormFields for ProfileFields {
    fn seed(data: &Value) -> Self {
        let user = data.get("user").unwrap_or(data);
        Self {
            username: text(user, "username"),
            age: text(user, "age"),
            bio: text(user, "bio"),
            email: text(user, "email"),
            position: text(user, "position"),
            location: text(user, "location"),
            organization: text(user, "organization"),
            avatar_url: text(user, "avatarUrl"),
        }
    }
}

/// The signed-in user. `/single-person` wraps the record in `{ "user": .. }`;
/// the cache holds the record itself.
fn user_query(state: &AppState) -> QueryDescriptor {
    let token = state.session.current();
    let enabled = token.is_some();
    let api = state.api.clone();

    QueryDescriptor::new(scoped_key(state, "user"), move || async move {
        let token = token.ok_or(ResourceError::NotEnabled)?;
        let mut body = api.get(token.bearer(), "/single-person").await?;
        Ok(body.get_mut("user").map(Value::take).unwrap_or(Value::Null))
    })
    .enabled(enabled)
    .error_context("Error fetching user data")
}

pub async fn show(State(state): State<Arc<AppState>>) -> Response {
    entry_response(state.queries.run(user_query(&state)).await)
}

pub async fn form(State(state): State<Arc<AppState>>) -> Response {
    let entry = state.queries.run(user_query(&state)).await;

    let fields = {
        let mut form = state.profile_form.lock();
        form.observe(&entry);
        form.fields().cloned()
    };

    form_response(FormView {
        status: entry.status,
        fields,
        error: entry.error,
    })
}

pub async fn edit_form(
    State(state): State<Arc<AppState>>,
    Json(patch): Json<Value>,
) -> Result<Json<ProfileFields>, ScreenError> {
    let mut form = state.profile_form.lock();
    let fields = form.patch(&patch)?.clone();
    Ok(Json(fields))
}

pub async fn submit_form(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ScreenError> {
    let fields = state
        .profile_form
        .lock()
        .fields()
        .cloned()
        .ok_or(FormError::NotSeeded)?;
    require(&fields.username, "username")?;

    let reset = {
        let state = state.clone();
        move |_: &Value| state.profile_form.lock().reset()
    };

    // Every "user" key, whatever identity it was scoped to.
    let descriptor = write_mutation(&state, WriteMethod::Post, "/update-user".into())
        .invalidates_resource("user")
        .success_message("Profile updated successfully")
        .error_context("Error updating user data")
        .on_success(reset);

    let updated = state
        .mutations
        .run(descriptor, serde_json::to_value(&fields)?)
        .await?;
    Ok(Json(updated))
}
