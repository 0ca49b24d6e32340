//! Route handlers for each screen of the client.
//!
//! Handlers hold no fetch logic of their own: they build a query or mutation
//! descriptor and hand it to the session's executors.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::api::ResourceError;
use crate::auth::{self, identity_part, AuthError};
use crate::form::FormError;
use crate::mutation::MutationDescriptor;
use crate::query::QueryDescriptor;
use crate::types::{CacheEntry, CacheKey, EntryStatus, ErrorInfo, NotificationEvent};
use crate::AppState;

pub mod profile;
pub mod projects;
pub mod team;
pub mod tickets;

#[derive(Debug, Error)]
pub enum ScreenError {
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Form(#[from] FormError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("{0}")]
    Failed(ErrorInfo),
    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl From<ErrorInfo> for ScreenError {
    fn from(err: ErrorInfo) -> Self {
        Self::Failed(err)
    }
}

impl IntoResponse for ScreenError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Validation(_) | Self::Payload(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Form(FormError::NotSeeded) => StatusCode::CONFLICT,
            Self::Form(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::Failed(_) => StatusCode::BAD_GATEWAY,
        };
        let body = match self {
            Self::Failed(info) => json!({ "error": info }),
            other => json!({ "error": { "message": other.to_string() } }),
        };
        (status, Json(body)).into_response()
    }
}

/// What a form screen renders: the state of the backing query and, once it
/// has loaded, the editable fields.
#[derive(Debug, Serialize)]
pub struct FormView<F> {
    pub status: EntryStatus,
    pub fields: Option<F>,
    pub error: Option<ErrorInfo>,
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/session", axum::routing::put(sign_in).delete(sign_out))
        .route("/notifications", get(active_notifications))
        .route("/tickets", get(tickets::list).post(tickets::create))
        .route("/tickets/:id", get(tickets::detail))
        .route(
            "/tickets/:id/form",
            get(tickets::form).patch(tickets::edit_form).post(tickets::submit_form),
        )
        .route("/projects", get(projects::list).post(projects::create))
        .route("/profile", get(profile::show))
        .route(
            "/profile/form",
            get(profile::form).patch(profile::edit_form).post(profile::submit_form),
        )
        .route("/invites", get(team::invites).post(team::send_invite))
        .route("/invites/:id/accept", post(team::accept_invite))
        .route("/orgs", post(team::create_org))
}

async fn sign_in(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ScreenError> {
    let token = auth::bearer_from_headers(&headers)?;
    let identity = token.identity().to_owned();
    state.sign_in(token);
    Ok(Json(json!({ "identity": identity })))
}

async fn sign_out(State(state): State<Arc<AppState>>) -> StatusCode {
    state.sign_out();
    StatusCode::NO_CONTENT
}

async fn active_notifications(State(state): State<Arc<AppState>>) -> Json<Vec<NotificationEvent>> {
    Json(state.notifications.active())
}

/// Key for `resource` scoped to the signed-in identity (`null` when signed
/// out).
pub(crate) fn scoped_key(state: &AppState, resource: &str) -> CacheKey {
    CacheKey::new(resource).with(identity_part(state.session.current().as_ref()))
}

/// GET query against `path`, enabled only while a bearer token exists.
pub(crate) fn get_query(state: &AppState, key: CacheKey, path: String) -> QueryDescriptor {
    let token = state.session.current();
    let enabled = token.is_some();
    let api = state.api.clone();

    QueryDescriptor::new(key, move || async move {
        let token = token.ok_or(ResourceError::NotEnabled)?;
        api.get(token.bearer(), &path).await
    })
    .enabled(enabled)
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum WriteMethod {
    Post,
    Put,
}

pub(crate) fn write_mutation(
    state: &AppState,
    method: WriteMethod,
    path: String,
) -> MutationDescriptor<Value, Value> {
    let token = state.session.current();
    let api = state.api.clone();

    MutationDescriptor::new(move |body: Value| async move {
        let token = token.ok_or(ResourceError::NotEnabled)?;
        match method {
            WriteMethod::Post => api.post(token.bearer(), &path, &body).await,
            WriteMethod::Put => api.put(token.bearer(), &path, &body).await,
        }
    })
}

pub(crate) fn entry_response(entry: CacheEntry) -> Response {
    let status = match entry.status {
        EntryStatus::Error => StatusCode::BAD_GATEWAY,
        _ => StatusCode::OK,
    };
    (status, Json(entry)).into_response()
}

pub(crate) fn form_response<F: Serialize>(view: FormView<F>) -> Response {
    let status = match (view.status, &view.fields) {
        (EntryStatus::Error, None) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::OK,
    };
    (status, Json(view)).into_response()
}

/// Field value as a string, whatever JSON type the API used for it.
pub(crate) fn text(value: &Value, field: &str) -> String {
    match value.get(field) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

pub(crate) fn require(value: &str, field: &str) -> Result<(), ScreenError> {
    if value.trim().is_empty() {
        return Err(ScreenError::Validation(format!("{field} is required")));
    }
    Ok(())
}

pub(crate) fn one_of(value: &str, allowed: &[&str], field: &str) -> Result<(), ScreenError> {
    if allowed.contains(&value) {
        return Ok(());
    }
    Err(ScreenError::Validation(format!(
        "{field} must be one of {}",
        allowed.join(", ")
    )))
}
