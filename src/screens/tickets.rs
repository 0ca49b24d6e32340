use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::Response,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use super::{
    entry_response, form_response, get_query, one_of, require, scoped_key, text, write_mutation,
    FormView, ScreenError, WriteMethod,
};
use crate::api::ResourceError;
use crate::auth::identity_part;
use crate::form::{FormFields, SeededForm};
use crate::query::QueryDescriptor;
use crate::types::CacheKey;
use crate::AppState;

pub const PRIORITIES: [&str; 3] = ["Low", "Med", "High"];
pub const TYPES: [&str; 4] = ["Bug", "Feature", "Enhancement", "Refactor"];
pub const STATUSES: [&str; 3] = ["Pending", "In Progress", "Complete"];

const NO_TICKETS: &str = "No tickets found";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TicketFields {
    pub issue: String,
    pub description: String,
    pub priority: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    pub assigned_user: String,
}

impl Default for TicketFields {
    fn default() -> Self {
        Self {
            issue: String::new(),
            description: String::new(),
            priority: "Med".into(),
            kind: String::new(),
            status: "Pending".into(),
            assigned_user: String::new(),
        }
    }
}

impl TicketFields {
    pub fn validate(&self) -> Result<(), ScreenError> {
        require(&self.issue, "issue")?;
        one_of(&self.priority, &PRIORITIES, "priority")?;
        one_of(&self.status, &STATUSES, "status")?;
        if !self.kind.is_empty() {
            one_of(&self.kind, &TYPES, "type")?;
        }
        Ok(())
    }
}

impl FormFields for TicketFields {
    fn seed(data: &Value) -> Self {
        let ticket = data.get("ticket").unwrap_or(data);
        let defaults = Self::default();
        let or = |field: &str, fallback: String| {
            let value = text(ticket, field);
            if value.is_empty() {
                fallback
            } else {
                value
            }
        };

        // The API stores an unassigned ticket as the literal string "null".
        let assigned_user = match text(ticket, "assignedUser") {
            user if user == "null" => String::new(),
            user => user,
        };

        Self {
            issue: text(ticket, "issue"),
            description: text(ticket, "description"),
            priority: or("priority", defaults.priority),
            kind: text(ticket, "type"),
            status: or("status", defaults.status),
            assigned_user,
        }
    }
}

fn detail_key(state: &AppState, id: &str) -> CacheKey {
    CacheKey::new("ticket")
        .with(id)
        .with(identity_part(state.session.current().as_ref()))
}

fn list_query(state: &AppState) -> QueryDescriptor {
    let token = state.session.current();
    let enabled = token.is_some();
    let api = state.api.clone();

    QueryDescriptor::new(scoped_key(state, "tickets"), move || async move {
        let token = token.ok_or(ResourceError::NotEnabled)?;
        let body = api.get(token.bearer(), "/get-tickets").await?;

        // An empty project comes back as a bare message; keep it next to an
        // empty list so the notice can see it.
        if body.get("message").and_then(Value::as_str) == Some(NO_TICKETS) {
            debug!("api reports no tickets");
            return Ok(json!({ "tickets": [], "message": NO_TICKETS }));
        }
        Ok(body)
    })
    .enabled(enabled)
    .error_context("Error fetching tickets")
    .success_notice(|data| {
        (data.get("message").and_then(Value::as_str) == Some(NO_TICKETS))
            .then(|| "No tickets found for the current project".to_string())
    })
}

fn detail_query(state: &AppState, id: &str) -> QueryDescriptor {
    get_query(state, detail_key(state, id), format!("/get-ticket/{id}"))
        .error_context("Error fetching ticket details")
}

pub async fn list(State(state): State<Arc<AppState>>) -> Response {
    entry_response(state.queries.run(list_query(&state)).await)
}

pub async fn detail(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    entry_response(state.queries.run(detail_query(&state, &id)).await)
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(fields): Json<TicketFields>,
) -> Result<Json<Value>, ScreenError> {
    fields.validate()?;

    let descriptor = write_mutation(&state, WriteMethod::Post, "/post-ticket".into())
        .invalidates(scoped_key(&state, "tickets"))
        .success_message("Ticket created successfully")
        .error_context("Error creating ticket");

    let created = state
        .mutations
        .run(descriptor, serde_json::to_value(&fields)?)
        .await?;
    Ok(Json(created))
}

pub async fn form(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let entry = state.queries.run(detail_query(&state, &id)).await;

    let existing = state.ticket_forms.get_mut(&id).map(|mut form| {
        form.observe(&entry);
        form.fields().cloned()
    });
    // A form only takes a slot once it has something to show.
    let fields = match existing {
        Some(fields) => fields,
        None => {
            let mut fresh = SeededForm::<TicketFields>::new();
            if fresh.observe(&entry) {
                state.ticket_forms.entry(id).or_insert(fresh).fields().cloned()
            } else {
                None
            }
        }
    };

    form_response(FormView {
        status: entry.status,
        fields,
        error: entry.error,
    })
}

pub async fn edit_form(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(patch): Json<Value>,
) -> Result<Json<TicketFields>, ScreenError> {
    let mut form = state
        .ticket_forms
        .get_mut(&id)
        .ok_or(crate::form::FormError::NotSeeded)?;
    let fields = form.patch(&patch)?.clone();
    Ok(Json(fields))
}

pub async fn submit_form(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ScreenError> {
    let fields = state
        .ticket_forms
        .get(&id)
        .and_then(|form| form.fields().cloned())
        .ok_or(crate::form::FormError::NotSeeded)?;
    fields.validate()?;

    let reset = {
        let state = state.clone();
        let id = id.clone();
        move |_: &Value| {
            state.ticket_forms.remove(&id);
        }
    };

    let descriptor = write_mutation(&state, WriteMethod::Put, format!("/update-ticket/{id}"))
        .invalidates(scoped_key(&state, "tickets"))
        .invalidates(detail_key(&state, &id))
        .success_message("Ticket updated successfully")
        .error_context("Error updating ticket")
        .on_success(reset);

    let updated = state
        .mutations
        .run(descriptor, serde_json::to_value(&fields)?)
        .await?;
    Ok(Json(updated))
}
