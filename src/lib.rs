use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{routing::get, Router};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::info;

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod form;
pub mod mutation;
pub mod notifications;
pub mod query;
pub mod screens;
pub mod types;
pub mod ws_gateway;

use crate::api::{HttpResourceApi, ResourceApi};
use crate::auth::{Session, SessionToken};
use crate::cache::ResourceCache;
use crate::form::SeededForm;
use crate::mutation::MutationExecutor;
use crate::notifications::NotificationChannel;
use crate::query::QueryExecutor;
use crate::screens::profile::ProfileFields;
use crate::screens::tickets::TicketFields;

/// Everything one client session owns. Created at session start and dropped
/// with it; screens reach the executors and the notification channel only
/// through here.
pub struct AppState {
    pub api: Arc<dyn ResourceApi>,
    pub session: Session,
    pub queries: QueryExecutor,
    pub mutations: MutationExecutor,
    pub notifications: NotificationChannel,
    pub ticket_forms: DashMap<String, SeededForm<TicketFields>>,
    pub profile_form: Mutex<SeededForm<ProfileFields>>,
    pub ws_send_buffer: usize,
}

impl AppState {
    pub fn initialize(config: config::Config) -> anyhow::Result<Arc<Self>> {
        let api = Arc::new(HttpResourceApi::new(config.api_base_url.clone())?);
        Ok(Self::with_api(&config, api))
    }

    pub fn with_api(config: &config::Config, api: Arc<dyn ResourceApi>) -> Arc<Self> {
        let cache = ResourceCache::new(config.query_stale_time);
        let notifications = NotificationChannel::new(config.notification_display);
        let session = Session::new(config.access_token.as_deref().map(SessionToken::new));

        Arc::new(Self {
            api,
            session,
            queries: QueryExecutor::new(cache.clone(), notifications.clone()),
            mutations: MutationExecutor::new(cache, notifications.clone()),
            notifications,
            ticket_forms: DashMap::new(),
            profile_form: Mutex::new(SeededForm::new()),
            ws_send_buffer: config.ws_send_buffer,
        })
    }

    pub fn cache(&self) -> &ResourceCache {
        self.queries.cache()
    }

    pub fn sign_in(&self, token: SessionToken) {
        if self.session.sign_in(token) {
            self.forget_identity();
        }
    }

    pub fn sign_out(&self) {
        if self.session.sign_out().is_some() {
            self.forget_identity();
        }
    }

    // Responses still in flight belong to the previous identity, and so does
    // any half-edited form.
    fn forget_identity(&self) {
        let superseded = self.cache().supersede_all();
        self.ticket_forms.clear();
        self.profile_form.lock().reset();
        info!(superseded, "identity changed, session state cleared");
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_gateway::ws_handler))
        .route("/healthz", get(|| async { "ok" }))
        .merge(screens::routes())
        .with_state(state)
}

/// Binds the configured address and serves one session until `shutdown`
/// resolves.
pub async fn serve(
    config: config::Config,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr: SocketAddr = config
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind address {:?}", config.bind_addr))?;
    let state = AppState::initialize(config)?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(addr = %listener.local_addr()?, "issuelock session listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("server failed")
}
