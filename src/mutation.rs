use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::api::ResourceError;
use crate::cache::ResourceCache;
use crate::notifications::NotificationChannel;
use crate::query::error_message;
use crate::types::{CacheKey, ErrorInfo, ErrorKind, Severity};

type ExecuteFn<I, R> = Box<dyn FnOnce(I) -> BoxFuture<'static, Result<R, ResourceError>> + Send>;
type SuccessFn<R> = Box<dyn FnOnce(&R) + Send>;
type ErrorFn = Box<dyn FnOnce(&ErrorInfo) + Send>;

const DEFAULT_SUCCESS_MESSAGE: &str = "Saved successfully";

/// One write, executed once per user action.
pub struct MutationDescriptor<I, R> {
    execute: ExecuteFn<I, R>,
    invalidates: Vec<CacheKey>,
    invalidates_resources: Vec<String>,
    success_message: Option<String>,
    error_context: Option<String>,
    on_success: Option<SuccessFn<R>>,
    on_error: Option<ErrorFn>,
}

impl<I, R> MutationDescriptor<I, R> {
    pub fn new<F, Fut>(execute: F) -> Self
    where
        F: FnOnce(I) -> Fut + Send + 'static,
        Fut: Future<Output = Result<R, ResourceError>> + Send + 'static,
    {
        Self {
            execute: Box::new(move |input: I| execute(input).boxed()),
            invalidates: Vec::new(),
            invalidates_resources: Vec::new(),
            success_message: None,
            error_context: None,
            on_success: None,
            on_error: None,
        }
    }

    pub fn invalidates(mut self, key: CacheKey) -> Self {
        if !self.invalidates.contains(&key) {
            self.invalidates.push(key);
        }
        self
    }

    /// Invalidates every cached key of `resource`, whatever its other parts.
    pub fn invalidates_resource(mut self, resource: impl Into<String>) -> Self {
        let resource = resource.into();
        if !self.invalidates_resources.contains(&resource) {
            self.invalidates_resources.push(resource);
        }
        self
    }

    pub fn success_message(mut self, message: impl Into<String>) -> Self {
        self.success_message = Some(message.into());
        self
    }

    /// Prefix for the error notification, e.g. `"Error creating ticket"`.
    pub fn error_context(mut self, context: impl Into<String>) -> Self {
        self.error_context = Some(context.into());
        self
    }

    pub fn on_success(mut self, f: impl FnOnce(&R) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(&ErrorInfo) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn invalidated_keys(&self) -> &[CacheKey] {
        &self.invalidates
    }
}

#[derive(Clone)]
pub struct MutationExecutor {
    cache: ResourceCache,
    notifications: NotificationChannel,
    // Serializes the invalidate+notify pass of concurrent mutations.
    side_effects: Arc<Mutex<()>>,
}

impl MutationExecutor {
    pub fn new(cache: ResourceCache, notifications: NotificationChannel) -> Self {
        Self {
            cache,
            notifications,
            side_effects: Arc::new(Mutex::new(())),
        }
    }

    /// Runs the write. Whatever the outcome, the declared keys are
    /// invalidated once and exactly one notification is emitted; the
    /// matching callback runs after both. Failures are returned, never
    /// retried.
    ///
    /// The write and its side effects run on their own task, so they finish
    /// even if the caller stops waiting.
    pub async fn run<I, R>(&self, descriptor: MutationDescriptor<I, R>, input: I) -> Result<R, ErrorInfo>
    where
        I: Send + 'static,
        R: Send + 'static,
    {
        let task = tokio::spawn(self.clone().execute_and_settle(descriptor, input));
        match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "mutation task aborted");
                Err(ErrorInfo::new(ErrorKind::Decode, "mutation task aborted"))
            }
        }
    }

    async fn execute_and_settle<I, R>(
        self,
        descriptor: MutationDescriptor<I, R>,
        input: I,
    ) -> Result<R, ErrorInfo>
    where
        I: Send + 'static,
        R: Send + 'static,
    {
        let MutationDescriptor {
            execute,
            invalidates,
            invalidates_resources,
            success_message,
            error_context,
            on_success,
            on_error,
        } = descriptor;

        let outcome = match AssertUnwindSafe(async move { execute(input).await })
            .catch_unwind()
            .await
        {
            Ok(result) => result.map_err(ErrorInfo::from),
            Err(_) => Err(ErrorInfo::new(ErrorKind::Decode, "mutation panicked")),
        };

        let _guard = self.side_effects.lock().await;

        let marked = self.cache.invalidate(&invalidates);
        for resource in &invalidates_resources {
            self.cache.invalidate_resource(resource);
        }
        debug!(
            keys = invalidates.len(),
            marked,
            resources = ?invalidates_resources,
            "mutation invalidated cache"
        );

        match outcome {
            Ok(result) => {
                let message = success_message.unwrap_or_else(|| DEFAULT_SUCCESS_MESSAGE.to_owned());
                info!(%message, "mutation succeeded");
                self.notifications.emit(message, Severity::Success);
                if let Some(on_success) = on_success {
                    on_success(&result);
                }
                Ok(result)
            }
            Err(err) => {
                warn!(error = %err, "mutation failed");
                self.notifications
                    .emit(error_message(error_context.as_deref(), &err), Severity::Error);
                if let Some(on_error) = on_error {
                    on_error(&err);
                }
                Err(err)
            }
        }
    }
}
