use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::api::ResourceError;
use crate::cache::{ResourceCache, Settlement};
use crate::notifications::NotificationChannel;
use crate::types::{CacheEntry, CacheKey, EntryStatus, ErrorInfo, ErrorKind, Severity};

type FetchFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<Value, ResourceError>> + Send>;
type NoticeFn = Box<dyn FnOnce(&Value) -> Option<String> + Send>;

/// How to (re)populate one cache entry. Built by a screen, consumed by
/// [`QueryExecutor::run`].
pub struct QueryDescriptor {
    key: CacheKey,
    fetch: FetchFn,
    enabled: bool,
    error_context: Option<String>,
    notice: Option<NoticeFn>,
}

impl QueryDescriptor {
    pub fn new<F, Fut, T>(key: CacheKey, fetch: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ResourceError>> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        let fetch: FetchFn = Box::new(move || {
            let fut = fetch();
            async move {
                let value = fut.await?;
                Ok::<_, ResourceError>(serde_json::to_value(value)?)
            }
            .boxed()
        });

        Self {
            key,
            fetch,
            enabled: true,
            error_context: None,
            notice: None,
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Prefix for the error notification, e.g. `"Error fetching tickets"`.
    pub fn error_context(mut self, context: impl Into<String>) -> Self {
        self.error_context = Some(context.into());
        self
    }

    /// Info message derived from a successful payload. Only raised when the
    /// result is actually written to the store.
    pub fn success_notice(
        mut self,
        notice: impl FnOnce(&Value) -> Option<String> + Send + 'static,
    ) -> Self {
        self.notice = Some(Box::new(notice));
        self
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

#[derive(Clone)]
pub struct QueryExecutor {
    cache: ResourceCache,
    notifications: NotificationChannel,
}

impl QueryExecutor {
    pub fn new(cache: ResourceCache, notifications: NotificationChannel) -> Self {
        Self {
            cache,
            notifications,
        }
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    pub async fn run(&self, descriptor: QueryDescriptor) -> CacheEntry {
        let QueryDescriptor {
            key,
            fetch,
            enabled,
            error_context,
            notice,
        } = descriptor;

        if !enabled {
            debug!(%key, "query not enabled, skipping fetch");
            return self.cache.disable(&key);
        }

        if let Some(entry) = self.cache.get(&key) {
            if self.cache.is_fresh(&entry) {
                debug!(%key, "serving from cache");
                return entry;
            }
        }

        let cache = self.cache.clone();
        let notifications = self.notifications.clone();
        let task_key = key.clone();

        let in_flight = self.cache.join_or_start(&key, move |generation| {
            let task = tokio::spawn(fetch_and_settle(
                cache.clone(),
                notifications,
                task_key.clone(),
                generation,
                fetch,
                error_context,
                notice,
            ));

            async move {
                match task.await {
                    Ok(entry) => entry,
                    Err(e) => {
                        error!(key = %task_key, error = %e, "fetch task aborted");
                        let aborted = ErrorInfo::new(ErrorKind::Decode, "fetch task aborted");
                        match cache.settle(&task_key, generation, Err(aborted)) {
                            Settlement::Applied(entry) | Settlement::Superseded(entry) => entry,
                        }
                    }
                }
            }
            .boxed()
            .shared()
        });

        in_flight.await
    }
}

async fn fetch_and_settle(
    cache: ResourceCache,
    notifications: NotificationChannel,
    key: CacheKey,
    generation: u64,
    fetch: FetchFn,
    error_context: Option<String>,
    notice: Option<NoticeFn>,
) -> CacheEntry {
    // The descriptor may panic before handing back its future, so the call
    // itself runs inside the guarded block.
    let result = match AssertUnwindSafe(async move { fetch().await })
        .catch_unwind()
        .await
    {
        Ok(Ok(data)) => Ok(data),
        Ok(Err(e)) => Err(ErrorInfo::from(&e)),
        Err(_) => Err(ErrorInfo::new(ErrorKind::Decode, "fetch panicked")),
    };

    match cache.settle(&key, generation, result) {
        Settlement::Applied(entry) => {
            if entry.status == EntryStatus::Error {
                if let Some(err) = &entry.error {
                    warn!(%key, error = %err, "query failed");
                    notifications.emit(error_message(error_context.as_deref(), err), Severity::Error);
                }
            } else {
                debug!(%key, "query resolved");
                let message = notice
                    .zip(entry.data.as_ref())
                    .and_then(|(notice, data)| notice(data));
                if let Some(message) = message {
                    notifications.emit(message, Severity::Info);
                }
            }
            entry
        }
        Settlement::Superseded(current) => current,
    }
}

pub(crate) fn error_message(context: Option<&str>, err: &ErrorInfo) -> String {
    match context {
        Some(context) => format!("{context}: {}", err.message),
        None => err.message.clone(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;
    use serde_json::json;
    use tokio::sync::Notify;

    use super::*;
    use crate::types::NotificationEvent;

    struct Harness {
        executor: QueryExecutor,
        events: Arc<Mutex<Vec<NotificationEvent>>>,
        _sub: crate::notifications::Subscription,
    }

    fn harness(stale_time: Duration) -> Harness {
        let notifications = NotificationChannel::new(Duration::from_secs(60));
        let events = Arc::new(Mutex::new(Vec::new()));
        let sub = {
            let events = events.clone();
            notifications.subscribe(move |ev| events.lock().push(ev.clone()))
        };
        Harness {
            executor: QueryExecutor::new(ResourceCache::new(stale_time), notifications),
            events,
            _sub: sub,
        }
    }

    fn tickets_key() -> CacheKey {
        CacheKey::new("tickets").with("user-1")
    }

    fn network_error() -> ResourceError {
        ResourceError::Api {
            status: 503,
            message: "Network Error".into(),
        }
    }

    #[tokio::test]
    async fn disabled_query_stays_idle_without_fetching() {
        let h = harness(Duration::ZERO);
        let calls = Arc::new(AtomicUsize::new(0));
        let key = CacheKey::new("user").with(None::<&str>);

        let counter = calls.clone();
        let entry = h
            .executor
            .run(
                QueryDescriptor::new(key.clone(), move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({}))
                })
                .enabled(false),
            )
            .await;

        assert_eq!(entry.status, EntryStatus::Idle);
        assert_eq!(entry.key, key);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(h.events.lock().is_empty());
    }

    #[tokio::test]
    async fn concurrent_runs_share_one_fetch() {
        let h = harness(Duration::ZERO);
        let calls = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());

        let descriptor = || {
            let calls = calls.clone();
            let release = release.clone();
            QueryDescriptor::new(tickets_key(), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                release.notified().await;
                Ok(json!({"tickets": [{"id": "t1"}]}))
            })
        };

        let runs = futures::future::join_all((0..5).map(|_| h.executor.run(descriptor())));
        let releaser = async {
            while calls.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
            release.notify_one();
        };
        let (entries, ()) = tokio::join!(runs, releaser);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(entries.iter().all(|e| e == &entries[0]));
        assert_eq!(entries[0].status, EntryStatus::Success);
    }

    #[tokio::test]
    async fn fresh_entry_is_served_without_refetch() {
        let h = harness(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            h.executor
                .run(QueryDescriptor::new(tickets_key(), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!([]))
                }))
                .await;
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidated_key_reloads_through_loading() {
        let h = harness(Duration::from_secs(60));
        h.executor
            .run(QueryDescriptor::new(tickets_key(), || async { Ok(json!(["old"])) }))
            .await;

        h.executor.cache().invalidate([&tickets_key()]);
        h.executor.cache().invalidate([&tickets_key()]);

        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let run = {
            let started = started.clone();
            let release = release.clone();
            h.executor
                .run(QueryDescriptor::new(tickets_key(), move || async move {
                    started.notify_one();
                    release.notified().await;
                    Ok(json!(["new"]))
                }))
        };
        let observer = async {
            started.notified().await;
            let during = h.executor.cache().get(&tickets_key()).unwrap();
            release.notify_one();
            during
        };
        let (entry, during) = tokio::join!(run, observer);

        assert_eq!(during.status, EntryStatus::Loading);
        assert_eq!(during.data, Some(json!(["old"])));
        assert_eq!(entry.status, EntryStatus::Success);
        assert_eq!(entry.data, Some(json!(["new"])));
        assert!(!entry.stale);
    }

    #[tokio::test]
    async fn failure_notifies_then_retry_recovers() {
        let h = harness(Duration::from_secs(60));

        let failed = h
            .executor
            .run(
                QueryDescriptor::new(tickets_key(), || async {
                    Err::<Value, _>(network_error())
                })
                .error_context("Error fetching tickets"),
            )
            .await;

        assert_eq!(failed.status, EntryStatus::Error);
        assert_eq!(failed.error.as_ref().unwrap().message, "Network Error");
        {
            let events = h.events.lock();
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].severity, Severity::Error);
            assert_eq!(events[0].message, "Error fetching tickets: Network Error");
        }

        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let retry = {
            let started = started.clone();
            let release = release.clone();
            h.executor
                .run(QueryDescriptor::new(tickets_key(), move || async move {
                    started.notify_one();
                    release.notified().await;
                    Ok(json!({"tickets": []}))
                }))
        };
        let observer = async {
            started.notified().await;
            let during = h.executor.cache().get(&tickets_key()).unwrap().status;
            release.notify_one();
            during
        };
        let (recovered, during) = tokio::join!(retry, observer);

        assert_eq!(during, EntryStatus::Loading);
        assert_eq!(recovered.status, EntryStatus::Success);
        assert_eq!(recovered.error, None);
        assert_eq!(h.events.lock().len(), 1);
    }

    #[tokio::test]
    async fn failure_keeps_last_good_data() {
        let h = harness(Duration::ZERO);
        h.executor
            .run(QueryDescriptor::new(tickets_key(), || async { Ok(json!(["t1"])) }))
            .await;

        let entry = h
            .executor
            .run(QueryDescriptor::new(tickets_key(), || async {
                Err::<Value, _>(network_error())
            }))
            .await;

        assert_eq!(entry.status, EntryStatus::Error);
        assert_eq!(entry.data, Some(json!(["t1"])));
    }

    #[tokio::test]
    async fn superseded_response_is_discarded() {
        let h = harness(Duration::ZERO);
        let release_old = Arc::new(Notify::new());
        let old_started = Arc::new(Notify::new());

        let old_run = {
            let release_old = release_old.clone();
            let old_started = old_started.clone();
            let executor = h.executor.clone();
            tokio::spawn(async move {
                executor
                    .run(QueryDescriptor::new(tickets_key(), move || async move {
                        old_started.notify_one();
                        release_old.notified().await;
                        Ok(json!("from g1"))
                    }))
                    .await
            })
        };
        old_started.notified().await;
        assert_eq!(h.executor.cache().generation(&tickets_key()), 0);

        let idle = h
            .executor
            .run(
                QueryDescriptor::new(tickets_key(), || async { Ok(json!("unused")) })
                    .enabled(false),
            )
            .await;
        assert_eq!(idle.status, EntryStatus::Idle);

        let current = h
            .executor
            .run(QueryDescriptor::new(tickets_key(), || async { Ok(json!("from g2")) }))
            .await;
        assert_eq!(h.executor.cache().generation(&tickets_key()), 1);
        assert_eq!(current.data, Some(json!("from g2")));

        release_old.notify_one();
        let old = old_run.await.unwrap();

        assert_eq!(old.data, Some(json!("from g2")));
        assert_eq!(
            h.executor.cache().get(&tickets_key()).unwrap().data,
            Some(json!("from g2"))
        );
    }

    #[tokio::test]
    async fn superseded_failure_is_not_notified() {
        let h = harness(Duration::ZERO);
        let release = Arc::new(Notify::new());
        let started = Arc::new(Notify::new());

        let run = {
            let release = release.clone();
            let started = started.clone();
            let executor = h.executor.clone();
            tokio::spawn(async move {
                executor
                    .run(QueryDescriptor::new(tickets_key(), move || async move {
                        started.notify_one();
                        release.notified().await;
                        Err::<Value, _>(network_error())
                    }))
                    .await
            })
        };
        started.notified().await;
        h.executor.cache().supersede_all();
        release.notify_one();
        run.await.unwrap();

        assert!(h.events.lock().is_empty());
    }

    fn explodes_before_returning() -> futures::future::Ready<Result<Value, ResourceError>> {
        panic!("descriptor blew up");
    }

    #[tokio::test]
    async fn panicking_fetch_settles_as_error_and_frees_the_key() {
        let h = harness(Duration::from_secs(60));

        let failed = h
            .executor
            .run(
                QueryDescriptor::new(tickets_key(), explodes_before_returning)
                    .error_context("Error fetching tickets"),
            )
            .await;

        assert_eq!(failed.status, EntryStatus::Error);
        assert_eq!(failed.error.as_ref().unwrap().message, "fetch panicked");
        assert_eq!(
            h.events.lock()[0].message,
            "Error fetching tickets: fetch panicked"
        );

        let recovered = h
            .executor
            .run(QueryDescriptor::new(tickets_key(), || async {
                Ok(json!({"tickets": []}))
            }))
            .await;
        assert_eq!(recovered.status, EntryStatus::Success);
        assert_eq!(recovered.data, Some(json!({"tickets": []})));
    }

    fn empty_notice(data: &Value) -> Option<String> {
        (data["tickets"] == json!([])).then(|| "No tickets found".to_string())
    }

    #[tokio::test]
    async fn success_notice_only_follows_applied_results() {
        let h = harness(Duration::ZERO);
        let release = Arc::new(Notify::new());
        let started = Arc::new(Notify::new());

        let run = {
            let release = release.clone();
            let started = started.clone();
            let executor = h.executor.clone();
            tokio::spawn(async move {
                executor
                    .run(
                        QueryDescriptor::new(tickets_key(), move || async move {
                            started.notify_one();
                            release.notified().await;
                            Ok(json!({"tickets": []}))
                        })
                        .success_notice(empty_notice),
                    )
                    .await
            })
        };
        started.notified().await;
        h.executor.cache().supersede_all();
        release.notify_one();
        run.await.unwrap();
        assert!(h.events.lock().is_empty());

        h.executor
            .run(
                QueryDescriptor::new(tickets_key(), || async { Ok(json!({"tickets": []})) })
                    .success_notice(empty_notice),
            )
            .await;

        let events = h.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].severity, Severity::Info);
        assert_eq!(events[0].message, "No tickets found");
    }
}
