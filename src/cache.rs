use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use futures::future::{BoxFuture, Shared};
use serde_json::Value;
use tracing::debug;

use crate::types::{CacheEntry, CacheKey, EntryStatus, ErrorInfo};

/// Handle on a fetch that is currently running for some key. Every waiter
/// polls the same underlying task and observes the same entry.
pub type InFlight = Shared<BoxFuture<'static, CacheEntry>>;

#[derive(Default)]
struct Slot {
    entry: Option<CacheEntry>,
    generation: u64,
    in_flight: Option<InFlight>,
}

/// Outcome of delivering a fetch result back to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    Applied(CacheEntry),
    /// The key moved to a newer generation while the fetch was running; the
    /// result was dropped. Carries the entry as it currently stands.
    Superseded(CacheEntry),
}

#[derive(Clone)]
pub struct ResourceCache {
    slots: Arc<DashMap<CacheKey, Slot>>,
    resource_index: Arc<DashMap<String, DashSet<CacheKey>>>,
    stale_time: Duration,
}

impl Default for ResourceCache {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl ResourceCache {
    /// `stale_time` is how long a successful entry is served without a
    /// refetch. Zero means every run goes back to the API.
    pub fn new(stale_time: Duration) -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            resource_index: Arc::new(DashMap::new()),
            stale_time,
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.slots.get(key)?.entry.clone()
    }

    pub fn put(&self, key: CacheKey, entry: CacheEntry) {
        self.slots.entry(key.clone()).or_default().entry = Some(entry);
        self.index(&key);
    }

    /// Marks the given entries stale. Data is kept so consumers can keep
    /// showing the last good value while the refetch runs.
    pub fn invalidate<'a, I>(&self, keys: I) -> usize
    where
        I: IntoIterator<Item = &'a CacheKey>,
    {
        let mut marked = 0;
        for key in keys {
            if let Some(mut slot) = self.slots.get_mut(key) {
                if let Some(entry) = slot.entry.as_mut() {
                    entry.stale = true;
                    marked += 1;
                }
            }
            debug!(%key, "invalidated");
        }
        marked
    }

    /// Marks every entry of one resource stale, whatever its remaining key
    /// parts, and returns the affected keys.
    pub fn invalidate_resource(&self, resource: &str) -> Vec<CacheKey> {
        let keys: Vec<CacheKey> = match self.resource_index.get(resource) {
            Some(set) => set.iter().map(|k| k.key().clone()).collect(),
            None => return Vec::new(),
        };

        self.invalidate(&keys);
        keys
    }

    pub fn is_fresh(&self, entry: &CacheEntry) -> bool {
        if entry.status != EntryStatus::Success || entry.stale {
            return false;
        }
        let Some(updated_at) = entry.updated_at else {
            return false;
        };
        let age = Utc::now().signed_duration_since(updated_at);
        match chrono::Duration::from_std(self.stale_time) {
            Ok(window) => age < window,
            Err(_) => true,
        }
    }

    /// Returns the running fetch for `key`, or moves the entry to `Loading`
    /// and registers the one produced by `start`. `start` receives the
    /// generation the new fetch belongs to.
    pub fn join_or_start<F>(&self, key: &CacheKey, start: F) -> InFlight
    where
        F: FnOnce(u64) -> InFlight,
    {
        let mut slot = self.slots.entry(key.clone()).or_default();

        if let Some(in_flight) = &slot.in_flight {
            debug!(%key, "attaching to in-flight fetch");
            return in_flight.clone();
        }

        let generation = slot.generation;
        let entry = slot
            .entry
            .get_or_insert_with(|| CacheEntry::idle(key.clone()));
        entry.status = EntryStatus::Loading;

        let in_flight = start(generation);
        slot.in_flight = Some(in_flight.clone());
        drop(slot);

        self.index(key);
        debug!(%key, generation, "fetch started");
        in_flight
    }

    pub fn settle(
        &self,
        key: &CacheKey,
        generation: u64,
        result: Result<Value, ErrorInfo>,
    ) -> Settlement {
        let Some(mut slot) = self.slots.get_mut(key) else {
            return Settlement::Superseded(CacheEntry::idle(key.clone()));
        };

        if slot.generation != generation {
            debug!(%key, generation, current = slot.generation, "dropping superseded result");
            let current = slot
                .entry
                .clone()
                .unwrap_or_else(|| CacheEntry::idle(key.clone()));
            return Settlement::Superseded(current);
        }

        slot.in_flight = None;
        let entry = slot
            .entry
            .get_or_insert_with(|| CacheEntry::idle(key.clone()));

        match result {
            Ok(data) => {
                entry.data = Some(data);
                entry.status = EntryStatus::Success;
                entry.error = None;
                entry.stale = false;
                entry.updated_at = Some(Utc::now());
            }
            Err(error) => {
                entry.status = EntryStatus::Error;
                entry.error = Some(error);
            }
        }

        Settlement::Applied(entry.clone())
    }

    /// Gates `key` off: bumps its generation so a running fetch can no longer
    /// write, and parks the entry in `Idle` with its data intact.
    pub fn disable(&self, key: &CacheKey) -> CacheEntry {
        let Some(mut slot) = self.slots.get_mut(key) else {
            return CacheEntry::idle(key.clone());
        };

        slot.generation += 1;
        if slot.in_flight.take().is_some() {
            debug!(%key, generation = slot.generation, "in-flight fetch detached");
        }

        match slot.entry.as_mut() {
            Some(entry) => {
                entry.status = EntryStatus::Idle;
                entry.clone()
            }
            None => CacheEntry::idle(key.clone()),
        }
    }

    /// Supersedes every running fetch. Used when the session identity
    /// changes, so no response for the previous identity lands in the store.
    pub fn supersede_all(&self) -> usize {
        let mut detached = 0;
        for mut slot in self.slots.iter_mut() {
            if slot.in_flight.take().is_some() {
                slot.generation += 1;
                if let Some(entry) = slot.entry.as_mut() {
                    entry.status = EntryStatus::Idle;
                }
                detached += 1;
            }
        }
        debug!(detached, "superseded in-flight fetches");
        detached
    }

    pub fn generation(&self, key: &CacheKey) -> u64 {
        self.slots.get(key).map_or(0, |slot| slot.generation)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn index(&self, key: &CacheKey) {
        if let Some(resource) = key.resource() {
            self.resource_index
                .entry(resource.to_owned())
                .or_default()
                .insert(key.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use futures::FutureExt;
    use serde_json::json;

    use super::*;
    use crate::types::ErrorKind;

    fn key(resource: &str, identity: &str) -> CacheKey {
        CacheKey::new(resource).with(identity)
    }

    fn success(key: &CacheKey, data: serde_json::Value) -> CacheEntry {
        CacheEntry {
            key: key.clone(),
            data: Some(data),
            status: EntryStatus::Success,
            error: None,
            stale: false,
            updated_at: Some(Utc::now()),
        }
    }

    fn ready(entry: CacheEntry) -> InFlight {
        futures::future::ready(entry).boxed().shared()
    }

    #[test]
    fn put_then_get_returns_equal_entry() {
        let cache = ResourceCache::default();
        let k = key("tickets", "user-1");
        let entry = success(&k, json!({"tickets": []}));

        cache.put(k.clone(), entry.clone());
        assert_eq!(cache.get(&k), Some(entry));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn invalidate_marks_stale_and_keeps_data() {
        let cache = ResourceCache::new(Duration::from_secs(60));
        let k = key("tickets", "user-1");
        cache.put(k.clone(), success(&k, json!([1, 2])));

        assert_eq!(cache.invalidate([&k]), 1);

        let entry = cache.get(&k).unwrap();
        assert!(entry.stale);
        assert_eq!(entry.data, Some(json!([1, 2])));
        assert!(!cache.is_fresh(&entry));
    }

    #[test]
    fn invalidate_unknown_key_marks_nothing() {
        let cache = ResourceCache::default();
        assert_eq!(cache.invalidate([&key("tickets", "nobody")]), 0);
    }

    #[test]
    fn invalidate_resource_only_touches_that_resource() {
        let cache = ResourceCache::new(Duration::from_secs(60));
        let user_a = key("user", "a");
        let user_b = key("user", "b");
        let tickets = key("tickets", "a");
        for k in [&user_a, &user_b, &tickets] {
            cache.put(k.clone(), success(k, json!({})));
        }

        let mut touched = cache.invalidate_resource("user");
        touched.sort_by_key(|k| k.to_string());

        assert_eq!(touched, vec![user_a.clone(), user_b.clone()]);
        assert!(cache.get(&user_a).unwrap().stale);
        assert!(!cache.get(&tickets).unwrap().stale);
    }

    #[test]
    fn freshness_follows_stale_time() {
        let k = key("projects", "a");
        let entry = success(&k, json!([]));

        assert!(ResourceCache::new(Duration::from_secs(60)).is_fresh(&entry));
        assert!(!ResourceCache::new(Duration::ZERO).is_fresh(&entry));

        let mut errored = entry.clone();
        errored.status = EntryStatus::Error;
        assert!(!ResourceCache::new(Duration::from_secs(60)).is_fresh(&errored));
    }

    #[tokio::test]
    async fn second_start_attaches_to_running_fetch() {
        let cache = ResourceCache::default();
        let k = key("tickets", "a");
        let mut starts = 0;

        let first = cache.join_or_start(&k, |_| {
            starts += 1;
            ready(success(&k, json!(1)))
        });
        let second = cache.join_or_start(&k, |_| {
            starts += 1;
            ready(success(&k, json!(2)))
        });

        assert_eq!(starts, 1);
        assert_eq!(cache.get(&k).unwrap().status, EntryStatus::Loading);
        assert_eq!(first.await, second.await);
    }

    #[test]
    fn settle_applies_success_and_clears_error() {
        let cache = ResourceCache::default();
        let k = key("ticket", "a");
        let _ = cache.join_or_start(&k, |_| ready(CacheEntry::idle(k.clone())));
        cache.settle(
            &k,
            0,
            Err(ErrorInfo::new(ErrorKind::Network, "Network Error")),
        );

        let _ = cache.join_or_start(&k, |_| ready(CacheEntry::idle(k.clone())));
        let settled = cache.settle(&k, 0, Ok(json!({"id": "t1"})));

        let Settlement::Applied(entry) = settled else {
            panic!("expected result to apply");
        };
        assert_eq!(entry.status, EntryStatus::Success);
        assert_eq!(entry.error, None);
        assert_eq!(entry.data, Some(json!({"id": "t1"})));
    }

    #[test]
    fn error_keeps_previous_data() {
        let cache = ResourceCache::default();
        let k = key("projects", "a");
        cache.put(k.clone(), success(&k, json!(["p1"])));

        let _ = cache.join_or_start(&k, |_| ready(CacheEntry::idle(k.clone())));
        cache.settle(&k, 0, Err(ErrorInfo::new(ErrorKind::Api, "boom")));

        let entry = cache.get(&k).unwrap();
        assert_eq!(entry.status, EntryStatus::Error);
        assert_eq!(entry.data, Some(json!(["p1"])));
    }

    #[test]
    fn disable_supersedes_running_fetch() {
        let cache = ResourceCache::default();
        let k = key("user", "a");
        let _ = cache.join_or_start(&k, |g| {
            assert_eq!(g, 0);
            ready(CacheEntry::idle(k.clone()))
        });

        let parked = cache.disable(&k);
        assert_eq!(parked.status, EntryStatus::Idle);
        assert_eq!(cache.generation(&k), 1);

        let settled = cache.settle(&k, 0, Ok(json!("late")));
        assert!(matches!(settled, Settlement::Superseded(ref e) if e.data.is_none()));
        assert_eq!(cache.get(&k).unwrap().data, None);
    }

    #[test]
    fn disable_of_unknown_key_creates_nothing() {
        let cache = ResourceCache::default();
        let entry = cache.disable(&CacheKey::new("user").with(None::<&str>));
        assert_eq!(entry.status, EntryStatus::Idle);
        assert!(cache.is_empty());
    }

    #[test]
    fn supersede_all_only_touches_running_fetches() {
        let cache = ResourceCache::default();
        let running = key("tickets", "a");
        let settled = key("projects", "a");
        cache.put(settled.clone(), success(&settled, json!([])));
        let _ = cache.join_or_start(&running, |_| ready(CacheEntry::idle(running.clone())));

        assert_eq!(cache.supersede_all(), 1);
        assert_eq!(cache.generation(&running), 1);
        assert_eq!(cache.generation(&settled), 0);
        assert_eq!(cache.get(&settled).unwrap().status, EntryStatus::Success);
    }
}
