//! Editable local state mirrored from a cached server resource.
//!
//! A form is seeded from the first entry it observes in `Success` and never
//! from an `Idle` or `Loading` one, so fields cannot silently initialize
//! empty while the resource is still on its way. Later refetches leave the
//! user's edits alone; `reset` arms the form for a fresh seed.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::types::CacheEntry;

#[derive(Debug, Error)]
pub enum FormError {
    #[error("form has not been loaded yet")]
    NotSeeded,
    #[error("unknown field: {0}")]
    UnknownField(String),
    #[error("patch must be a JSON object")]
    NotAnObject,
    #[error("invalid field value: {0}")]
    Invalid(#[from] serde_json::Error),
}

pub trait FormFields: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Builds the editable fields from a successful query payload.
    fn seed(data: &Value) -> Self;
}

#[derive(Debug, Clone)]
pub struct SeededForm<F> {
    fields: Option<F>,
}

impl<F> Default for SeededForm<F> {
    fn default() -> Self {
        Self { fields: None }
    }
}

impl<F: FormFields> SeededForm<F> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds the latest cache entry. Returns true when this call seeded the
    /// form.
    pub fn observe(&mut self, entry: &CacheEntry) -> bool {
        if self.fields.is_some() || !entry.is_success() {
            return false;
        }
        let Some(data) = entry.data.as_ref() else {
            return false;
        };

        self.fields = Some(F::seed(data));
        debug!(key = %entry.key, "form seeded");
        true
    }

    pub fn fields(&self) -> Option<&F> {
        self.fields.as_ref()
    }

    pub fn is_seeded(&self) -> bool {
        self.fields.is_some()
    }

    /// Overwrites the named fields. Unknown names are rejected rather than
    /// dropped.
    pub fn patch(&mut self, patch: &Value) -> Result<&F, FormError> {
        let fields = self.fields.as_ref().ok_or(FormError::NotSeeded)?;
        let Value::Object(changes) = patch else {
            return Err(FormError::NotAnObject);
        };

        let mut current = serde_json::to_value(fields)?;
        let Value::Object(map) = &mut current else {
            return Err(FormError::NotAnObject);
        };
        for (name, value) in changes {
            match map.get_mut(name) {
                Some(slot) => *slot = value.clone(),
                None => return Err(FormError::UnknownField(name.clone())),
            }
        }

        let updated: F = serde_json::from_value(current)?;
        Ok(self.fields.insert(updated))
    }

    pub fn reset(&mut self) {
        self.fields = None;
    }
}
