//! Name-keyed immutable schema storage with post-registration freeze
//! (spec.md §9 REDESIGN FLAGS: "Registries with post-registration freeze").
//!
//! A registry is mutable until the first driver starts, at which point
//! `freeze()` is called once; further registration attempts are rejected
//! with `ConfigurationError` rather than silently racing with readers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::domain::errors::EngineError;

pub struct Registry<T: ?Sized> {
    entries: RwLock<HashMap<String, Arc<T>>>,
    frozen: AtomicBool,
}

impl<T: ?Sized> Default for Registry<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            frozen: AtomicBool::new(false),
        }
    }
}

impl<T: ?Sized> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, value: Arc<T>) -> Result<(), EngineError> {
        if self.frozen.load(Ordering::Acquire) {
            return Err(EngineError::Configuration {
                reason: "registry is frozen; registration must happen before first driver start"
                    .to_string(),
            });
        }
        self.entries
            .write()
            .expect("registry lock poisoned")
            .insert(name.into(), value);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<T>> {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn require(&self, name: &str) -> Result<Arc<T>, EngineError> {
        self.get(name).ok_or_else(|| EngineError::Configuration {
            reason: format!("no entry registered under name '{name}'"),
        })
    }

    /// One-way transition from mutable to frozen. Idempotent.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}
