//! Generic string-keyed value store.
//!
//! The application-level counterpart of the per-connection context slot:
//! setup code stashes shared collaborators here and hands the store to
//! whatever wiring needs them. Values are opaque; readers downcast to the
//! type they expect.

use std::any::Any;
use std::collections::HashMap;

/// String-keyed store of opaque values.
#[derive(Default)]
pub struct AppContext {
    values: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl AppContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a value, downcast to the expected type. Returns `None` when
    /// the key is absent or holds a different type.
    pub fn get<T: 'static>(&self, key: &str) -> Option<&T> {
        self.values.get(key)?.downcast_ref()
    }

    /// Store a value, replacing any previous one under the same key.
    pub fn set(&mut self, key: impl Into<String>, value: Box<dyn Any + Send + Sync>) {
        self.values.insert(key.into(), value);
    }

    /// Remove a key. Returns whether it was present.
    pub fn delete(&mut self, key: &str) -> bool {
        self.values.remove(key).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_delete() {
        let mut ctx = AppContext::new();
        assert!(ctx.get::<u32>("missing").is_none());

        ctx.set("answer", Box::new(42u32));
        assert_eq!(ctx.get::<u32>("answer"), Some(&42));

        // Wrong type reads as absent.
        assert!(ctx.get::<String>("answer").is_none());

        assert!(ctx.delete("answer"));
        assert!(!ctx.delete("answer"));
        assert!(ctx.get::<u32>("answer").is_none());
    }

    #[test]
    fn test_set_replaces() {
        let mut ctx = AppContext::new();
        ctx.set("k", Box::new("first".to_string()));
        ctx.set("k", Box::new("second".to_string()));
        assert_eq!(ctx.get::<String>("k").map(String::as_str), Some("second"));
    }
}
