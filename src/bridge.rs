//! Application data bridge.
//!
//! The server carries no application state. Handlers reach the values they
//! serve through a pair of application-supplied accessors keyed by
//! hierarchical names such as `battery/level`. The accessors may be called
//! from the server loop thread at any time; thread safety inside them is the
//! application's responsibility.

use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use tracing::warn;

use crate::value::Value;

/// Returns the current value for a name, or `None` if the name is unknown.
pub type Getter = dyn Fn(&str) -> Option<Value> + Send + Sync;

/// Stores a new value for a name. Returns whether the value was accepted.
pub type Setter = dyn Fn(&str, Value) -> bool + Send + Sync;

/// Named-value accessors shared between the application and the server.
#[derive(Clone)]
pub struct DataBridge {
    get: Arc<Getter>,
    set: Arc<Setter>,
}

impl DataBridge {
    /// Creates a bridge from getter and setter functions.
    pub fn new(
        get: impl Fn(&str) -> Option<Value> + Send + Sync + 'static,
        set: impl Fn(&str, Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            get: Arc::new(get),
            set: Arc::new(set),
        }
    }

    /// Returns the value for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Value> {
        (self.get)(name)
    }

    /// Stores `value` under `name`. Returns whether the application accepted
    /// the value.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> bool {
        let accepted = (self.set)(name, value.into());
        if !accepted {
            warn!("Data setter rejected value for {name:?}");
        }
        accepted
    }

    /// Returns the `u8` value for `name` or `default` if the name is unknown
    /// or holds a different type.
    #[must_use]
    pub fn u8(&self, name: &str, default: u8) -> u8 {
        match self.get(name) {
            Some(Value::U8(v)) => v,
            _ => default,
        }
    }

    /// Returns the string value for `name` or `default` if the name is
    /// unknown or holds a different type.
    #[must_use]
    pub fn str(&self, name: &str, default: &str) -> String {
        match self.get(name) {
            Some(Value::Str(v)) => v,
            _ => default.to_owned(),
        }
    }

    /// Returns the value for `name` rendered as bytes, or `default` if the
    /// name is unknown or not byte-representable.
    #[must_use]
    pub fn bytes(&self, name: &str, default: &[u8]) -> Vec<u8> {
        (self.get(name).and_then(Value::into_bytes)).unwrap_or_else(|| default.to_vec())
    }
}

impl Debug for DataBridge {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataBridge")
            .field("get", &Arc::as_ptr(&self.get))
            .field("set", &Arc::as_ptr(&self.set))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SyncMutex;

    fn bridge() -> DataBridge {
        let level = Arc::new(SyncMutex::new(78_u8));
        let get = {
            let level = Arc::clone(&level);
            move |name: &str| (name == "battery/level").then(|| Value::U8(*level.lock()))
        };
        let set = move |name: &str, v: Value| match (name, v) {
            ("battery/level", Value::U8(x)) => {
                *level.lock() = x;
                true
            }
            _ => false,
        };
        DataBridge::new(get, set)
    }

    #[test]
    fn typed_accessors() {
        let b = bridge();
        assert_eq!(b.u8("battery/level", 0), 78);
        assert_eq!(b.u8("does/not/exist", 3), 3);
        assert_eq!(b.bytes("battery/level", &[]), vec![78]);
        assert_eq!(b.str("battery/level", "x"), "x");
    }

    #[test]
    fn set_round_trips() {
        let b = bridge();
        assert!(b.set("battery/level", 77_u8));
        assert_eq!(b.u8("battery/level", 0), 77);
        assert!(!b.set("text/string", "nope"));
    }
}
