//! The permanents table: a bidirectional map between objects that must not
//! be inlined into a stream (native closures, the builtin globals,
//! well-known metatables, base-image prototypes) and the short keys that
//! stand in for them.

use hashbrown::HashMap;

use crate::error::{VmError, VmResult};
use crate::heap::GcRef;
use crate::value::Value;

/// Bidirectional permanents mapping.
#[derive(Default)]
pub struct Permanents {
    by_object: HashMap<GcRef, String>,
    by_key: HashMap<String, GcRef>,
}

pub(crate) fn gcref_to_value(object: GcRef) -> Option<Value> {
    match object {
        GcRef::String(r) => Some(Value::String(r)),
        GcRef::Table(r) => Some(Value::Table(r)),
        GcRef::Closure(r) => Some(Value::Closure(r)),
        GcRef::Thread(r) => Some(Value::Thread(r)),
        GcRef::Userdata(r) => Some(Value::Userdata(r)),
        GcRef::Buffer(r) => Some(Value::Buffer(r)),
        GcRef::Upvalue(_) | GcRef::Proto(_) => None,
    }
}

impl Permanents {
    /// Creates an empty table.
    pub fn new() -> Self {
        Permanents::default()
    }

    /// Registers a collectable value under a short key, in both directions.
    pub fn register(&mut self, key: &str, value: Value) -> VmResult<()> {
        let object = GcRef::from_value(value).ok_or_else(|| {
            VmError::persist(format!("permanent '{key}' must be a collectable value"))
        })?;
        self.register_object(key, object)
    }

    /// Registers a heap object (including prototypes) under a short key.
    pub fn register_object(&mut self, key: &str, object: GcRef) -> VmResult<()> {
        if self.by_key.contains_key(key) {
            return Err(VmError::persist(format!(
                "permanent key '{key}' registered twice"
            )));
        }
        self.by_object.insert(object, key.to_string());
        self.by_key.insert(key.to_string(), object);
        Ok(())
    }

    /// The key standing in for an object, if registered.
    pub fn key_for(&self, object: GcRef) -> Option<&str> {
        self.by_object.get(&object).map(String::as_str)
    }

    /// The local object standing in for a key, if registered.
    pub fn object_for(&self, key: &str) -> Option<GcRef> {
        self.by_key.get(key).copied()
    }

    /// The local object as a value, for keys naming value-kind objects.
    pub fn value_for(&self, key: &str) -> Option<Value> {
        self.object_for(key).and_then(gcref_to_value)
    }

    /// Number of registered permanents.
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Every registered object, for rooting during collection.
    pub fn objects(&self) -> impl Iterator<Item = GcRef> + '_ {
        self.by_object.keys().copied()
    }
}
