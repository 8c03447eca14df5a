//! Type-erased values and their identities.
//!
//! Params and products cross the engine as [`Value`]s: an `Arc` of the typed
//! value plus its [`TypeKey`] and a content fingerprint. Two values are the
//! same memo key exactly when type and fingerprint match.

use crate::error::Failure;
use cairn_rule_graph::{ParamTypes, TypeKey};
use cairn_store::{FINGERPRINT_SIZE, Fingerprint};
use serde::Serialize;
use sha2::{Digest as _, Sha256};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Types that can flow through the engine as params or products.
///
/// Implemented for every type meeting the bounds. Serialization must be
/// deterministic, since it defines the value's identity.
pub trait Param: Serialize + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> Param for T where T: Serialize + Clone + fmt::Debug + Send + Sync + 'static {}

/// A type-erased engine value.
#[derive(Clone)]
pub struct Value {
    type_key: TypeKey,
    fingerprint: Fingerprint,
    inner: Arc<dyn Any + Send + Sync>,
}

impl Value {
    /// Wrap a typed value, computing its fingerprint
    ///
    /// # Errors
    ///
    /// Returns [`Failure::Serialization`] if the value cannot be serialized
    pub fn new<T: Param>(value: T) -> Result<Self, Failure> {
        let type_key = TypeKey::of::<T>();
        let json = serde_json::to_vec(&value).map_err(|e| Failure::Serialization {
            type_name: type_key.name(),
            message: e.to_string(),
        })?;
        let mut hasher = Sha256::new();
        hasher.update(type_key.full_name().as_bytes());
        hasher.update([0]);
        hasher.update(&json);
        let mut bytes = [0u8; FINGERPRINT_SIZE];
        bytes.copy_from_slice(&hasher.finalize());
        Ok(Self {
            type_key,
            fingerprint: Fingerprint(bytes),
            inner: Arc::new(value),
        })
    }

    /// The value's type
    #[must_use]
    pub const fn type_key(&self) -> TypeKey {
        self.type_key
    }

    /// The value's content fingerprint
    #[must_use]
    pub const fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Borrow the typed value
    #[must_use]
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// Clone out the typed value
    ///
    /// # Errors
    ///
    /// Returns [`Failure::TypeMismatch`] if the value is not a `T`
    pub fn downcast<T: Clone + 'static>(&self) -> Result<T, Failure> {
        self.downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| Failure::TypeMismatch {
                expected: TypeKey::of::<T>().name(),
                actual: self.type_key.name(),
            })
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.type_key == other.type_key && self.fingerprint == other.fingerprint
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_key.hash(state);
        self.fingerprint.hash(state);
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.type_key, short_hex(self.fingerprint))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

fn short_hex(fingerprint: Fingerprint) -> String {
    fingerprint.to_hex().chars().take(8).collect()
}

/// The params of a request, at most one per type.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Params(BTreeMap<TypeKey, Value>);

impl Params {
    /// No params
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Params holding a single value
    ///
    /// # Errors
    ///
    /// Returns [`Failure::Serialization`] if the value cannot be fingerprinted
    pub fn of<T: Param>(value: T) -> Result<Self, Failure> {
        Self::new().with(value)
    }

    /// Add (or replace) the param of type `T`
    ///
    /// # Errors
    ///
    /// Returns [`Failure::Serialization`] if the value cannot be fingerprinted
    pub fn with<T: Param>(mut self, value: T) -> Result<Self, Failure> {
        self.insert(Value::new(value)?);
        Ok(self)
    }

    /// Add (or replace) a param
    pub fn insert(&mut self, value: Value) {
        self.0.insert(value.type_key(), value);
    }

    /// The param of the given type
    #[must_use]
    pub fn get(&self, type_key: TypeKey) -> Option<&Value> {
        self.0.get(&type_key)
    }

    /// Types of all params
    #[must_use]
    pub fn types(&self) -> ParamTypes {
        self.0.keys().copied().collect()
    }

    /// Only the params whose types are in `keep`
    #[must_use]
    pub fn restrict(&self, keep: &ParamTypes) -> Self {
        Self(
            self.0
                .iter()
                .filter(|(key, _)| keep.contains(key))
                .map(|(key, value)| (*key, value.clone()))
                .collect(),
        )
    }

    /// Number of params
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no params
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the params in type order
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.0.values()
    }
}

impl fmt::Debug for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.values()).finish()
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.0.values().map(ToString::to_string).collect();
        write!(f, "({})", rendered.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;
    use std::collections::HashMap;

    #[derive(Debug, Clone, Serialize)]
    struct Name(String);

    #[derive(Debug, Clone, Serialize)]
    struct Other(String);

    #[derive(Debug, Clone, Serialize)]
    struct BadKeys(HashMap<(u8, u8), u8>);

    #[test]
    fn test_equal_content_is_same_value() {
        let a = Value::new(Name("x".into())).unwrap();
        let b = Value::new(Name("x".into())).unwrap();
        let c = Value::new(Name("y".into())).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_type_is_part_of_identity() {
        let a = Value::new(Name("x".into())).unwrap();
        let b = Value::new(Other("x".into())).unwrap();
        assert_ne!(a, b);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_downcast() {
        let value = Value::new(Name("x".into())).unwrap();
        assert_eq!(value.downcast::<Name>().unwrap().0, "x");
        assert!(matches!(
            value.downcast::<Other>(),
            Err(Failure::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_unserializable_value_fails() {
        let mut map = HashMap::new();
        map.insert((1, 2), 3);
        assert!(matches!(
            Value::new(BadKeys(map)),
            Err(Failure::Serialization { .. })
        ));
    }

    #[test]
    fn test_params_restrict_and_replace() {
        let params = Params::of(Name("a".into()))
            .unwrap()
            .with(Other("b".into()))
            .unwrap();
        assert_eq!(params.len(), 2);

        let keep: ParamTypes = [TypeKey::of::<Name>()].into_iter().collect();
        let restricted = params.restrict(&keep);
        assert_eq!(restricted.len(), 1);
        assert!(restricted.get(TypeKey::of::<Name>()).is_some());

        let replaced = params.with(Name("c".into())).unwrap();
        assert_eq!(replaced.len(), 2);
        let name = replaced.get(TypeKey::of::<Name>()).unwrap();
        assert_eq!(name.downcast::<Name>().unwrap().0, "c");
    }
}
