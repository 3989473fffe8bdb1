use std::fmt;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

use once_cell::sync::OnceCell;
use roster_core::{DynPayload, Manifest, ResourceKey};
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_yaml::Value as Yaml;
use tracing::debug;

use crate::decode::{DecodeError, Decoder};

static GLOBAL: OnceCell<TypeRegistry> = OnceCell::new();

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("a global type registry has already been installed")]
    AlreadyInstalled,
}

/// Runtime descriptor of a payload type: how to make a fresh value and how to
/// decode one from a YAML subtree.
#[derive(Clone, Copy)]
pub struct PayloadShape {
    type_name: &'static str,
    fresh: fn() -> DynPayload,
    decode: fn(&Yaml) -> Result<DynPayload, serde_yaml::Error>,
}

impl PayloadShape {
    pub fn of<P>() -> Self
    where
        P: DeserializeOwned + Serialize + Default + fmt::Debug + Send + Sync + 'static,
    {
        Self {
            type_name: std::any::type_name::<P>(),
            fresh: || DynPayload::new(P::default()),
            decode: |node| serde_yaml::from_value::<P>(node.clone()).map(DynPayload::new),
        }
    }

    pub fn type_name(&self) -> &'static str { self.type_name }

    /// A default-valued instance of the shape.
    pub fn instantiate(&self) -> DynPayload { (self.fresh)() }

    /// Decode a subtree; an absent or `null` subtree yields a fresh instance.
    pub fn decode(&self, node: Option<&Yaml>) -> Result<DynPayload, serde_yaml::Error> {
        match node {
            None | Some(Yaml::Null) => Ok(self.instantiate()),
            Some(node) => (self.decode)(node),
        }
    }
}

impl fmt::Debug for PayloadShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PayloadShape").field(&self.type_name).finish()
    }
}

/// Spec and status shapes registered for one resource key.
#[derive(Debug, Clone, Copy)]
pub struct Registration {
    pub spec: PayloadShape,
    pub status: PayloadShape,
}

/// Maps resource keys to the payload shapes used by auto-decoding.
///
/// Registration overwrites (last one wins) and there is no removal. A single
/// process-wide instance can be installed with [`TypeRegistry::install_global`];
/// independent instances are fine for tests and embedding.
#[derive(Default)]
pub struct TypeRegistry {
    shapes: RwLock<FxHashMap<ResourceKey, Registration>>,
}

impl TypeRegistry {
    pub fn new() -> Self { Self::default() }

    /// Register the spec/status types for an apiVersion/kind pair.
    pub fn register<S, T>(&self, api_version: impl Into<String>, kind: impl Into<String>)
    where
        S: DeserializeOwned + Serialize + Default + fmt::Debug + Send + Sync + 'static,
        T: DeserializeOwned + Serialize + Default + fmt::Debug + Send + Sync + 'static,
    {
        let key = ResourceKey::new(api_version, kind);
        self.register_shapes(key, Registration { spec: PayloadShape::of::<S>(), status: PayloadShape::of::<T>() });
    }

    pub fn register_shapes(&self, key: ResourceKey, registration: Registration) {
        let mut shapes = self.shapes.write().unwrap_or_else(PoisonError::into_inner);
        debug!(
            key = %key,
            spec = registration.spec.type_name(),
            status = registration.status.type_name(),
            "registering payload shapes"
        );
        if let Some(prev) = shapes.insert(key.clone(), registration) {
            debug!(key = %key, prev_spec = prev.spec.type_name(), "replaced previous registration");
        }
    }

    pub fn resolve(&self, key: &ResourceKey) -> Option<Registration> {
        self.shapes.read().unwrap_or_else(PoisonError::into_inner).get(key).copied()
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.shapes.read().unwrap_or_else(PoisonError::into_inner).contains_key(key)
    }

    pub fn len(&self) -> usize { self.shapes.read().unwrap_or_else(PoisonError::into_inner).len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<ResourceKey> {
        let mut keys: Vec<ResourceKey> =
            self.shapes.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Install `self` as the process-wide registry used by the `auto_parse_*`
    /// free functions. Only the first call succeeds.
    pub fn install_global(self) -> Result<&'static TypeRegistry, RegistryError> {
        let mut installed = false;
        let global = GLOBAL.get_or_init(|| {
            installed = true;
            self
        });
        if installed { Ok(global) } else { Err(RegistryError::AlreadyInstalled) }
    }

    pub fn global() -> Option<&'static TypeRegistry> { GLOBAL.get() }

    /// Auto-decode a YAML/JSON document with the default decoder.
    pub fn auto_parse(&self, bytes: impl AsRef<[u8]>) -> Result<Manifest, DecodeError> {
        Decoder::default().auto_parse(bytes, Some(self))
    }

    pub fn auto_parse_reader<R: std::io::Read>(&self, reader: R) -> Result<Manifest, DecodeError> {
        Decoder::default().auto_parse_reader(reader, Some(self))
    }

    pub fn auto_parse_file(&self, path: impl AsRef<Path>) -> Result<Manifest, DecodeError> {
        Decoder::default().auto_parse_file(path, Some(self))
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry").field("keys", &self.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct Greeting {
        #[serde(default)]
        message: String,
    }

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct Counter {
        #[serde(default)]
        count: u32,
    }

    #[test]
    fn resolve_returns_registered_shapes() {
        let reg = TypeRegistry::new();
        assert!(reg.is_empty());
        reg.register::<Greeting, Counter>("example.com/v1alpha1", "MyManifest");
        let key = ResourceKey::new("example.com/v1alpha1", "MyManifest");
        let found = reg.resolve(&key).expect("registered");
        assert!(found.spec.type_name().ends_with("Greeting"));
        assert!(found.status.type_name().ends_with("Counter"));
        assert!(reg.resolve(&ResourceKey::new("example.com/v1alpha1", "Other")).is_none());
    }

    #[test]
    fn last_registration_wins() {
        let reg = TypeRegistry::new();
        reg.register::<Greeting, Greeting>("v1", "Thing");
        reg.register::<Counter, Counter>("v1", "Thing");
        assert_eq!(reg.len(), 1);
        let found = reg.resolve(&ResourceKey::new("v1", "Thing")).unwrap();
        assert!(found.spec.type_name().ends_with("Counter"));
    }

    #[test]
    fn shape_decodes_fresh_value_for_missing_subtree() {
        let shape = PayloadShape::of::<Greeting>();
        let fresh = shape.decode(None).unwrap();
        assert_eq!(fresh.downcast_ref::<Greeting>(), Some(&Greeting::default()));
        let null = shape.decode(Some(&Yaml::Null)).unwrap();
        assert_eq!(null.downcast_ref::<Greeting>(), Some(&Greeting::default()));
    }

    #[test]
    fn shape_decodes_subtree() {
        let node: Yaml = serde_yaml::from_str("message: hello").unwrap();
        let value = PayloadShape::of::<Greeting>().decode(Some(&node)).unwrap();
        assert_eq!(value.downcast_ref::<Greeting>().map(|g| g.message.as_str()), Some("hello"));
    }

    #[test]
    fn shape_reports_mismatch() {
        let node: Yaml = serde_yaml::from_str("count: [1, 2]").unwrap();
        assert!(PayloadShape::of::<Counter>().decode(Some(&node)).is_err());
    }

    #[test]
    fn keys_are_sorted() {
        let reg = TypeRegistry::new();
        reg.register::<Greeting, Greeting>("v2", "B");
        reg.register::<Greeting, Greeting>("v1", "A");
        let keys: Vec<String> = reg.keys().iter().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["v1/A", "v2/B"]);
    }
}
