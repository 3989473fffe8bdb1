use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Serialize, Serializer};

/// Object-safe view of a decoded payload value.
///
/// Implemented for every `Serialize + Debug + Send + Sync + 'static` type, so
/// any registered payload shape can live behind a [`DynPayload`].
pub trait ErasedPayload: Any + Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
    fn to_json(&self) -> Result<serde_json::Value, serde_json::Error>;
    fn type_name(&self) -> &'static str;
}

impl<P> ErasedPayload for P
where
    P: Any + Send + Sync + fmt::Debug + Serialize,
{
    fn as_any(&self) -> &dyn Any { self }

    fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> { serde_json::to_value(self) }

    fn type_name(&self) -> &'static str { std::any::type_name::<P>() }
}

/// Payload slot whose concrete shape is chosen at runtime.
///
/// Either unset (the default, also what a failed or unresolved decode leaves
/// behind) or a decoded value. The value is immutable and shared between
/// clones; replace it with [`DynPayload::new`] to change it.
#[derive(Clone, Default)]
pub struct DynPayload(Option<Arc<dyn ErasedPayload>>);

impl DynPayload {
    pub fn new<P: ErasedPayload>(value: P) -> Self {
        let value: Arc<dyn ErasedPayload> = Arc::new(value);
        Self(Some(value))
    }

    pub fn unset() -> Self { Self(None) }

    pub fn is_set(&self) -> bool { self.0.is_some() }

    pub fn downcast_ref<P: Any>(&self) -> Option<&P> {
        let value: &dyn ErasedPayload = self.0.as_deref()?;
        value.as_any().downcast_ref::<P>()
    }

    pub fn type_name(&self) -> Option<&'static str> {
        self.0.as_deref().map(|v| v.type_name())
    }

    /// JSON rendering of the value; `null` when unset.
    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self.0.as_deref() {
            Some(v) => v.to_json(),
            None => Ok(serde_json::Value::Null),
        }
    }
}

impl fmt::Debug for DynPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_deref() {
            Some(v) => fmt::Debug::fmt(v, f),
            None => f.write_str("<unset>"),
        }
    }
}

impl Serialize for DynPayload {
    fn serialize<Se: Serializer>(&self, serializer: Se) -> Result<Se::Ok, Se::Error> {
        match self.0.as_deref() {
            Some(v) => v.to_json().map_err(serde::ser::Error::custom)?.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }
}
