//! Roster core types: the manifest document model, its derived keys and the
//! lifecycle actions reported to pool observers.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

mod key;
mod payload;

pub use key::{ManifestKey, ResourceKey};
pub use payload::{DynPayload, ErasedPayload};

pub mod prelude {
    pub use super::{
        Action, DynPayload, Manifest, ManifestError, ManifestKey, Metadata, PayloadField, ResourceKey,
    };
}

/// Identity and annotations of a manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Unique within an (apiVersion, kind) pair.
    pub name: String,
    /// Free-form key/value annotations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// A versioned, typed, named document with spec/status payloads.
///
/// `S` and `T` are the spec and status shapes. Manifests decoded through the
/// type registry use [`DynPayload`] for both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest<S = DynPayload, T = DynPayload> {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: S,
    #[serde(default)]
    pub status: T,
    /// Non-fatal problems collected while decoding or handling the manifest.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ManifestError>,
}

impl<S: Default, T: Default> Manifest<S, T> {
    /// Envelope with default payloads and no labels.
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            metadata: Metadata { name: name.into(), labels: BTreeMap::new() },
            spec: S::default(),
            status: T::default(),
            errors: Vec::new(),
        }
    }
}

impl<S, T> Manifest<S, T> {
    pub fn resource_key(&self) -> ResourceKey {
        ResourceKey::new(self.api_version.clone(), self.kind.clone())
    }

    pub fn key(&self) -> ManifestKey {
        ManifestKey::new(self.api_version.clone(), self.kind.clone(), self.metadata.name.clone())
    }

    pub fn name(&self) -> &str { &self.metadata.name }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.labels.insert(key.into(), value.into());
        self
    }

    pub fn push_error(&mut self, err: ManifestError) { self.errors.push(err); }

    /// Append a free-form error message.
    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(ManifestError::Message { message: message.into() });
    }

    pub fn has_errors(&self) -> bool { !self.errors.is_empty() }

    /// Convert both payloads, keeping envelope and errors.
    pub fn map_payloads<S2, T2>(self, spec: impl FnOnce(S) -> S2, status: impl FnOnce(T) -> T2) -> Manifest<S2, T2> {
        Manifest {
            api_version: self.api_version,
            kind: self.kind,
            metadata: self.metadata,
            spec: spec(self.spec),
            status: status(self.status),
            errors: self.errors,
        }
    }
}

/// Lifecycle transition reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Created,
    Updated,
    Deleted,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Created => "created",
            Action::Updated => "updated",
            Action::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// Which half of the payload an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadField {
    Spec,
    Status,
}

impl fmt::Display for PayloadField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadField::Spec => f.write_str("spec"),
            PayloadField::Status => f.write_str("status"),
        }
    }
}

/// Non-fatal errors carried inside a manifest.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "camelCase")]
pub enum ManifestError {
    #[error("no type has been registered to decode {field} of {key}")]
    #[serde(rename_all = "camelCase")]
    UnresolvedType { field: PayloadField, key: ResourceKey },
    #[error("error decoding {field} into type {type_name}: {message}")]
    #[serde(rename_all = "camelCase")]
    PayloadDecode { field: PayloadField, type_name: String, message: String },
    #[error("{message}")]
    Message { message: String },
}
