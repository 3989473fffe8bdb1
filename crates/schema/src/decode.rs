use std::collections::BTreeMap;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use metrics::counter;
use roster_core::{DynPayload, Manifest, ManifestError, Metadata, PayloadField, ResourceKey};
use serde::de::DeserializeOwned;
use serde_yaml::Value as Yaml;
use tracing::debug;

use crate::registry::{PayloadShape, TypeRegistry};

const DEFAULT_MAX_BYTES: usize = 1 << 20;
const DEFAULT_MAX_NODES: usize = 100_000;

fn env_limit(var: &str, default: usize) -> usize {
    std::env::var(var).ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(default)
}

/// Whether `doc` holds more than `max` values. Mapping keys are not counted.
fn node_budget_exceeded(doc: &Yaml, max: usize) -> bool {
    let mut pending = vec![doc];
    let mut seen = 0usize;
    while let Some(node) = pending.pop() {
        seen += 1;
        if seen > max {
            return true;
        }
        match node {
            Yaml::Mapping(map) => pending.extend(map.values()),
            Yaml::Sequence(seq) => pending.extend(seq.iter()),
            Yaml::Tagged(tagged) => pending.push(&tagged.value),
            _ => {}
        }
    }
    false
}

/// Size guards applied before a document is decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeLimits {
    pub max_bytes: usize,
    pub max_nodes: usize,
}

impl DecodeLimits {
    /// Reads `ROSTER_MAX_MANIFEST_BYTES` and `ROSTER_MAX_MANIFEST_NODES`.
    pub fn from_env() -> Self {
        Self {
            max_bytes: env_limit("ROSTER_MAX_MANIFEST_BYTES", DEFAULT_MAX_BYTES),
            max_nodes: env_limit("ROSTER_MAX_MANIFEST_NODES", DEFAULT_MAX_NODES),
        }
    }

    pub fn unlimited() -> Self { Self { max_bytes: usize::MAX, max_nodes: usize::MAX } }
}

impl Default for DecodeLimits {
    fn default() -> Self { Self::from_env() }
}

/// Failures that abort a single decode call. Payload problems are not fatal
/// and end up in [`Manifest::errors`] instead.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("reading manifest from {}: {source}", path.display())]
    File { path: PathBuf, source: io::Error },
    #[error("reading manifest: {0}")]
    Io(#[from] io::Error),
    #[error("parsing manifest: {0}")]
    Syntax(#[from] serde_yaml::Error),
    #[error("manifest {0}")]
    Envelope(String),
    #[error("manifest too large (>{max} bytes)")]
    TooLarge { max: usize },
    #[error("manifest too complex (>{max} nodes)")]
    TooComplex { max: usize },
}

/// Envelope fields plus the still-untyped payload subtrees.
#[derive(Debug)]
struct RawManifest {
    api_version: String,
    kind: String,
    metadata: Metadata,
    spec: Option<Yaml>,
    status: Option<Yaml>,
    errors: Vec<ManifestError>,
}

fn scalar_string(v: &Yaml) -> Option<String> {
    match v {
        Yaml::String(s) => Some(s.clone()),
        Yaml::Number(n) => Some(n.to_string()),
        Yaml::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn required_str(v: Option<&Yaml>, what: &str) -> Result<String, DecodeError> {
    match v {
        Some(Yaml::String(s)) => Ok(s.clone()),
        Some(Yaml::Null) | None => Err(DecodeError::Envelope(format!("missing {}", what))),
        Some(_) => Err(DecodeError::Envelope(format!("{} must be a string", what))),
    }
}

impl RawManifest {
    fn from_document(mut doc: Yaml) -> Result<Self, DecodeError> {
        let api_version = required_str(doc.get("apiVersion"), "apiVersion")?;
        let kind = required_str(doc.get("kind"), "kind")?;
        let meta = doc.get("metadata");
        let name = required_str(meta.and_then(|m| m.get("name")), "metadata.name")?;
        let labels = match meta.and_then(|m| m.get("labels")) {
            None | Some(Yaml::Null) => BTreeMap::new(),
            Some(Yaml::Mapping(map)) => {
                let mut out = BTreeMap::new();
                for (k, v) in map.iter() {
                    match (scalar_string(k), scalar_string(v)) {
                        (Some(k), Some(v)) => { out.insert(k, v); }
                        _ => return Err(DecodeError::Envelope("metadata.labels must map strings to strings".into())),
                    }
                }
                out
            }
            Some(_) => return Err(DecodeError::Envelope("metadata.labels must be a mapping".into())),
        };
        let errors = match doc.get("errors") {
            Some(Yaml::Sequence(items)) => items.iter().map(carried_error).collect(),
            _ => Vec::new(),
        };
        let (spec, status) = match doc.as_mapping_mut() {
            Some(map) => (map.remove("spec"), map.remove("status")),
            None => (None, None),
        };
        Ok(Self { api_version, kind, metadata: Metadata { name, labels }, spec, status, errors })
    }

    fn resource_key(&self) -> ResourceKey { ResourceKey::new(self.api_version.clone(), self.kind.clone()) }

    fn envelope<S, T>(self, spec: S, status: T, errors: Vec<ManifestError>) -> Manifest<S, T> {
        let mut all = self.errors;
        all.extend(errors);
        Manifest { api_version: self.api_version, kind: self.kind, metadata: self.metadata, spec, status, errors: all }
    }
}

/// Errors already present in a source document, e.g. a manifest echoed back
/// by a remote pool.
fn carried_error(item: &Yaml) -> ManifestError {
    match item {
        Yaml::String(s) => ManifestError::Message { message: s.clone() },
        other => serde_yaml::from_value::<ManifestError>(other.clone()).unwrap_or_else(|e| ManifestError::Message {
            message: format!("unrecognized error entry: {}", e),
        }),
    }
}

fn decode_typed<P: DeserializeOwned + Default>(
    node: Option<&Yaml>,
    field: PayloadField,
    errors: &mut Vec<ManifestError>,
) -> P {
    let res = match node {
        None | Some(Yaml::Null) => return P::default(),
        Some(node) => serde_yaml::from_value::<P>(node.clone()),
    };
    res.unwrap_or_else(|e| {
        errors.push(payload_error(field, std::any::type_name::<P>(), &e));
        P::default()
    })
}

fn decode_shape(
    shape: Option<PayloadShape>,
    node: Option<&Yaml>,
    field: PayloadField,
    key: &ResourceKey,
    errors: &mut Vec<ManifestError>,
) -> DynPayload {
    let Some(shape) = shape else {
        debug!(key = %key, field = %field, "no registered shape");
        counter!("roster_decode_payload_errors_total", 1u64);
        errors.push(ManifestError::UnresolvedType { field, key: key.clone() });
        return DynPayload::unset();
    };
    shape.decode(node).unwrap_or_else(|e| {
        errors.push(payload_error(field, shape.type_name(), &e));
        DynPayload::unset()
    })
}

fn payload_error(field: PayloadField, type_name: &str, e: &serde_yaml::Error) -> ManifestError {
    debug!(field = %field, type_name, error = %e, "payload decode failed");
    counter!("roster_decode_payload_errors_total", 1u64);
    ManifestError::PayloadDecode { field, type_name: type_name.to_string(), message: e.to_string() }
}

/// Turns YAML/JSON bytes into manifests.
#[derive(Debug, Clone, Copy, Default)]
pub struct Decoder {
    limits: DecodeLimits,
}

impl Decoder {
    pub fn new(limits: DecodeLimits) -> Self { Self { limits } }

    pub fn limits(&self) -> DecodeLimits { self.limits }

    fn document(&self, bytes: &[u8]) -> Result<RawManifest, DecodeError> {
        let res = self.document_inner(bytes);
        if let Err(e) = &res {
            debug!(error = %e, "manifest decode aborted");
            counter!("roster_decode_errors_total", 1u64);
        }
        res
    }

    fn document_inner(&self, bytes: &[u8]) -> Result<RawManifest, DecodeError> {
        if bytes.len() > self.limits.max_bytes {
            return Err(DecodeError::TooLarge { max: self.limits.max_bytes });
        }
        let doc: Yaml = serde_yaml::from_slice(bytes)?;
        if node_budget_exceeded(&doc, self.limits.max_nodes) {
            return Err(DecodeError::TooComplex { max: self.limits.max_nodes });
        }
        RawManifest::from_document(doc)
    }

    fn read<R: Read>(&self, reader: R) -> Result<Vec<u8>, DecodeError> {
        // One byte past the limit is enough to report TooLarge
        let cap = (self.limits.max_bytes as u64).saturating_add(1);
        let mut buf = Vec::new();
        reader.take(cap).read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>, DecodeError> {
        std::fs::read(path).map_err(|source| DecodeError::File { path: path.to_path_buf(), source })
    }

    /// Decode with caller-chosen spec/status types.
    pub fn parse<S, T>(&self, bytes: impl AsRef<[u8]>) -> Result<Manifest<S, T>, DecodeError>
    where
        S: DeserializeOwned + Default,
        T: DeserializeOwned + Default,
    {
        let raw = self.document(bytes.as_ref())?;
        let mut errors = Vec::new();
        let spec = decode_typed::<S>(raw.spec.as_ref(), PayloadField::Spec, &mut errors);
        let status = decode_typed::<T>(raw.status.as_ref(), PayloadField::Status, &mut errors);
        Ok(raw.envelope(spec, status, errors))
    }

    pub fn parse_reader<S, T, R>(&self, reader: R) -> Result<Manifest<S, T>, DecodeError>
    where
        S: DeserializeOwned + Default,
        T: DeserializeOwned + Default,
        R: Read,
    {
        let bytes = self.read(reader)?;
        self.parse(bytes)
    }

    pub fn parse_file<S, T>(&self, path: impl AsRef<Path>) -> Result<Manifest<S, T>, DecodeError>
    where
        S: DeserializeOwned + Default,
        T: DeserializeOwned + Default,
    {
        let bytes = self.read_file(path.as_ref())?;
        self.parse(bytes)
    }

    /// Decode with the shapes registered for the document's resource key.
    ///
    /// A missing registry or registration is recorded per payload half in the
    /// manifest's errors; the envelope is still returned.
    pub fn auto_parse(&self, bytes: impl AsRef<[u8]>, registry: Option<&TypeRegistry>) -> Result<Manifest, DecodeError> {
        let raw = self.document(bytes.as_ref())?;
        let key = raw.resource_key();
        let registration = registry.and_then(|r| r.resolve(&key));
        let mut errors = Vec::new();
        let spec = decode_shape(registration.map(|r| r.spec), raw.spec.as_ref(), PayloadField::Spec, &key, &mut errors);
        let status =
            decode_shape(registration.map(|r| r.status), raw.status.as_ref(), PayloadField::Status, &key, &mut errors);
        Ok(raw.envelope(spec, status, errors))
    }

    pub fn auto_parse_reader<R: Read>(&self, reader: R, registry: Option<&TypeRegistry>) -> Result<Manifest, DecodeError> {
        let bytes = self.read(reader)?;
        self.auto_parse(bytes, registry)
    }

    pub fn auto_parse_file(&self, path: impl AsRef<Path>, registry: Option<&TypeRegistry>) -> Result<Manifest, DecodeError> {
        let bytes = self.read_file(path.as_ref())?;
        self.auto_parse(bytes, registry)
    }
}

pub fn parse_slice<S, T>(bytes: &[u8]) -> Result<Manifest<S, T>, DecodeError>
where
    S: DeserializeOwned + Default,
    T: DeserializeOwned + Default,
{
    Decoder::default().parse(bytes)
}

pub fn parse_str<S, T>(s: &str) -> Result<Manifest<S, T>, DecodeError>
where
    S: DeserializeOwned + Default,
    T: DeserializeOwned + Default,
{
    Decoder::default().parse(s)
}

pub fn parse_reader<S, T, R>(reader: R) -> Result<Manifest<S, T>, DecodeError>
where
    S: DeserializeOwned + Default,
    T: DeserializeOwned + Default,
    R: Read,
{
    Decoder::default().parse_reader(reader)
}

pub fn parse_file<S, T>(path: impl AsRef<Path>) -> Result<Manifest<S, T>, DecodeError>
where
    S: DeserializeOwned + Default,
    T: DeserializeOwned + Default,
{
    Decoder::default().parse_file(path)
}

/// Auto-decode against the global registry; without one, both payload halves
/// are reported as unresolved.
pub fn auto_parse_slice(bytes: &[u8]) -> Result<Manifest, DecodeError> {
    Decoder::default().auto_parse(bytes, TypeRegistry::global())
}

pub fn auto_parse_str(s: &str) -> Result<Manifest, DecodeError> {
    Decoder::default().auto_parse(s, TypeRegistry::global())
}

pub fn auto_parse_reader<R: Read>(reader: R) -> Result<Manifest, DecodeError> {
    Decoder::default().auto_parse_reader(reader, TypeRegistry::global())
}

pub fn auto_parse_file(path: impl AsRef<Path>) -> Result<Manifest, DecodeError> {
    Decoder::default().auto_parse_file(path, TypeRegistry::global())
}
