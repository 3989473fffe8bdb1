use roster_core::Manifest;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("encoding manifest as YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("encoding manifest as JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn to_yaml_string<S: Serialize, T: Serialize>(manifest: &Manifest<S, T>) -> Result<String, EncodeError> {
    Ok(serde_yaml::to_string(manifest)?)
}

pub fn to_json_vec<S: Serialize, T: Serialize>(manifest: &Manifest<S, T>) -> Result<Vec<u8>, EncodeError> {
    Ok(serde_json::to_vec(manifest)?)
}
