//! Roster schema: payload shape registry and the manifest decoder.
//!
//! Decoding happens in two steps. The envelope (`apiVersion`, `kind`,
//! `metadata`) is parsed structurally while `spec` and `status` are kept as
//! untyped YAML subtrees; those are then decoded into either caller-chosen
//! types ([`parse_slice`] and friends) or the shapes registered for the
//! manifest's resource key ([`TypeRegistry::auto_parse`]).
//!
//! YAML and JSON are both accepted; JSON is parsed as YAML.

#![forbid(unsafe_code)]

mod decode;
mod encode;
mod registry;

pub use decode::{
    auto_parse_file, auto_parse_reader, auto_parse_slice, auto_parse_str, parse_file, parse_reader, parse_slice,
    parse_str, DecodeError, DecodeLimits, Decoder,
};
pub use encode::{to_json_vec, to_yaml_string, EncodeError};
pub use registry::{PayloadShape, Registration, RegistryError, TypeRegistry};
