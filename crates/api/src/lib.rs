//! Roster HTTP surface.
//!
//! [`manifest_router`] exposes a pool behind a single `POST` endpoint: the
//! request body is decoded as a manifest, applied to the pool and echoed back
//! as JSON with any decode errors attached. [`ManifestClient`] is the sending
//! side, posting a manifest to `<endpoint>/<apiVersion>/<kind>`.

#![forbid(unsafe_code)]

mod client;
mod server;

pub use client::{ClientError, ManifestClient, DEFAULT_ENDPOINT, DEFAULT_USER_AGENT};
pub use server::{auto_manifest_router, manifest_router, POST_ONLY};
