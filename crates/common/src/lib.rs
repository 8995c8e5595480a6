//! Shared types for localflare.
//!
//! This crate has no dependency on the sandbox (`localflare-runtime`), the
//! pool, or any storage backend, so every other crate in the workspace can
//! depend on it without pulling in the world — the same role
//! `hyperlight-js-common` plays for `hyperlight-js`.

mod error;
mod ids;
mod value;
mod worker;

pub use error::{LocalflareError, Result};
pub use ids::{BucketId, DbId, IndexId, NamespaceId, QueueId, WorkerId};
pub use value::WireValue;
pub use worker::{BindingDescriptor, BindingKind, Worker};
