//! Worker-visible binding objects: KV, object storage, relational
//! (D1-style), queue producer, durable object namespace, vector index, AI,
//! AI Gateway, and secrets.
//!
//! Each type here implements `localflare_runtime::BindingModule`, installing
//! one plain `rquickjs` object per binding whose methods close over a
//! `localflare-storage` handle. See `convert` for the shared JS-value <->
//! `WireValue` plumbing every binding that touches relational data uses.

pub mod ai;
pub mod ai_gateway;
pub mod convert;
pub mod durable_object;
pub mod kv;
pub mod objects;
pub mod queue;
pub mod relational;
pub mod secret;
pub mod vector;

pub use ai::AiBinding;
pub use ai_gateway::AiGatewayBinding;
pub use durable_object::{
    unimplemented_dispatcher, DurableObjectBinding, DurableObjectDispatcher, DurableObjectStorageBinding,
};
pub use kv::KvBinding;
pub use objects::ObjectBinding;
pub use queue::QueueBinding;
pub use relational::RelationalBinding;
pub use secret::SecretBinding;
pub use vector::VectorBinding;
