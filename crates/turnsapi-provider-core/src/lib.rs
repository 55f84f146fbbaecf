//! Core provider abstractions for turnsapi.
//!
//! This crate intentionally does not depend on axum or any concrete HTTP
//! client; provider implementations in `turnsapi-provider-impl` own their
//! own `reqwest::Client` and construct `DispatchContext`s to call into them.

pub mod errors;
pub mod failure;
pub mod keymanager;
pub mod provider;
pub mod registry;
pub mod rpm;
pub mod types;

pub use errors::{ProviderError, ProviderResult};
pub use failure::FailureTracker;
pub use keymanager::{GroupKeyManager, GroupStatus, KeyManagerError};
pub use provider::{ChunkStream, DispatchContext, Provider, StreamChunk};
pub use registry::ProviderRegistry;
pub use rpm::{RpmLimiter, RpmStats};
pub use types::{
    ApiKey, ApiKeyHealth, Group, GroupId, KeyValidity, ProviderFamily, RequestParamOverrides,
    RotationStrategy,
};
