//! relata-domain: Core authorization domain logic
//!
//! This crate contains the decision core of the service:
//! - Tuple model and authorization model types
//! - DSL parser for authorization models
//! - Type system with model validation and typed introspection
//! - Graph resolver for Check, Expand and ListObjects
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │               relata-domain                 │
//! ├─────────────────────────────────────────────┤
//! │  model/     - Types, DSL parser, TypeSystem │
//! │  resolver/  - Graph resolution engine       │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! Data access goes through the narrow async reader traits in
//! [`resolver::traits`]; the crate has no dependency on any storage backend.

pub mod error;
pub mod model;
pub mod resolver;

// Re-export commonly used types at the crate root
pub use error::{DomainError, DomainResult};
