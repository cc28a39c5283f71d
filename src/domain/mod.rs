//! Domain layer for the Conductor orchestrator
//!
//! Core models, the error type shared by every port, and the port traits
//! that adapters implement.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{DomainError, DomainResult};
