//! Infrastructure adapters for external systems.

pub mod mock;
pub mod notify;
pub mod process;
pub mod sqlite;
