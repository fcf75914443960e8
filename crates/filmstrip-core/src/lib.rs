//! filmstrip-core: shared ids, errors, configuration and the filmstrip data model.
//!
//! This crate is the foundational dependency for the other filmstrip-* crates.
//! It carries no I/O beyond reading configuration files.

pub mod config;
pub mod error;
pub mod ids;
pub mod media;

// Re-export the most commonly used items at the crate root.
pub use error::{Error, Result};
pub use ids::*;
pub use media::*;
