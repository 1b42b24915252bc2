//! Core types and utilities for the cats-vs-dogs transfer learning pipeline.
//!
//! This crate provides the error type, shared data types, configuration,
//! training history and backend selection used by the other crates and tools.

pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod types;

pub use backend::*;
pub use cli::*;
pub use config::*;
pub use error::{Error, Result};
pub use metrics::*;
pub use types::*;

/// Re-export commonly used burn types
pub mod prelude {
    pub use crate::backend::*;
    pub use crate::config::*;
    pub use crate::error::{Error, Result};
    pub use crate::metrics::*;
    pub use crate::types::*;
    pub use burn::prelude::*;
}
