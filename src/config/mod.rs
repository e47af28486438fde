//! Configuration module for parssh
//!
//! Provides CLI argument definitions and the runtime configuration the
//! orchestrator consumes.

mod settings;

pub use settings::*;
