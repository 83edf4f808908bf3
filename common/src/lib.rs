//! Common Utilities and Types Library
//! 
//! This crate provides shared identifiers, value types and helpers used across the TDD MAC engine.

pub mod types;
pub mod utils;

// Re-export commonly used items
pub use types::*;
pub use utils::*;
