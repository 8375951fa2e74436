//! Chip family types and registry
//!
//! This module provides types for describing chip families (flash geometry,
//! identification rules, bootloader protocol) and the registry that holds
//! the known families.

mod database;
mod rules;
mod types;

pub use database::*;
pub use rules::*;
pub use types::*;
