//! Utility functions shared across the postmodel crates.

pub mod text;
