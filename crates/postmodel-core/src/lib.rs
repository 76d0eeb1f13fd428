//! # postmodel-core
//!
//! Core types shared by every postmodel crate. This crate has no database
//! dependencies.
//!
//! ## Modules
//!
//! - [`error`] - The error taxonomy and result alias
//! - [`settings`] - Named database URLs and logging knobs
//! - [`settings_loader`] - TOML/JSON/environment settings loading
//! - [`logging`] - Tracing subscriber setup
//! - [`utils`] - Text helpers

pub mod error;
pub mod logging;
pub mod settings;
pub mod settings_loader;
pub mod utils;

pub use error::{PostmodelError, PostmodelResult};
pub use settings::{DatabaseSettings, Settings, DEFAULT_DB};
