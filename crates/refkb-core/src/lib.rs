//! # refkb-core
//!
//! Core records, traits, and error types for refkb, the reference-library
//! knowledge base builder.
//!
//! This crate provides the data structures and trait definitions the other
//! refkb crates depend on: the raw rows read from the source library, the
//! flat records written to tabular files, conversion outcomes, and the
//! seams to the source store, the page counter and the conversion engine.

pub mod defaults;
pub mod error;
pub mod file_safety;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use file_safety::{fulltext_file_name, parse_fulltext_file_name, sanitize_filename, title_slug};
pub use models::*;
pub use traits::*;
