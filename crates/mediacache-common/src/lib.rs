//! Media cache common types, errors, and configuration.
//!
//! This crate provides shared definitions used across the media cache
//! engine components.

pub mod config;
pub mod error;
pub mod range;

pub use config::{ConsumePolicy, StoreConfig};
pub use error::{CacheError, Result};
pub use range::ByteRange;
