//! Configuration Module
//!
//! Environment-driven configuration for the ingestion pipeline.

mod settings;

pub use settings::{CacheSettings, ConfigError, IngestConfig, ServerSettings, StreamSettings};
