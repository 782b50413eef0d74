//! Shared configuration and error types for attention components.

pub mod config;
pub mod errors;

pub use config::AttentionConfig;
pub use errors::AttentionError;
