//! # curio-core
//!
//! Core types shared across Curio - the personal content tracker.
//!
//! This crate provides:
//! - Configuration system, including tool server launch descriptions
//! - Common error types

pub mod config;
pub mod error;

pub use config::{Config, ServerConfig, ServersDocument};
pub use error::{Error, Result};
