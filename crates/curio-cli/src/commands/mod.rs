//! CLI command implementations.

pub mod config;
pub mod servers;
pub mod tools;
