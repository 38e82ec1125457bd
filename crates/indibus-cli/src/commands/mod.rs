//! Subcommand implementations.

pub mod admin;
pub mod config;
pub mod property;
pub mod serve;
