//! # mscope common library
//!
//! Shared code for the mscope crates:
//! - Error and Result types
//! - Bootstrap configuration and root folder layout
//! - Database bootstrap and runtime settings
//! - Event types and the EventBus

pub mod config;
pub mod db;
pub mod error;
pub mod events;

pub use error::{Error, Result};
