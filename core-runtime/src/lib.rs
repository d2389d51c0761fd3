//! # Core Runtime Module
//!
//! Provides foundational runtime infrastructure for the offline
//! synchronization core:
//! - Logging and tracing infrastructure
//! - Configuration management and policy defaults
//! - Event bus system
//! - Listener registries for synchronous change callbacks
//!
//! ## Overview
//!
//! This crate contains the runtime utilities that the cache, queue and
//! server-switch crates depend on. It establishes the logging conventions,
//! the fail-fast configuration builder and the event broadcasting mechanism
//! used throughout the system.

pub mod config;
pub mod error;
pub mod events;
pub mod listeners;
pub mod logging;

pub use error::{Error, Result};
