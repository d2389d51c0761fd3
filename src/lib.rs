//! Workspace placeholder crate.
//!
//! This crate exists to expose shared feature flags that map to the individual
//! workspace crates (e.g., `core-service`, `bridge-desktop`). Tablet hosts can
//! depend on `carelink-workspace` and enable the documented features without
//! wiring the offline synchronization core crate by crate.
