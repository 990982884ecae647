//! Shared domain types for Conductor.
//!
//! This crate contains the plain data types used across the orchestration
//! core: workflow definitions and step results, hook records, lifecycle
//! events, configuration, and the source error type.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod hook;
pub mod workflow;
