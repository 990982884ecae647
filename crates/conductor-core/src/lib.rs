//! Orchestration engines for Conductor.
//!
//! This crate holds the workflow parser and executor, the parallel domain
//! coordinator, validation gates and the hook execution engine, along with
//! the ports (`WorkflowSource`, `MetricsSink`, `ResourceSampler`) that the
//! infrastructure layer implements. It depends only on `conductor-types` --
//! never on `conductor-infra` or any filesystem crate.

pub mod event;
pub mod hook;
pub mod workflow;
