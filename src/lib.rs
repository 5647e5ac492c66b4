//! Keystone - phase-ordered bootstrap orchestrator for Kubernetes control planes
//!
//! Keystone takes a set of bare nodes to a verified control plane by running
//! an ordered list of phases. Every phase is guarded by an idempotency check,
//! so re-running after a partial failure is safe, and every phase's result is
//! verified against live cluster state before the next one starts.
//!
//! # Modules
//!
//! - [`topology`] - Topology resolution: members, floating endpoint, quorum
//! - [`phase`] - Phase descriptors, operations and add-on configs
//! - [`probe`] - Read-only predicates over external state
//! - [`guard`] - Idempotency guard (skip, repair, run)
//! - [`executor`] - The phase executor
//! - [`state`] - Per-run execution state, summary and exit code
//! - [`backend`] - External collaborators (command runner, Kubernetes API)
//! - [`catalog`] - The standard control-plane phase list

#![deny(missing_docs)]

pub mod backend;
pub mod catalog;
pub mod executor;
pub mod guard;
pub mod phase;
pub mod probe;
pub mod state;
pub mod topology;

pub use executor::Orchestrator;
pub use keystone_common::{Error, Result};
pub use state::{RunState, StateTracker};
pub use topology::{resolve, Topology};
