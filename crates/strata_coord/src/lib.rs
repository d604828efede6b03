//! Coordination-service client crate.
//!
//! This crate provides the typed client facade over the hierarchical
//! coordination service used by strata_store, plus a reusable leader-election
//! primitive. The API surface is intentionally small: higher layers talk to
//! the `Coordinator` trait and never to a concrete backend, so the whole
//! replication core can run against the in-process `MemoryCoordinator` in
//! tests and embedded setups.

pub mod client;
pub mod election;
pub mod memory;

pub use client::{
    create_ancestors, Coordinator, CoordError, CoordErrorKind, CreateMode, EphemeralNode, Op,
    OpResult, Stat, Watch, WatchEvent,
};
pub use election::LeaderElection;
pub use memory::{CoordSession, MemoryCoordinator};
