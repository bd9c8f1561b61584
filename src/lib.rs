//! # uns-graph-sync
//!
//! Keeps a graph store in sync with a hierarchical publish/subscribe namespace
//! (a "Unified Namespace" on an MQTT broker).
//!
//! ## Overview
//!
//! Every message published under a path such as `site1/line1/tempSensor` is
//! mirrored into the store as a tree: one node per path level, one hierarchy
//! edge from each level to the next, and a leaf holding the latest value at the
//! published path. Writes are idempotent upserts, so redelivered or replayed
//! messages leave the graph unchanged.
//!
//! ### Key Properties
//!
//! - **Tree shaped**: depth-1 nodes are roots; every deeper node has exactly
//!   one parent, its path prefix
//! - **Atomic**: the mutations derived from one message commit together or not
//!   at all
//! - **Last-write-wins**: a leaf value is replaced only by a payload with an
//!   equal or newer timestamp, whatever the arrival order
//! - **Resilient**: both connections reconnect with exponential backoff;
//!   transient store failures are retried before a message is given up
//!
//! ## Architecture
//!
//! - **[`paths`]**: Namespace path parsing and validation
//! - **[`payload`]**: Transport messages and the value/timestamp payload contract
//! - **[`mutation`]**: Pure translation of a message into an ordered mutation set
//! - **[`store`]**: The [`store::GraphStore`] seam, in-memory and SQLite stores,
//!   and the [`store::StoreConnectionManager`]
//! - **[`transport`]**: The [`transport::Transport`] seam, MQTT and in-process
//!   transports, and the [`transport::TransportConnectionManager`]
//! - **[`queue`]**: Bounded hand-off between transport and pipeline
//! - **[`pipeline`]**: Workers applying mutation sets, per-path ordered
//! - **[`health`]**: Readiness and liveness for the health endpoint
//! - **[`service`]**: Lifecycle wiring and ordered shutdown
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use uns_graph_sync::{
//!     mutation::MutationBuilder,
//!     paths::PathParser,
//!     payload::PayloadRules,
//!     store::{GraphStore, MemoryGraphStore},
//! };
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let path = PathParser::default().parse("site1/line1/tempSensor")?;
//!     let payload = PayloadRules::default().parse(br#"{"value": 72.5, "timestamp": 1}"#)?;
//!     let set = MutationBuilder::default().build(&path, payload.as_ref(), 0);
//!
//!     let store = Arc::new(MemoryGraphStore::new());
//!     store.apply(&set).await?;
//!     assert_eq!(store.counts().await?, (3, 2));
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! - **`service`** (default): SQLite graph store (`sqlx`) and MQTT transport (`rumqttc`)
//! - **`bin`**: The `uns-graph-sync` command with its health endpoint

pub mod config;
pub mod connection;
pub mod error;
pub mod health;
pub mod mutation;
pub mod paths;
pub mod payload;
pub mod pipeline;
pub mod queue;
pub mod retry;
pub mod service;
pub mod store;
#[cfg(test)]
mod tests;
pub mod transport;

pub use error::*;
