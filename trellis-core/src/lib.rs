//! Trellis Core
//!
//! This crate provides the core of the Trellis incremental build graph.
//! It implements:
//!
//! - An immutable-snapshot dependency graph with diffs
//! - An asynchronous tracer that discovers the graph and prunes it
//! - A job-memoizing record store with generation-checked commits
//! - A session driver that keeps the graph and the store in step
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `graph`: Node/edge model, diffs, notation and the tracer
//! - `store`: Records, jobs and cache backends
//! - `session`: Wiring of the tracer to the store
//! - `config`: Session configuration
//!
//! # Example
//!
//! ```rust,ignore
//! use trellis_core::config::TracerConfig;
//! use trellis_core::session::Session;
//! use trellis_core::store::{RecordRef, RecordStore};
//!
//! let store = RecordStore::builder()
//!     .job("dependencies", |record: RecordRef, _store: RecordStore<Vec<String>>| async move {
//!         anyhow::Ok(Some(read_imports(&record.name).await?))
//!     })
//!     .build();
//!
//! let session = Session::new(TracerConfig::with_entries(["src/main.js"]), store, |imports| {
//!     Ok(imports.clone())
//! })?;
//!
//! let mut events = session.subscribe();
//! session.start()?;
//! // Wait for `TraceEvent::Complete`, then react to file-system events:
//! session.file_changed("src/util.js");
//! ```

pub mod config;
pub mod graph;
pub mod session;
pub mod store;

mod error;

pub use error::{
    ConfigError, DiscoveryError, Error, GraphError, Intercept, NotationError, StoreError,
    TracerError,
};
