//! Record Store
//!
//! This module memoizes per-name computations ("jobs") and makes sure a
//! result is only ever committed to the record it was computed for.
//!
//! # How Calls Work
//!
//! 1. `call(job, name)` looks up the current record and captures a
//!    [`RecordRef`] with its generation.
//!
//! 2. If this generation already ran the job, the caller joins that future.
//!
//! 3. Otherwise a shared future is stored on the record before the job body
//!    runs, so every later caller joins it.
//!
//! 4. When the body settles, the record is checked again. If it was removed
//!    or recreated in the meantime the value is dropped and the callers get
//!    an [`Intercept`](crate::Intercept).
//!
//! Removing or recreating a record while jobs are outstanding is therefore
//! always safe.

mod cache;
mod record;
mod record_store;

pub use cache::{Cache, MemoryCache};
pub use record::{Generation, RecordRef};
pub use record_store::{Job, RecordStore, RecordStoreBuilder};
