//! Job Lifecycle and Caching
//!
//! The library is organized around three pieces:
//!
//! - [`model`]: one job's directory layout, input/output materialization,
//!   script generation, return-code interpretation, export and retries
//! - [`signature`]: content signatures and the ordered cache comparison
//! - [`manager`]: the per-process concurrent orchestrator

pub mod manager;
pub mod model;
pub mod signature;

pub use manager::{JobStatus, Jobmgr};
pub use model::{Job, JobState, RcReason, ReturnCode};
pub use signature::{CacheSignature, MismatchReason};
