//! # mb-core
//!
//! Core primitives shared by the motherbrain cluster orchestrator.
//!
//! This crate provides the foundational types used across all motherbrain
//! components:
//!
//! - **Identifiers**: Strongly-typed IDs for jobs and lock grants
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialization and span constructors
//!
//! ## Crate Boundary
//!
//! `mb-core` holds no orchestration logic. Everything that schedules,
//! locks, or talks to remote machines lives in `mb-flow`.
//!
//! ## Example
//!
//! ```rust
//! use mb_core::prelude::*;
//!
//! let job = JobId::generate();
//! let token = LockToken::generate();
//! assert_ne!(job.to_string(), token.to_string());
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod observability;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{JobId, LockToken};
    pub use crate::observability::{LogFormat, init_logging, orchestration_span};
}

pub use error::{Error, Result};
pub use id::{JobId, LockToken};
pub use observability::{LogFormat, Redacted, init_logging};
