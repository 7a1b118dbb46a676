//! # ember-common
//!
//! Common types and constants for EmberDB.
//!
//! This crate provides the foundational types shared across the EmberDB
//! storage engine components:
//!
//! - **Types**: the log sequence number (`Lsn`)
//! - **Constants**: redo log geometry, margins, and limits

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod constants;
pub mod types;

pub use types::Lsn;
