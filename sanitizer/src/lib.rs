//! Sanitizer - key renumbering and referential-integrity maintenance for
//! relational databases.
//!
//! A run takes a plan of table descriptors and, per table, rewrites inbound
//! foreign keys to cascade, deletes unwanted rows, renumbers keys, patches
//! untyped references, rebuilds external identifiers, and resynchronizes the
//! key generator.

pub mod cascade;
pub mod catalog;
pub mod db;
pub mod error;
pub mod orchestrator;
pub mod patch;
pub mod plan;
pub mod recompute;
pub mod resequence;
pub mod sequence;
pub mod sql;
pub mod tracker;
pub mod xmlid;

pub use error::{Result, SanitizerError};
pub use orchestrator::{Orchestrator, Phase, RunOptions};
pub use plan::TableDescriptor;
pub use tracker::{ExecutionReport, ProcessingResult, RunTracker};
