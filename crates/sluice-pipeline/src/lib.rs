//! Source adapters and the ETL orchestrator.
//!
//! The pipeline depends only on the [`sluice_core::store::EtlStore`] trait;
//! any backend can be plugged in.

pub mod adapter;
pub mod error;
pub mod pipeline;
pub mod recorder;

pub use error::{Error, Result};
pub use pipeline::{IngestMode, Pipeline, RunSummary, SourceOutcome, SourceReport};

#[cfg(test)]
mod tests;
