//! Core types and trait definitions for the Sluice ETL service.
//!
//! This crate is deliberately free of HTTP and database dependencies.
//! Adapters, storage backends and the API all depend on it.

pub mod checkpoint;
pub mod error;
pub mod identity;
pub mod normalize;
pub mod record;
pub mod run;
pub mod source;
pub mod store;

pub use error::{Error, Result};
