//! `Corral` Core Library
//!
//! Shared functionality for `Corral` components:
//! - NDJSON event model and schema validation for subprocess output
//! - Incremental line stream parsing with overflow protection
//! - JSON extraction from free-form generated text
//! - Declarative schema contracts (prompt rendering + validation)
//! - Configuration resolution and common error types

pub mod config;
pub mod contract;
pub mod error;
pub mod extract;
pub mod ndjson;
pub mod stream;
pub mod tracing_init;

pub use config::Config;
pub use contract::{FieldSpec, FieldType, SchemaContract, ValidationReport};
pub use error::{Error, Result};
pub use extract::{ExtractionResult, extract, extract_and_validate, extract_multiple};
pub use ndjson::StreamEvent;
pub use stream::{EventSink, LineStreamParser, StreamError};
