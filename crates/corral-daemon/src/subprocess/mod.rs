//! Subprocess execution tracking.

mod process;
pub mod record;
pub mod registry;

pub use record::{
    CommandSpec, ExecutionParams, ExecutionRecord, ExecutionStatus, ProcessInfo, RegistryChange,
};
pub use registry::{ExecutionRegistry, RegistryError};
