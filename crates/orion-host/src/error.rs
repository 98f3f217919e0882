//! Error types for the WASI host.
//!
//! Each stage of a run has its own error enum so an embedder can tell a module
//! that never loaded apart from one that failed to link or trapped:
//!
//! - [`LoadError`]: the module bytes could not be obtained or compiled
//! - [`InstantiateError`]: the module could not be bound to the import table
//! - [`RuntimeError`]: a Reactor call could not complete
//!
//! [`HostError`] wraps all of them via `#[from]` so `?` works across stages.

use thiserror::Error;

use crate::types::{TrapReason, WasmType};

/// Failure to obtain or validate module bytes.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The bytes are not a valid core WebAssembly module.
    #[error("Malformed module: {0}")]
    Malformed(String),

    /// The source could not be read or fetched.
    #[error("Module unavailable: {0}")]
    Unavailable(String),
}

/// Failure to bind a compiled module to an import table.
#[derive(Debug, Error)]
pub enum InstantiateError {
    #[error("Missing import: {0}::{1}")]
    MissingImport(String, String),

    #[error(
        "Import {module}::{name} does not match the host: expected {expected}, module declares {actual}"
    )]
    LinkMismatch {
        module: String,
        name: String,
        expected: String,
        actual: String,
    },

    /// Command mode requires an entry export.
    #[error("Entry point not exported: {0}")]
    MissingEntry(String),

    /// wasmtime refused the instantiation after the import check passed
    /// (start function trap, resource limit, etc).
    #[error("Failed to instantiate module: {0}")]
    Link(String),
}

/// Failure of a single call into a live instance.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Guest trapped: {0}")]
    Trapped(TrapReason),

    #[error("Guest exited with code {0}")]
    Exited(i32),

    #[error("Export not found: {0}")]
    ExportNotFound(String),

    #[error("Argument mismatch calling {name}: expected {expected:?}, got {actual:?}")]
    ArgumentMismatch {
        name: String,
        expected: Vec<WasmType>,
        actual: Vec<WasmType>,
    },

    /// The instance already exited or trapped.
    #[error("Instance terminated")]
    Terminated,
}

/// Configuration loading errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parsing error: {0}")]
    Parse(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Umbrella error for the host.
#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Instantiate(#[from] InstantiateError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result alias used across the crate.
pub type HostResult<T> = Result<T, HostError>;
