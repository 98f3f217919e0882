//! Orion WASI Host
//!
//! Embeddable runtime for WebAssembly modules that target a minimal slice of
//! WASI preview1:
//! - Load a module from bytes, a file path or a URL
//! - Bind a fail-fast import table (`fd_write`, `fd_read`, `proc_exit`, args, environ)
//! - Run it as a Command (`_start`) or keep it alive as a Reactor
//! - Capture stdout/stderr into an [`OutputSink`]
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      Embedder                            │
//! │        ModuleSource ──▶ ModuleLoader ──▶ CompiledModule  │
//! │                            (cache)            │          │
//! │  ┌─────────────────────────────────────────── ▼ ──────┐  │
//! │  │                   HostRuntime                      │  │
//! │  │  ┌──────────┐   ┌──────────────┐   ┌───────────┐   │  │
//! │  │  │  Engine  │   │ ImportBinding│   │   Store   │   │  │
//! │  │  └──────────┘   └──────┬───────┘   └───────────┘   │  │
//! │  └────────────────────────│───────────────────────────┘  │
//! │                           ▼                              │
//! │                      OutputSink ──▶ RunReport            │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use orion_host::{ExecMode, HostRuntime, ImportBinding, MemorySink};
//!
//! let runtime = HostRuntime::default_runtime()?;
//! let module = runtime.load("hello.wasm").await?;
//! let bindings = ImportBinding::build(MemorySink::shared(), ["hello"], Vec::<(String, String)>::new());
//! let report = runtime.run(&module, bindings, ExecMode::Command)?.into_report();
//! print!("{}", report.stdout_string());
//! ```

pub mod config;
pub mod error;
pub mod loader;
pub mod runtime;
pub mod sink;
pub mod types;
pub mod wasi;

pub use config::{HostConfig, RuntimeSection, WasiSection};
pub use error::{ConfigError, HostError, HostResult, InstantiateError, LoadError, RuntimeError};
pub use loader::{
    CacheStats, CompiledModule, ExportDescriptor, ExternKind, ImportDescriptor, ModuleCache,
    ModuleLoader, ModuleSource,
};
pub use runtime::{
    HostRuntime, OptimizationLevel, ReactorInstance, ResourceLimits, RunHandle, RuntimeConfig,
    RuntimeStats,
};
pub use sink::{CallbackSink, CapturedOutput, MemorySink, OutputSink, Stream, TeeSink};
pub use types::{
    ExecMode, RunOutcome, RunReport, RunState, Signature, TrapCode, TrapReason, WasmType,
    WasmValue,
};
pub use wasi::{Errno, HostImport, ImportBinding, WASI_MODULE, host_imports};
