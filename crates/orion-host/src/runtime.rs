//! Host Runtime
//!
//! Binds an [`ImportBinding`] to a [`CompiledModule`], instantiates it and
//! drives execution in one of two conventions:
//!
//! - **Command**: call the entry export (`_start`) once and report the exit code
//! - **Reactor**: call `_initialize` if present, then hand back a
//!   [`ReactorInstance`] whose exports can be called by name
//!
//! Each run gets its own store, linear memory and output capture. Only the
//! engine and the compiled module are shared, and both are immutable, so
//! independent runs can execute on separate threads.
//!
//! ```text
//! Created ──check imports──▶ Instantiated ──call──▶ Running ──▶ Exited | Trapped
//!    │
//!    └──────────────────────▶ LinkFailed
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};
use wasmtime::{Config, Engine, Instance, Linker, ResourceLimiter, Store, Trap, Val};

use crate::error::{HostError, HostResult, InstantiateError, LoadError, RuntimeError};
use crate::loader::{CompiledModule, ExportDescriptor, ExternKind, ModuleLoader, ModuleSource};
use crate::sink::{CapturedOutput, MemorySink, OutputSink, TeeSink};
use crate::types::{
    ExecMode, RunOutcome, RunReport, RunState, Signature, TrapCode, TrapReason, WasmValue,
};
use crate::wasi::{ImportBinding, ProcExit, WasiCtx, WasiView};

/// Export called after instantiation in Reactor mode, when present
pub const REACTOR_INIT: &str = "_initialize";

/// Resource limits for one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Maximum memory pages (64KB each)
    pub max_memory_pages: u32,
    /// Maximum table elements
    pub max_table_elements: u32,
    /// Maximum fuel (instruction count), `None` disables metering
    pub max_fuel: Option<u64>,
    /// Wall-clock budget per call, enforced with epoch interruption
    pub max_execution_time_ms: Option<u64>,
    /// Bytes a run may write to stdout and stderr combined
    pub max_output_bytes: Option<u64>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_pages: 256, // 16MB
            max_table_elements: 10000,
            max_fuel: None,
            max_execution_time_ms: None,
            max_output_bytes: Some(64 * 1024 * 1024),
        }
    }
}

impl ResourceLimits {
    pub fn unlimited() -> Self {
        Self {
            max_memory_pages: 65536,
            max_table_elements: u32::MAX,
            max_fuel: None,
            max_execution_time_ms: None,
            max_output_bytes: None,
        }
    }

    pub fn restrictive() -> Self {
        Self {
            max_memory_pages: 16, // 1MB
            max_table_elements: 1000,
            max_fuel: Some(10_000_000),
            max_execution_time_ms: Some(5000),
            max_output_bytes: Some(1024 * 1024),
        }
    }

    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_pages as u64 * 65536
    }
}

/// Optimization level for compilation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationLevel {
    None,
    #[default]
    Speed,
    SpeedAndSize,
}

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Resource limits applied to every instance
    pub resource_limits: ResourceLimits,
    /// Export invoked in Command mode
    pub entry_point: String,
    /// Epoch tick interval in milliseconds
    pub epoch_tick_ms: u64,
    /// Maximum cached modules, 0 disables the cache
    pub max_cached_modules: usize,
    /// Enable parallel compilation
    pub parallel_compilation: bool,
    /// Emit DWARF debug info for guest code
    pub debug_info: bool,
    /// Cranelift optimization level
    pub optimization_level: OptimizationLevel,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            resource_limits: ResourceLimits::default(),
            entry_point: "_start".to_string(),
            epoch_tick_ms: 10,
            max_cached_modules: 100,
            parallel_compilation: true,
            debug_info: false,
            optimization_level: OptimizationLevel::Speed,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resource_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = limits;
        self
    }

    pub fn with_entry_point(mut self, entry: &str) -> Self {
        self.entry_point = entry.to_string();
        self
    }

    pub fn with_fuel(mut self, fuel: u64) -> Self {
        self.resource_limits.max_fuel = Some(fuel);
        self
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.resource_limits.max_execution_time_ms = Some(ms);
        self
    }

    pub fn with_optimization(mut self, level: OptimizationLevel) -> Self {
        self.optimization_level = level;
        self
    }

    /// Epoch ticks that make up the execution time budget, if any.
    fn epoch_deadline(&self) -> Option<u64> {
        self.resource_limits
            .max_execution_time_ms
            .map(|ms| (ms / self.epoch_tick_ms.max(1)).max(1))
    }

    /// Convert to wasmtime Config
    fn to_wasmtime_config(&self) -> Config {
        let mut config = Config::new();

        config.consume_fuel(self.resource_limits.max_fuel.is_some());
        config.epoch_interruption(self.resource_limits.max_execution_time_ms.is_some());
        config.debug_info(self.debug_info);
        config.parallel_compilation(self.parallel_compilation);

        match self.optimization_level {
            OptimizationLevel::None => {
                config.cranelift_opt_level(wasmtime::OptLevel::None);
            }
            OptimizationLevel::Speed => {
                config.cranelift_opt_level(wasmtime::OptLevel::Speed);
            }
            OptimizationLevel::SpeedAndSize => {
                config.cranelift_opt_level(wasmtime::OptLevel::SpeedAndSize);
            }
        }

        config
    }
}

/// Store limits for resource control
pub struct StoreLimits {
    pub max_memory_bytes: u64,
    pub max_table_elements: u32,
}

impl From<&ResourceLimits> for StoreLimits {
    fn from(limits: &ResourceLimits) -> Self {
        Self {
            max_memory_bytes: limits.max_memory_bytes(),
            max_table_elements: limits.max_table_elements,
        }
    }
}

impl ResourceLimiter for StoreLimits {
    fn memory_growing(
        &mut self,
        _current: usize,
        desired: usize,
        maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        let max = maximum.unwrap_or(self.max_memory_bytes as usize);
        Ok(desired <= max && desired as u64 <= self.max_memory_bytes)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        let max = maximum.unwrap_or(self.max_table_elements as usize);
        Ok(desired <= max && desired <= self.max_table_elements as usize)
    }
}

/// Data stored in each wasmtime Store
pub struct HostState {
    pub wasi: WasiCtx,
    pub limits: StoreLimits,
}

impl WasiView for HostState {
    fn wasi(&mut self) -> &mut WasiCtx {
        &mut self.wasi
    }
}

/// Runtime statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeStats {
    pub runs_started: u64,
    pub runs_exited: u64,
    pub runs_trapped: u64,
    pub link_failures: u64,
    pub reactor_calls: u64,
    pub total_execution_time_ms: u64,
}

/// Turn the error of a guest call into an outcome. `proc_exit` is a clean
/// exit, anything else is a trap.
fn classify(err: &wasmtime::Error) -> RunOutcome {
    if let Some(ProcExit(code)) = err.downcast_ref::<ProcExit>() {
        return RunOutcome::Exited(*code);
    }
    if let Some(trap) = err.downcast_ref::<Trap>() {
        return RunOutcome::Trapped(TrapReason::new(TrapCode::from(*trap), trap.to_string()));
    }
    RunOutcome::Trapped(TrapReason::new(TrapCode::HostError, format!("{:#}", err)))
}

/// A store and instance that passed linking
struct LiveInstance {
    id: u64,
    store: Store<HostState>,
    instance: Instance,
    capture: Arc<MemorySink>,
    module: Arc<CompiledModule>,
    state: RunState,
    epoch_deadline: Option<u64>,
}

impl LiveInstance {
    fn transition(&mut self, next: RunState) {
        debug!(
            instance = self.id,
            module = %self.module.name,
            "{:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }

    fn arm_deadline(&mut self) {
        if let Some(ticks) = self.epoch_deadline {
            self.store.set_epoch_deadline(ticks);
        }
    }

    fn report(&self, outcome: RunOutcome) -> RunReport {
        self.store.data().wasi.sink.flush();
        let output = self.capture.seal();
        RunReport {
            stdout: output.stdout,
            stderr: output.stderr,
            outcome,
        }
    }
}

/// Result of [`HostRuntime::run`]
pub enum RunHandle {
    /// Command run that has terminated
    Completed(RunReport),
    /// Live Reactor instance
    Reactor(ReactorInstance),
}

impl RunHandle {
    /// Terminal report; a Reactor instance is finished first.
    pub fn into_report(self) -> RunReport {
        match self {
            RunHandle::Completed(report) => report,
            RunHandle::Reactor(instance) => instance.finish(),
        }
    }
}

/// Instantiated Reactor module whose exports can be called by name
pub struct ReactorInstance {
    live: LiveInstance,
    outcome: RunOutcome,
    stats: Arc<parking_lot::Mutex<RuntimeStats>>,
}

impl ReactorInstance {
    pub fn id(&self) -> u64 {
        self.live.id
    }

    pub fn module(&self) -> &Arc<CompiledModule> {
        &self.live.module
    }

    pub fn state(&self) -> RunState {
        self.live.state
    }

    /// `Running` until a call exits or traps.
    pub fn outcome(&self) -> &RunOutcome {
        &self.outcome
    }

    /// Function exports of the module.
    pub fn exports(&self) -> Vec<&ExportDescriptor> {
        self.live
            .module
            .exports()
            .iter()
            .filter(|e| matches!(e.kind, ExternKind::Func(_)))
            .collect()
    }

    /// Output captured so far.
    pub fn output(&self) -> CapturedOutput {
        self.live.capture.snapshot()
    }

    /// Call export `name`. Output lands in the same sink as earlier calls.
    pub fn call(&mut self, name: &str, args: &[WasmValue]) -> Result<Vec<WasmValue>, RuntimeError> {
        if self.outcome.is_terminal() {
            return Err(RuntimeError::Terminated);
        }

        let live = &mut self.live;
        let func = live
            .instance
            .get_func(&mut live.store, name)
            .ok_or_else(|| RuntimeError::ExportNotFound(name.to_string()))?;

        let sig = Signature::of(&func.ty(&live.store));
        let arg_types: Vec<_> = args.iter().map(|a| a.ty()).collect();
        if sig.params != arg_types {
            return Err(RuntimeError::ArgumentMismatch {
                name: name.to_string(),
                expected: sig.params,
                actual: arg_types,
            });
        }

        let params: Vec<Val> = args.iter().map(|a| a.to_val()).collect();
        let mut results = vec![Val::I32(0); sig.results.len()];

        live.arm_deadline();
        live.transition(RunState::Running);
        let start = Instant::now();
        let result = func.call(&mut live.store, &params, &mut results);
        let elapsed = start.elapsed().as_millis() as u64;
        {
            let mut stats = self.stats.lock();
            stats.reactor_calls += 1;
            stats.total_execution_time_ms += elapsed;
        }

        match result {
            Ok(()) => {
                live.transition(RunState::Instantiated);
                Ok(results.iter().filter_map(WasmValue::from_val).collect())
            }
            Err(err) => {
                let outcome = classify(&err);
                let error = match &outcome {
                    RunOutcome::Exited(code) => {
                        live.transition(RunState::Exited);
                        info!(instance = live.id, "Reactor exited with code {}", code);
                        RuntimeError::Exited(*code)
                    }
                    RunOutcome::Trapped(reason) => {
                        live.transition(RunState::Trapped);
                        warn!(instance = live.id, "Reactor call {} trapped: {}", name, reason);
                        self.stats.lock().runs_trapped += 1;
                        RuntimeError::Trapped(reason.clone())
                    }
                    RunOutcome::Running => RuntimeError::Terminated,
                };
                self.outcome = outcome;
                Err(error)
            }
        }
    }

    /// Call an export returning a single i32.
    pub fn call_i32(&mut self, name: &str, args: &[WasmValue]) -> Result<i32, RuntimeError> {
        let results = self.call(name, args)?;
        match results.as_slice() {
            [WasmValue::I32(v)] => Ok(*v),
            _ => Err(RuntimeError::ArgumentMismatch {
                name: name.to_string(),
                expected: vec![crate::types::WasmType::I32],
                actual: results.iter().map(|r| r.ty()).collect(),
            }),
        }
    }

    /// Seal the output and drop the instance.
    pub fn finish(self) -> RunReport {
        info!(instance = self.live.id, "Reactor finished: {:?}", self.outcome);
        self.live.report(self.outcome.clone())
    }
}

/// WASI host runtime. Cheap to clone; clones share the engine, loader and
/// statistics.
#[derive(Clone)]
pub struct HostRuntime {
    config: Arc<RuntimeConfig>,
    engine: Engine,
    loader: Arc<ModuleLoader>,
    stats: Arc<parking_lot::Mutex<RuntimeStats>>,
    next_id: Arc<AtomicU64>,
}

impl HostRuntime {
    /// Create a new runtime
    pub fn new(config: RuntimeConfig) -> HostResult<Self> {
        let engine = Engine::new(&config.to_wasmtime_config())
            .map_err(|e| HostError::Internal(format!("Failed to create engine: {}", e)))?;
        let loader = ModuleLoader::new(&engine, config.max_cached_modules);

        info!(
            "WASI host runtime created with config: {:?}",
            config.optimization_level
        );

        Ok(Self {
            config: Arc::new(config),
            engine,
            loader: Arc::new(loader),
            stats: Arc::new(parking_lot::Mutex::new(RuntimeStats::default())),
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Create with default configuration
    pub fn default_runtime() -> HostResult<Self> {
        Self::new(RuntimeConfig::default())
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn loader(&self) -> &ModuleLoader {
        &self.loader
    }

    /// Load a module with this runtime's engine.
    pub async fn load(&self, source: impl Into<ModuleSource>) -> Result<Arc<CompiledModule>, LoadError> {
        self.loader.load(source).await
    }

    /// Compile bytes without touching the cache.
    pub fn compile(&self, name: &str, bytes: &[u8]) -> Result<Arc<CompiledModule>, LoadError> {
        self.loader.compile(name, bytes).map(Arc::new)
    }

    fn link_failed(&self, id: u64, module: &CompiledModule, err: InstantiateError) -> InstantiateError {
        self.stats.lock().link_failures += 1;
        warn!(instance = id, module = %module.name, "Created -> LinkFailed: {}", err);
        err
    }

    /// Imports are checked before the Command entry point, so a module with
    /// both problems reports the missing import.
    fn instantiate(
        &self,
        module: &Arc<CompiledModule>,
        bindings: ImportBinding,
        mode: ExecMode,
    ) -> Result<LiveInstance, InstantiateError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(instance = id, module = %module.name, "Created");

        bindings
            .check(module.imports())
            .map_err(|e| self.link_failed(id, module, e))?;
        if mode == ExecMode::Command {
            self.check_entry(module)
                .map_err(|e| self.link_failed(id, module, e))?;
        }

        // Every run gets a private capture in front of the embedder's sink.
        let capture = MemorySink::shared();
        let mut wasi = bindings.into_ctx();
        wasi.sink = Arc::new(TeeSink::new(capture.clone(), wasi.sink.clone()));
        if let Some(cap) = self.config.resource_limits.max_output_bytes {
            wasi.output_budget = Some(wasi.output_budget.map_or(cap, |b| b.min(cap)));
        }

        let limits = StoreLimits::from(&self.config.resource_limits);
        let mut store = Store::new(&self.engine, HostState { wasi, limits });
        store.limiter(|state| &mut state.limits);

        if let Some(fuel) = self.config.resource_limits.max_fuel {
            store
                .set_fuel(fuel)
                .map_err(|e| self.link_failed(id, module, InstantiateError::Link(e.to_string())))?;
        }
        let epoch_deadline = self.config.epoch_deadline();
        if let Some(ticks) = epoch_deadline {
            store.set_epoch_deadline(ticks);
        }

        let mut linker: Linker<HostState> = Linker::new(&self.engine);
        ImportBinding::add_to_linker(&mut linker)
            .map_err(|e| self.link_failed(id, module, InstantiateError::Link(e.to_string())))?;

        let instance = linker
            .instantiate(&mut store, module.module())
            .map_err(|e| self.link_failed(id, module, InstantiateError::Link(format!("{:#}", e))))?;

        let mut live = LiveInstance {
            id,
            store,
            instance,
            capture,
            module: module.clone(),
            state: RunState::Created,
            epoch_deadline,
        };
        live.transition(RunState::Instantiated);
        Ok(live)
    }

    /// Check that Command mode can call the configured entry point.
    fn check_entry(&self, module: &CompiledModule) -> Result<(), InstantiateError> {
        let entry = &self.config.entry_point;
        match module.export(entry).map(|e| &e.kind) {
            None => Err(InstantiateError::MissingEntry(entry.clone())),
            Some(ExternKind::Func(sig)) if sig.params.is_empty() && sig.results.is_empty() => Ok(()),
            Some(other) => Err(InstantiateError::LinkMismatch {
                module: module.name.clone(),
                name: entry.clone(),
                expected: Signature::default().to_string(),
                actual: other.to_string(),
            }),
        }
    }

    /// Run `module` in `mode`.
    pub fn run(
        &self,
        module: &Arc<CompiledModule>,
        bindings: ImportBinding,
        mode: ExecMode,
    ) -> HostResult<RunHandle> {
        match mode {
            ExecMode::Command => self.run_command(module, bindings).map(RunHandle::Completed),
            ExecMode::Reactor => self.instantiate_reactor(module, bindings).map(RunHandle::Reactor),
        }
    }

    /// Command mode: call the entry export once and report the outcome.
    pub fn run_command(
        &self,
        module: &Arc<CompiledModule>,
        bindings: ImportBinding,
    ) -> HostResult<RunReport> {
        let mut live = self.instantiate(module, bindings, ExecMode::Command)?;
        self.stats.lock().runs_started += 1;

        let entry = live
            .instance
            .get_typed_func::<(), ()>(&mut live.store, &self.config.entry_point)
            .map_err(|e| HostError::Internal(format!("entry point lookup failed: {}", e)))?;

        live.arm_deadline();
        live.transition(RunState::Running);
        let start = Instant::now();
        let result = entry.call(&mut live.store, ());
        let elapsed = start.elapsed().as_millis() as u64;

        let outcome = match result {
            Ok(()) => RunOutcome::Exited(0),
            Err(err) => classify(&err),
        };

        let mut stats = self.stats.lock();
        stats.total_execution_time_ms += elapsed;
        match &outcome {
            RunOutcome::Exited(code) => {
                stats.runs_exited += 1;
                drop(stats);
                live.transition(RunState::Exited);
                info!(
                    instance = live.id,
                    module = %module.name,
                    "Exited with code {} in {}ms",
                    code,
                    elapsed
                );
            }
            RunOutcome::Trapped(reason) => {
                stats.runs_trapped += 1;
                drop(stats);
                live.transition(RunState::Trapped);
                warn!(instance = live.id, module = %module.name, "Trapped: {}", reason);
            }
            RunOutcome::Running => {}
        }

        Ok(live.report(outcome))
    }

    /// Reactor mode: instantiate and run `_initialize` if exported.
    ///
    /// A trap or exit inside `_initialize` is recorded on the returned
    /// instance; later calls fail with [`RuntimeError::Terminated`].
    pub fn instantiate_reactor(
        &self,
        module: &Arc<CompiledModule>,
        bindings: ImportBinding,
    ) -> HostResult<ReactorInstance> {
        let live = self.instantiate(module, bindings, ExecMode::Reactor)?;
        self.stats.lock().runs_started += 1;

        let mut reactor = ReactorInstance {
            live,
            outcome: RunOutcome::Running,
            stats: self.stats.clone(),
        };

        if module.has_export(REACTOR_INIT) {
            if let Err(err) = reactor.call(REACTOR_INIT, &[]) {
                warn!(instance = reactor.id(), "{} failed: {}", REACTOR_INIT, err);
            }
        }

        info!(instance = reactor.id(), module = %module.name, "Reactor ready");
        Ok(reactor)
    }

    /// Command run on the blocking pool, so several runs can proceed at once.
    pub async fn run_async(
        &self,
        module: Arc<CompiledModule>,
        bindings: ImportBinding,
    ) -> HostResult<RunReport> {
        let runtime = self.clone();
        tokio::task::spawn_blocking(move || runtime.run_command(&module, bindings))
            .await
            .map_err(|e| HostError::Internal(format!("run task failed: {}", e)))?
    }

    /// Get runtime statistics
    pub fn stats(&self) -> RuntimeStats {
        self.stats.lock().clone()
    }

    /// Increment epoch for epoch-based interruption
    pub fn increment_epoch(&self) {
        self.engine.increment_epoch();
    }

    /// Start epoch ticker for timeout support
    pub fn start_epoch_ticker(&self) -> tokio::task::JoinHandle<()> {
        let engine = self.engine.clone();
        let tick_ms = self.config.epoch_tick_ms.max(1);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_millis(tick_ms));
            loop {
                interval.tick().await;
                engine.increment_epoch();
            }
        })
    }
}
