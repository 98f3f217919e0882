//! Minimal WASI import table
//!
//! Supplies the `wasi_snapshot_preview1` functions a stdio-only guest needs:
//!
//! - `fd_write` / `fd_read` routed to the bound [`OutputSink`] and stdin buffer
//! - `proc_exit` as a non-local exit carrying the code
//! - `args_get` / `args_sizes_get` and `environ_get` / `environ_sizes_get`
//!
//! Anything else is left undefined on purpose: a module importing
//! `fd_close` or `clock_time_get` fails at instantiation with
//! [`InstantiateError::MissingImport`] rather than running against a stub.

mod errno;
mod functions;
mod memory;

pub use errno::Errno;
pub use memory::{GuestMemory, GuestPtr, IoVec};

use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use wasmtime::{Caller, Extern, Linker};

use crate::error::InstantiateError;
use crate::loader::{ExternKind, ImportDescriptor};
use crate::sink::OutputSink;
use crate::types::{Signature, WasmType};

/// Import namespace served by the table
pub const WASI_MODULE: &str = "wasi_snapshot_preview1";

/// Host error raised by `proc_exit` to unwind the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("guest called proc_exit({0})")]
pub struct ProcExit(pub i32);

/// Per-run WASI state held in the store
pub struct WasiCtx {
    pub(crate) sink: Arc<dyn OutputSink>,
    pub(crate) args: Vec<String>,
    /// `KEY=VALUE` entries, in the order given
    pub(crate) env: Vec<String>,
    pub(crate) stdin: Vec<u8>,
    pub(crate) stdin_pos: usize,
    pub(crate) exit_code: Option<i32>,
    /// Bytes the guest may still write, `None` for no cap
    pub(crate) output_budget: Option<u64>,
}

impl WasiCtx {
    pub fn sink(&self) -> &Arc<dyn OutputSink> {
        &self.sink
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    fn exit(&mut self, code: i32) {
        self.exit_code.get_or_insert(code);
        self.sink.exit(code);
    }

    /// Take `bytes` out of the output budget, or fail with `FBIG` and leave
    /// the budget untouched.
    pub(crate) fn charge_output(&mut self, bytes: u32) -> Result<(), Errno> {
        if let Some(budget) = self.output_budget.as_mut() {
            *budget = budget.checked_sub(u64::from(bytes)).ok_or(Errno::Fbig)?;
        }
        Ok(())
    }
}

/// Store data that carries a [`WasiCtx`]
pub trait WasiView {
    fn wasi(&mut self) -> &mut WasiCtx;
}

impl WasiView for WasiCtx {
    fn wasi(&mut self) -> &mut WasiCtx {
        self
    }
}

/// One host function the table provides
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostImport {
    pub module: &'static str,
    pub name: &'static str,
    pub signature: Signature,
}

impl HostImport {
    fn wasi(name: &'static str, params: &[WasmType], results: &[WasmType]) -> Self {
        Self {
            module: WASI_MODULE,
            name,
            signature: Signature::new(params, results),
        }
    }
}

/// Every function [`ImportBinding::add_to_linker`] defines, with its signature.
pub fn host_imports() -> Vec<HostImport> {
    use WasmType::I32;
    vec![
        HostImport::wasi("fd_write", &[I32, I32, I32, I32], &[I32]),
        HostImport::wasi("fd_read", &[I32, I32, I32, I32], &[I32]),
        HostImport::wasi("proc_exit", &[I32], &[]),
        HostImport::wasi("args_get", &[I32, I32], &[I32]),
        HostImport::wasi("args_sizes_get", &[I32, I32], &[I32]),
        HostImport::wasi("environ_get", &[I32, I32], &[I32]),
        HostImport::wasi("environ_sizes_get", &[I32, I32], &[I32]),
    ]
}

/// Import table bound to one run's sink, arguments and environment
pub struct ImportBinding {
    ctx: WasiCtx,
    imports: Vec<HostImport>,
}

impl ImportBinding {
    /// Bind the table to `sink`, `args` (argv\[0\] included, if wanted) and `env`.
    pub fn build<A, E, K, V>(sink: Arc<dyn OutputSink>, args: A, env: E) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        E: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let ctx = WasiCtx {
            sink,
            args: args.into_iter().map(Into::into).collect(),
            env: env
                .into_iter()
                .map(|(k, v)| format!("{}={}", k.into(), v.into()))
                .collect(),
            stdin: Vec::new(),
            stdin_pos: 0,
            exit_code: None,
            output_budget: None,
        };
        Self {
            ctx,
            imports: host_imports(),
        }
    }

    /// Bytes served to `fd_read` on fd 0. Empty unless set.
    pub fn with_stdin(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.ctx.stdin = bytes.into();
        self.ctx.stdin_pos = 0;
        self
    }

    /// Cap on the bytes the guest may write across the whole run.
    pub fn with_output_limit(mut self, limit: Option<u64>) -> Self {
        self.ctx.output_budget = limit;
        self
    }

    pub fn imports(&self) -> &[HostImport] {
        &self.imports
    }

    pub fn lookup(&self, module: &str, name: &str) -> Option<&HostImport> {
        self.imports
            .iter()
            .find(|i| i.module == module && i.name == name)
    }

    pub fn sink(&self) -> &Arc<dyn OutputSink> {
        &self.ctx.sink
    }

    pub fn args(&self) -> &[String] {
        &self.ctx.args
    }

    /// Check that every declared import is provided with the same signature.
    pub fn check(&self, declared: &[ImportDescriptor]) -> Result<(), InstantiateError> {
        for import in declared {
            let Some(host) = self.lookup(&import.module, &import.name) else {
                return Err(InstantiateError::MissingImport(
                    import.module.clone(),
                    import.name.clone(),
                ));
            };
            match &import.kind {
                ExternKind::Func(sig) if *sig == host.signature => {}
                other => {
                    return Err(InstantiateError::LinkMismatch {
                        module: import.module.clone(),
                        name: import.name.clone(),
                        expected: host.signature.to_string(),
                        actual: other.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    pub(crate) fn into_ctx(self) -> WasiCtx {
        self.ctx
    }

    /// Define the table's functions in `linker`.
    pub(crate) fn add_to_linker<T>(linker: &mut Linker<T>) -> wasmtime::Result<()>
    where
        T: WasiView + 'static,
    {
        linker.func_wrap(
            WASI_MODULE,
            "fd_write",
            |mut caller: Caller<'_, T>, fd: i32, iovs: i32, iovs_len: i32, nwritten: i32| -> i32 {
                with_memory(&mut caller, |ctx, mem| {
                    functions::fd_write(
                        ctx,
                        mem,
                        fd as u32,
                        iovs.into(),
                        iovs_len as u32,
                        nwritten.into(),
                    )
                })
            },
        )?;

        linker.func_wrap(
            WASI_MODULE,
            "fd_read",
            |mut caller: Caller<'_, T>, fd: i32, iovs: i32, iovs_len: i32, nread: i32| -> i32 {
                with_memory(&mut caller, |ctx, mem| {
                    functions::fd_read(
                        ctx,
                        mem,
                        fd as u32,
                        iovs.into(),
                        iovs_len as u32,
                        nread.into(),
                    )
                })
            },
        )?;

        linker.func_wrap(
            WASI_MODULE,
            "proc_exit",
            |mut caller: Caller<'_, T>, code: i32| -> wasmtime::Result<()> {
                debug!(code, "proc_exit");
                caller.data_mut().wasi().exit(code);
                Err(wasmtime::Error::new(ProcExit(code)))
            },
        )?;

        linker.func_wrap(
            WASI_MODULE,
            "args_sizes_get",
            |mut caller: Caller<'_, T>, argc: i32, buf_size: i32| -> i32 {
                with_memory(&mut caller, |ctx, mem| {
                    functions::args_sizes_get(ctx, mem, argc.into(), buf_size.into())
                })
            },
        )?;

        linker.func_wrap(
            WASI_MODULE,
            "args_get",
            |mut caller: Caller<'_, T>, argv: i32, argv_buf: i32| -> i32 {
                with_memory(&mut caller, |ctx, mem| {
                    functions::args_get(ctx, mem, argv.into(), argv_buf.into())
                })
            },
        )?;

        linker.func_wrap(
            WASI_MODULE,
            "environ_sizes_get",
            |mut caller: Caller<'_, T>, count: i32, buf_size: i32| -> i32 {
                with_memory(&mut caller, |ctx, mem| {
                    functions::environ_sizes_get(ctx, mem, count.into(), buf_size.into())
                })
            },
        )?;

        linker.func_wrap(
            WASI_MODULE,
            "environ_get",
            |mut caller: Caller<'_, T>, environ: i32, environ_buf: i32| -> i32 {
                with_memory(&mut caller, |ctx, mem| {
                    functions::environ_get(ctx, mem, environ.into(), environ_buf.into())
                })
            },
        )?;

        Ok(())
    }
}

/// Resolve the caller's `memory` export and run `f` against it. A guest
/// without an exported memory gets `FAULT`.
fn with_memory<T, F>(caller: &mut Caller<'_, T>, f: F) -> i32
where
    T: WasiView + 'static,
    F: FnOnce(&mut WasiCtx, &mut GuestMemory<'_>) -> functions::WasiResult,
{
    let Some(Extern::Memory(memory)) = caller.get_export("memory") else {
        return Errno::Fault.raw();
    };
    let (data, state) = memory.data_and_store_mut(caller);
    let mut mem = GuestMemory::new(data);
    match f(state.wasi(), &mut mem) {
        Ok(()) => Errno::Success.raw(),
        Err(errno) => {
            debug!(%errno, "WASI call failed");
            errno.raw()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;

    fn binding() -> ImportBinding {
        ImportBinding::build(
            MemorySink::shared(),
            ["prog"],
            [("KEY", "value")],
        )
    }

    fn func_import(name: &str, params: &[WasmType], results: &[WasmType]) -> ImportDescriptor {
        ImportDescriptor {
            module: WASI_MODULE.to_string(),
            name: name.to_string(),
            kind: ExternKind::Func(Signature::new(params, results)),
        }
    }

    #[test]
    fn test_build_formats_env() {
        let ctx = binding().into_ctx();
        assert_eq!(ctx.args, vec!["prog".to_string()]);
        assert_eq!(ctx.env, vec!["KEY=value".to_string()]);
        assert!(ctx.stdin.is_empty());
        assert_eq!(ctx.exit_code(), None);
    }

    #[test]
    fn test_lookup() {
        let b = binding();
        assert!(b.lookup(WASI_MODULE, "fd_write").is_some());
        assert!(b.lookup(WASI_MODULE, "fd_close").is_none());
        assert!(b.lookup("env", "fd_write").is_none());
        assert_eq!(b.imports().len(), 7);
    }

    #[test]
    fn test_check_accepts_supported_imports() {
        use WasmType::I32;
        let declared = vec![
            func_import("fd_write", &[I32, I32, I32, I32], &[I32]),
            func_import("proc_exit", &[I32], &[]),
        ];
        assert!(binding().check(&declared).is_ok());
    }

    #[test]
    fn test_check_missing_import() {
        let declared = vec![func_import("fd_close", &[WasmType::I32], &[WasmType::I32])];
        let err = binding().check(&declared).unwrap_err();
        assert!(matches!(
            err,
            InstantiateError::MissingImport(ref m, ref n) if m == WASI_MODULE && n == "fd_close"
        ));
    }

    #[test]
    fn test_check_signature_mismatch() {
        let declared = vec![func_import("proc_exit", &[WasmType::I64], &[])];
        let err = binding().check(&declared).unwrap_err();
        match err {
            InstantiateError::LinkMismatch {
                name,
                expected,
                actual,
                ..
            } => {
                assert_eq!(name, "proc_exit");
                assert_eq!(expected, "func(i32) -> ()");
                assert_eq!(actual, "func(i64) -> ()");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_check_kind_mismatch() {
        let declared = vec![ImportDescriptor {
            module: WASI_MODULE.to_string(),
            name: "fd_write".to_string(),
            kind: ExternKind::Memory,
        }];
        assert!(matches!(
            binding().check(&declared),
            Err(InstantiateError::LinkMismatch { .. })
        ));
    }

    #[test]
    fn test_output_budget_is_charged() {
        let mut ctx = binding().with_output_limit(Some(10)).into_ctx();
        ctx.charge_output(6).unwrap();
        assert_eq!(ctx.charge_output(5), Err(Errno::Fbig));
        ctx.charge_output(4).unwrap();
        assert_eq!(ctx.charge_output(1), Err(Errno::Fbig));
        ctx.charge_output(0).unwrap();

        let mut unlimited = binding().into_ctx();
        unlimited.charge_output(u32::MAX).unwrap();
    }

    #[test]
    fn test_proc_exit_records_first_code() {
        let sink = MemorySink::shared();
        let mut ctx = ImportBinding::build(
            sink.clone(),
            Vec::<String>::new(),
            Vec::<(String, String)>::new(),
        )
        .into_ctx();
        ctx.exit(7);
        ctx.exit(1);
        assert_eq!(ctx.exit_code(), Some(7));
        assert_eq!(sink.snapshot().exit_code, Some(7));
    }
}
