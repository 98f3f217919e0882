//! Value and outcome types shared by the loader, import table and runtime

use serde::{Deserialize, Serialize};
use std::fmt;
use wasmtime::{Trap, Val, ValType};

/// Primitive numeric value passed across the Reactor call surface
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum WasmValue {
    /// 32-bit integer
    I32(i32),
    /// 64-bit integer
    I64(i64),
    /// 32-bit float
    F32(f32),
    /// 64-bit float
    F64(f64),
}

impl WasmValue {
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            WasmValue::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            WasmValue::I32(v) => Some(*v as i64),
            WasmValue::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            WasmValue::F32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            WasmValue::F32(v) => Some(*v as f64),
            WasmValue::F64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn ty(&self) -> WasmType {
        match self {
            WasmValue::I32(_) => WasmType::I32,
            WasmValue::I64(_) => WasmType::I64,
            WasmValue::F32(_) => WasmType::F32,
            WasmValue::F64(_) => WasmType::F64,
        }
    }

    /// Parse a typed literal such as `i32:7`, `f64:2.5`; bare integers are `i32`.
    pub fn parse(s: &str) -> Option<Self> {
        let (ty, raw) = match s.split_once(':') {
            Some((ty, raw)) => (ty, raw),
            None => ("i32", s),
        };
        match ty {
            "i32" => raw.parse().ok().map(WasmValue::I32),
            "i64" => raw.parse().ok().map(WasmValue::I64),
            "f32" => raw.parse().ok().map(WasmValue::F32),
            "f64" => raw.parse().ok().map(WasmValue::F64),
            _ => None,
        }
    }

    pub(crate) fn to_val(self) -> Val {
        match self {
            WasmValue::I32(v) => Val::I32(v),
            WasmValue::I64(v) => Val::I64(v),
            WasmValue::F32(v) => Val::F32(v.to_bits()),
            WasmValue::F64(v) => Val::F64(v.to_bits()),
        }
    }

    pub(crate) fn from_val(val: &Val) -> Option<Self> {
        match val {
            Val::I32(v) => Some(WasmValue::I32(*v)),
            Val::I64(v) => Some(WasmValue::I64(*v)),
            Val::F32(bits) => Some(WasmValue::F32(f32::from_bits(*bits))),
            Val::F64(bits) => Some(WasmValue::F64(f64::from_bits(*bits))),
            _ => None,
        }
    }
}

impl fmt::Display for WasmValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WasmValue::I32(v) => write!(f, "{}", v),
            WasmValue::I64(v) => write!(f, "{}", v),
            WasmValue::F32(v) => write!(f, "{}", v),
            WasmValue::F64(v) => write!(f, "{}", v),
        }
    }
}

impl From<i32> for WasmValue {
    fn from(v: i32) -> Self {
        WasmValue::I32(v)
    }
}

impl From<i64> for WasmValue {
    fn from(v: i64) -> Self {
        WasmValue::I64(v)
    }
}

impl From<f32> for WasmValue {
    fn from(v: f32) -> Self {
        WasmValue::F32(v)
    }
}

impl From<f64> for WasmValue {
    fn from(v: f64) -> Self {
        WasmValue::F64(v)
    }
}

/// WASM value types as seen in import and export signatures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WasmType {
    I32,
    I64,
    F32,
    F64,
    V128,
    Ref,
}

impl From<&ValType> for WasmType {
    fn from(ty: &ValType) -> Self {
        match ty {
            ValType::I32 => WasmType::I32,
            ValType::I64 => WasmType::I64,
            ValType::F32 => WasmType::F32,
            ValType::F64 => WasmType::F64,
            ValType::V128 => WasmType::V128,
            ValType::Ref(_) => WasmType::Ref,
        }
    }
}

impl fmt::Display for WasmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WasmType::I32 => write!(f, "i32"),
            WasmType::I64 => write!(f, "i64"),
            WasmType::F32 => write!(f, "f32"),
            WasmType::F64 => write!(f, "f64"),
            WasmType::V128 => write!(f, "v128"),
            WasmType::Ref => write!(f, "ref"),
        }
    }
}

/// Function signature in host-neutral form
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    pub params: Vec<WasmType>,
    pub results: Vec<WasmType>,
}

impl Signature {
    pub fn new(params: &[WasmType], results: &[WasmType]) -> Self {
        Self {
            params: params.to_vec(),
            results: results.to_vec(),
        }
    }

    pub(crate) fn of(ty: &wasmtime::FuncType) -> Self {
        Self {
            params: ty.params().map(|p| WasmType::from(&p)).collect(),
            results: ty.results().map(|r| WasmType::from(&r)).collect(),
        }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |tys: &[WasmType]| {
            tys.iter()
                .map(|t| t.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };
        write!(
            f,
            "func({}) -> ({})",
            join(&self.params),
            join(&self.results)
        )
    }
}

/// Classified cause of a guest trap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrapCode {
    MemoryOutOfBounds,
    Unreachable,
    IntegerDivideByZero,
    IntegerOverflow,
    BadConversionToInteger,
    StackOverflow,
    IndirectCallToNull,
    BadSignature,
    TableOutOfBounds,
    /// Epoch deadline reached
    Interrupted,
    OutOfFuel,
    /// A host function failed with something other than `proc_exit`
    HostError,
    Other,
}

impl From<Trap> for TrapCode {
    fn from(trap: Trap) -> Self {
        match trap {
            Trap::MemoryOutOfBounds | Trap::HeapMisaligned => TrapCode::MemoryOutOfBounds,
            Trap::UnreachableCodeReached => TrapCode::Unreachable,
            Trap::IntegerDivisionByZero => TrapCode::IntegerDivideByZero,
            Trap::IntegerOverflow => TrapCode::IntegerOverflow,
            Trap::BadConversionToInteger => TrapCode::BadConversionToInteger,
            Trap::StackOverflow => TrapCode::StackOverflow,
            Trap::IndirectCallToNull => TrapCode::IndirectCallToNull,
            Trap::BadSignature => TrapCode::BadSignature,
            Trap::TableOutOfBounds => TrapCode::TableOutOfBounds,
            Trap::Interrupt => TrapCode::Interrupted,
            Trap::OutOfFuel => TrapCode::OutOfFuel,
            _ => TrapCode::Other,
        }
    }
}

impl fmt::Display for TrapCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrapCode::MemoryOutOfBounds => "memory out of bounds",
            TrapCode::Unreachable => "unreachable",
            TrapCode::IntegerDivideByZero => "integer divide by zero",
            TrapCode::IntegerOverflow => "integer overflow",
            TrapCode::BadConversionToInteger => "bad conversion to integer",
            TrapCode::StackOverflow => "stack overflow",
            TrapCode::IndirectCallToNull => "indirect call to null",
            TrapCode::BadSignature => "bad signature",
            TrapCode::TableOutOfBounds => "table out of bounds",
            TrapCode::Interrupted => "interrupted",
            TrapCode::OutOfFuel => "out of fuel",
            TrapCode::HostError => "host error",
            TrapCode::Other => "trap",
        };
        f.write_str(s)
    }
}

/// Trap description reported to the embedder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrapReason {
    pub code: TrapCode,
    pub message: String,
}

impl TrapReason {
    pub fn new(code: TrapCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for TrapReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Execution convention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecMode {
    /// Call the entry export once and report the exit code
    #[default]
    Command,
    /// Keep the instance alive and call exports by name
    Reactor,
}

/// Termination outcome of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    Exited(i32),
    Trapped(TrapReason),
    /// Reactor instance that has not terminated
    Running,
}

impl RunOutcome {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            RunOutcome::Exited(code) => Some(*code),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunOutcome::Running)
    }
}

/// Per-run lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RunState {
    #[default]
    Created,
    /// Import check or wasmtime linking failed; nothing executed
    LinkFailed,
    Instantiated,
    Running,
    Exited,
    Trapped,
}

/// Result record handed back to the embedder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub outcome: RunOutcome,
}

impl RunReport {
    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}
