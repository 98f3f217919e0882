//! JSON views of run reports and module listings

use orion_host::{CompiledModule, ExternKind, RunOutcome, RunReport, TrapReason, WasmValue, host_imports};
use serde::Serialize;

/// Exit status used when the guest traps (SIGABRT convention)
pub const TRAP_EXIT_CODE: i32 = 134;

/// Process exit code for an outcome. A live reactor counts as success.
pub fn exit_code(outcome: &RunOutcome) -> i32 {
    match outcome {
        RunOutcome::Exited(code) => *code,
        RunOutcome::Trapped(_) => TRAP_EXIT_CODE,
        RunOutcome::Running => 0,
    }
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub module: String,
    pub mode: &'static str,
    pub status: &'static str,
    pub exit_code: Option<i32>,
    pub trap: Option<TrapReason>,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<WasmValue>>,
}

impl RunSummary {
    pub fn new(module: &str, mode: &'static str, report: &RunReport) -> Self {
        let (status, exit_code, trap) = match &report.outcome {
            RunOutcome::Exited(code) => ("exited", Some(*code), None),
            RunOutcome::Trapped(reason) => ("trapped", None, Some(reason.clone())),
            RunOutcome::Running => ("running", None, None),
        };
        Self {
            module: module.to_string(),
            mode,
            status,
            exit_code,
            trap,
            stdout: report.stdout_string(),
            stderr: report.stderr_string(),
            results: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ImportEntry {
    pub module: String,
    pub name: String,
    pub kind: String,
    pub satisfied: bool,
}

#[derive(Debug, Serialize)]
pub struct ExportEntry {
    pub name: String,
    pub kind: String,
}

#[derive(Debug, Serialize)]
pub struct ModuleListing {
    pub name: String,
    pub size_bytes: usize,
    pub sha256: String,
    pub imports: Vec<ImportEntry>,
    pub exports: Vec<ExportEntry>,
}

impl ModuleListing {
    pub fn new(module: &CompiledModule) -> Self {
        let provided = host_imports();
        let imports = module
            .imports()
            .iter()
            .map(|i| {
                let satisfied = match &i.kind {
                    ExternKind::Func(sig) => provided
                        .iter()
                        .any(|h| h.module == i.module && h.name == i.name && h.signature == *sig),
                    _ => false,
                };
                ImportEntry {
                    module: i.module.clone(),
                    name: i.name.clone(),
                    kind: i.kind.to_string(),
                    satisfied,
                }
            })
            .collect();
        let exports = module
            .exports()
            .iter()
            .map(|e| ExportEntry {
                name: e.name.clone(),
                kind: e.kind.to_string(),
            })
            .collect();

        Self {
            name: module.name.clone(),
            size_bytes: module.size_bytes,
            sha256: module.source_hash.clone(),
            imports,
            exports,
        }
    }

    pub fn runnable(&self) -> bool {
        self.imports.iter().all(|i| i.satisfied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orion_host::TrapCode;

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(exit_code(&RunOutcome::Exited(3)), 3);
        assert_eq!(exit_code(&RunOutcome::Running), 0);
        let trapped = RunOutcome::Trapped(TrapReason::new(TrapCode::Unreachable, "boom"));
        assert_eq!(exit_code(&trapped), TRAP_EXIT_CODE);
    }

    #[test]
    fn test_run_summary_json() {
        let report = RunReport {
            stdout: b"hi\n".to_vec(),
            stderr: Vec::new(),
            outcome: RunOutcome::Exited(0),
        };
        let value = serde_json::to_value(RunSummary::new("hello", "command", &report)).unwrap();
        assert_eq!(value["status"], "exited");
        assert_eq!(value["exit_code"], 0);
        assert_eq!(value["stdout"], "hi\n");
        assert!(value.get("results").is_none());
    }
}
