//! `orion run` command implementation

use crate::cli::RunArgs;
use crate::error::CliError;
use crate::output::{RunSummary, exit_code};
use colored::Colorize;
use orion_host::{
    CompiledModule, HostConfig, HostError, HostRuntime, ImportBinding, MemorySink, ModuleSource,
    OutputSink, RunOutcome, RunReport, RuntimeError, Stream, WasmValue,
};
use std::io::Write;
use std::sync::Arc;
use tracing::debug;

/// Forwards guest writes straight to the process's stdout and stderr.
struct StdioSink;

impl OutputSink for StdioSink {
    fn write(&self, stream: Stream, bytes: &[u8]) {
        // Nothing useful to do if the terminal went away.
        let _ = match stream {
            Stream::Stdout => {
                let mut out = std::io::stdout().lock();
                out.write_all(bytes).and_then(|_| out.flush())
            }
            Stream::Stderr => std::io::stderr().lock().write_all(bytes),
        };
    }
}

fn parse_call_args(raw: &[String]) -> Result<Vec<WasmValue>, CliError> {
    raw.iter()
        .map(|s| {
            WasmValue::parse(s)
                .ok_or_else(|| CliError::InvalidArgument(format!("cannot parse call argument '{}'", s)))
        })
        .collect()
}

/// Merge the config file and command-line flags.
fn resolve_config(args: &RunArgs) -> Result<HostConfig, CliError> {
    let mut config = match &args.config {
        Some(path) => HostConfig::load(path)?,
        None => HostConfig::default(),
    };

    if let Some(entry) = &args.entry {
        config.runtime.entry_point = entry.clone();
    }
    if args.fuel.is_some() {
        config.runtime.max_fuel = args.fuel;
    }
    if args.timeout_ms.is_some() {
        config.runtime.timeout_ms = args.timeout_ms;
    }
    if args.stdin_file.is_some() {
        config.wasi.stdin_file = args.stdin_file.clone();
    }
    config.wasi.env.extend(args.env.iter().cloned());
    Ok(config)
}

/// Instantiate as a Reactor, optionally call `invoke`, and finish the
/// instance. Guest code runs on the blocking pool, like Command runs do.
async fn run_reactor(
    runtime: &HostRuntime,
    module: Arc<CompiledModule>,
    binding: ImportBinding,
    invoke: Option<String>,
    call_args: Vec<WasmValue>,
) -> Result<(RunReport, Option<Vec<WasmValue>>), CliError> {
    let runtime = runtime.clone();
    tokio::task::spawn_blocking(move || {
        let mut instance = runtime.instantiate_reactor(&module, binding)?;
        let mut results = None;
        if let Some(name) = invoke {
            if !instance.outcome().is_terminal() {
                match instance.call(&name, &call_args) {
                    Ok(values) => results = Some(values),
                    // Recorded in the instance outcome.
                    Err(RuntimeError::Trapped(_) | RuntimeError::Exited(_)) => {}
                    Err(e) => return Err(HostError::from(e).into()),
                }
            }
        }
        Ok((instance.finish(), results))
    })
    .await
    .map_err(|e| HostError::Internal(format!("reactor task failed: {}", e)))?
}

/// Execute the `orion run` command, returning the process exit code.
pub async fn run(args: RunArgs) -> Result<i32, CliError> {
    let mut config = resolve_config(&args)?;
    let call_args = parse_call_args(&args.call_args)?;

    let runtime = HostRuntime::new(config.runtime_config())?;
    let ticker = config
        .runtime
        .timeout_ms
        .map(|_| runtime.start_epoch_ticker());

    let module = runtime.load(ModuleSource::parse(&args.module)).await?;

    if !args.guest_args.is_empty() || config.wasi.args.is_empty() {
        config.wasi.args = std::iter::once(module.name.clone())
            .chain(args.guest_args.iter().cloned())
            .collect();
    }

    // JSON mode keeps guest output out of the way until the report is printed.
    let sink: Arc<dyn OutputSink> = if args.json {
        MemorySink::shared()
    } else {
        Arc::new(StdioSink)
    };
    let binding = config.bindings(sink)?;

    let (report, results) = if args.reactor {
        run_reactor(&runtime, module.clone(), binding, args.invoke.clone(), call_args).await?
    } else {
        (runtime.run_async(module.clone(), binding).await?, None)
    };

    if let Some(ticker) = ticker {
        ticker.abort();
    }
    debug!("Run finished: {:?}", report.outcome);

    let mode = if args.reactor { "reactor" } else { "command" };
    if args.json {
        let mut summary = RunSummary::new(&module.name, mode, &report);
        summary.results = results;
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        if let Some(values) = &results {
            let line: Vec<String> = values.iter().map(|v| v.to_string()).collect();
            println!("{}", line.join(" "));
        }
        if let RunOutcome::Trapped(reason) = &report.outcome {
            eprintln!("{} {} trapped: {}", "✗".red(), module.name, reason);
        }
    }

    Ok(exit_code(&report.outcome))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDER: &[u8] = br#"(module
      (func (export "add") (param i32 i32) (result i32)
        local.get 0 local.get 1 i32.add)
      (func (export "boom") unreachable))"#;

    fn binding() -> ImportBinding {
        ImportBinding::build(MemorySink::shared(), ["adder"], Vec::<(String, String)>::new())
    }

    #[tokio::test]
    async fn test_run_reactor_on_blocking_pool() {
        let runtime = HostRuntime::default_runtime().unwrap();
        let module = runtime.compile("adder", ADDER).unwrap();

        let (report, results) = run_reactor(
            &runtime,
            module.clone(),
            binding(),
            Some("add".to_string()),
            vec![WasmValue::I32(40), WasmValue::I32(2)],
        )
        .await
        .unwrap();
        assert_eq!(results, Some(vec![WasmValue::I32(42)]));
        assert_eq!(report.outcome, RunOutcome::Running);

        let (report, results) = run_reactor(&runtime, module, binding(), Some("boom".to_string()), vec![])
            .await
            .unwrap();
        assert_eq!(results, None);
        assert!(matches!(report.outcome, RunOutcome::Trapped(_)));
    }

    #[test]
    fn test_parse_call_args() {
        let values = parse_call_args(&["3".to_string(), "i64:-1".to_string()]).unwrap();
        assert_eq!(values, vec![WasmValue::I32(3), WasmValue::I64(-1)]);
        assert!(matches!(
            parse_call_args(&["nope".to_string()]),
            Err(CliError::InvalidArgument(_))
        ));
    }
}
