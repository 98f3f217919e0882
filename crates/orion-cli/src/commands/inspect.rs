//! `orion inspect` command implementation

use crate::error::CliError;
use crate::output::ModuleListing;
use colored::Colorize;
use orion_host::{HostRuntime, ModuleSource};

/// Execute the `orion inspect` command
pub async fn run(locator: &str, json: bool) -> Result<i32, CliError> {
    let runtime = HostRuntime::default_runtime()?;
    let module = runtime.load(ModuleSource::parse(locator)).await?;
    let listing = ModuleListing::new(&module);

    if json {
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(0);
    }

    println!(
        "{} {} ({} bytes)",
        "Module:".bold(),
        listing.name,
        listing.size_bytes
    );
    println!("  sha256: {}", listing.sha256);

    println!("{}", "Imports:".bold());
    if listing.imports.is_empty() {
        println!("  (none)");
    }
    for import in &listing.imports {
        let mark = if import.satisfied {
            "✓".green()
        } else {
            "✗".red()
        };
        println!(
            "  {} {}::{}  {}",
            mark, import.module, import.name, import.kind
        );
    }

    println!("{}", "Exports:".bold());
    for export in &listing.exports {
        println!("  {}  {}", export.name, export.kind);
    }

    if !listing.runnable() {
        println!(
            "{} module imports functions this host does not provide",
            "!".yellow()
        );
    }
    Ok(0)
}
