//! A small CLI front-end over [`qjs_runtime_core::ExecutionService`].
//!
//! This binary is a demo, not a host dispatcher: any native call the
//! script makes will sit unanswered in the pending-call queue until the
//! execution times out, since resolving calls against real host
//! behavior is the embedding application's job, not this crate's.

use std::fs;
use std::path::PathBuf;

use clap::Parser;
use qjs_runtime_core::ExecutionService;
use tracing::instrument;

/// Run a script file through the sandboxed execution core.
#[derive(Parser, Debug)]
struct Cli {
    /// Path to the script file to execute.
    script: PathBuf,

    /// JSON text passed to the script as `params`.
    #[arg(long, default_value = "{}")]
    params: String,

    /// JSON object exposed to the script as `__globals`.
    #[arg(long, default_value = "{}")]
    globals: String,

    /// Names of native functions the script is allowed to call.
    #[arg(long)]
    native_fn: Vec<String>,

    /// Execution timeout in milliseconds.
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,
}

#[instrument(skip_all, level = "info")]
fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let script = fs::read_to_string(&cli.script)?;

    let service = ExecutionService::with_default_config()?;
    let outcome = service.execute(
        &script,
        &cli.params,
        &cli.globals,
        &cli.native_fn,
        cli.timeout_ms,
    );

    println!("{outcome}");
    Ok(())
}
