// CLI binary: panicking on unrecoverable errors is standard for CLI tools.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::unreachable, clippy::indexing_slicing)]

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use threadcode::error::AppError;
use threadcode::settings::{self, CompileOptions};
use threadcode::threaded::{self, CompileError, Globals, Program, Recorder, SourceFile};

// ── CLI argument parsing ─────────────────────────────────────────

#[derive(Parser)]
#[command(name = "threadc", about = "Compile and run threaded-code programs", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Compile options file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output raw JSON instead of formatted text
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a program and report diagnostics
    Check(Input),
    /// Compile and execute a program, then print its top-level variables
    Run(Input),
    /// Print the compiled step listing
    Dump(Input),
}

#[derive(clap::Args)]
struct Input {
    /// Program file: `{"body": [...]}`
    program: PathBuf,

    /// Source text the spans refer to, for line:column diagnostics
    #[arg(long)]
    source: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let options = match &cli.config {
        Some(path) => settings::load(path).unwrap_or_else(|e| fail(&e, cli.json)),
        None => CompileOptions::default(),
    };

    let (Commands::Check(input) | Commands::Run(input) | Commands::Dump(input)) = &cli.command;
    let file: SourceFile = settings::read_json(&input.program).unwrap_or_else(|e| fail(&e, cli.json));
    let source = input
        .source
        .as_ref()
        .map(|p| settings::read_text(p).unwrap_or_else(|e| fail(&e, cli.json)));

    let mut globals = Globals::with_builtins();
    let recorder = Recorder::new();
    recorder.install(&mut globals);

    let program = match threaded::compile(&file.body, &globals, &options) {
        Ok(program) => program,
        Err(errors) => {
            print_diagnostics(&errors, source.as_deref(), cli.json);
            process::exit(1);
        }
    };

    match &cli.command {
        Commands::Check(_) => {
            if cli.json {
                println!("{}", json!({ "ok": true, "steps": program.len() }));
            } else {
                println!("ok: {} steps, frame of {}", program.len(), program.frame_size());
            }
        }
        Commands::Dump(_) => print_ops(&program, cli.json),
        Commands::Run(_) => run(&program, &recorder, cli.json),
    }
}

fn fail(err: &AppError, raw_json: bool) -> ! {
    if raw_json {
        println!("{}", serde_json::to_string_pretty(err).unwrap_or_default());
    } else {
        eprintln!("error: {err}");
    }
    process::exit(1);
}

// ── Output formatting ────────────────────────────────────────────

fn print_diagnostics(errors: &[CompileError], source: Option<&str>, raw_json: bool) {
    if raw_json {
        let err = AppError::from(errors.to_vec());
        println!("{}", serde_json::to_string_pretty(&err).unwrap_or_default());
        return;
    }
    for err in errors {
        match source {
            Some(src) => eprintln!("{}", err.format_with_source(src)),
            None => eprintln!("{}: {err}", err.span),
        }
    }
}

fn print_ops(program: &Program, raw_json: bool) {
    if raw_json {
        println!("{}", serde_json::to_string_pretty(program.ops()).unwrap_or_default());
        return;
    }
    for (ip, op) in program.ops().iter().enumerate() {
        println!("{ip:>4}  {op:?}");
    }
}

fn run(program: &Program, recorder: &Recorder, raw_json: bool) {
    let env = program.run().unwrap_or_else(|e| fail(&AppError::from(e), raw_json));
    let vars: Vec<(String, String)> = program
        .exports()
        .map(|name| (name.to_string(), env.get(name).map(|v| v.to_string()).unwrap_or_default()))
        .collect();
    let marks = recorder.marks();

    if raw_json {
        let vars: serde_json::Map<_, _> = vars.into_iter().map(|(k, v)| (k, json!(v))).collect();
        println!("{}", json!({ "vars": vars, "marks": marks }));
        return;
    }
    for (name, value) in &vars {
        println!("{name} = {value}");
    }
    if !marks.is_empty() {
        println!("marks: {marks:?}");
    }
}
