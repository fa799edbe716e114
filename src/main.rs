mod config;
mod dependency;
mod descriptor;
mod errors;
mod extractor;
mod ir;
mod matcher;
mod opcodes;
mod orchestrator;
mod output;
mod provider;
mod telemetry;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use opentelemetry::KeyValue;
use tracing::error;

use crate::config::{Config, ConfigArgs};
use crate::telemetry::{init_logging, with_span, Telemetry};

/// CLI arguments for libsniff execution (§4.5).
#[derive(Parser, Debug)]
#[command(
    name = "libsniff",
    about = "Detects third-party library usage in Android bytecode via obfuscation-tolerant similarity matching.",
    version
)]
struct Cli {
    #[arg(
        long = "app",
        value_name = "PATH",
        required = true,
        action = clap::ArgAction::Append,
        help = "Application artifact(s) to scan. Accepts @file references (one path per line). Repeatable."
    )]
    app: Vec<String>,
    #[arg(long, value_name = "DIR", help = "Corpus directory of per-library artifacts, or a single artifact.")]
    corpus: PathBuf,
    #[arg(long, value_name = "DIR", help = "Directory containing opcodes_encoding.txt and, optionally, lib_name_map.csv.")]
    config_dir: PathBuf,
    #[arg(long, value_name = "DIR", help = "Directory to write per-application result files into.")]
    output: PathBuf,
    #[arg(long, value_name = "FLOAT", help = "Override the class-level acceptance threshold (default 0.85).")]
    class_similar: Option<f64>,
    #[arg(long, value_name = "FLOAT", help = "Override the library-level acceptance threshold (default 0.85).")]
    lib_similar: Option<f64>,
    #[arg(long, value_name = "N", help = "Override the minimum eligible method opcode count (default 3).")]
    min_method_opcode_num: Option<usize>,
    #[arg(long, value_name = "N", help = "Override the maximum eligible method opcode count.")]
    max_opcode_len: Option<usize>,
    #[arg(long, value_name = "N", help = "Override the weight an interface-only method contributes (default 3).")]
    abstract_method_weight: Option<u32>,
    #[arg(long, value_name = "N", help = "Override the bloom counter saturation limit (default 10).")]
    filter_record_limit: Option<u8>,
    #[arg(long = "max-threads", value_name = "N", help = "Cap on worker threads (default: CPU count).")]
    max_threads: Option<usize>,
    #[arg(long, value_name = "URL", help = "OTLP HTTP collector URL (recommended: http://localhost:4318/).")]
    otel: Option<String>,
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:?}");
            std::process::ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    init_logging();

    let base_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let applications = expand_path_args(&cli.app, &base_dir).context("failed to expand --app arguments")?;
    let applications = filter_missing_paths("app", applications)?;
    if applications.is_empty() {
        anyhow::bail!("no application inputs provided");
    }

    let telemetry = match &cli.otel {
        Some(endpoint) => Some(Telemetry::new(Some(endpoint.clone()))?),
        None => None,
    };

    let config_args = ConfigArgs {
        corpus_path: cli.corpus.clone(),
        config_dir: cli.config_dir.clone(),
        class_similar: cli.class_similar,
        lib_similar: cli.lib_similar,
        min_method_opcode_num: cli.min_method_opcode_num,
        max_opcode_len: cli.max_opcode_len,
        abstract_method_weight: cli.abstract_method_weight,
        filter_record_limit: cli.filter_record_limit,
        max_threads: cli.max_threads,
    };
    let config = Config::load(&config_args)?;

    fs::create_dir_all(&cli.output)
        .with_context(|| format!("failed to create output directory {}", cli.output.display()))?;
    let method_index_path = cli.output.join("methodes_jar.txt");

    let build_result = with_span(
        telemetry.as_ref(),
        "build",
        &[KeyValue::new("libsniff.phase", "build")],
        || orchestrator::build_corpus(&config, &cli.corpus, &method_index_path),
    );
    let (by_package, dependency_graph) = build_result?;

    let detect_result = with_span(
        telemetry.as_ref(),
        "detect",
        &[KeyValue::new("libsniff.phase", "detect")],
        || orchestrator::run(&config, &by_package, &dependency_graph, &applications, &cli.output),
    );

    if let Some(telemetry) = &telemetry {
        if let Err(err) = telemetry.shutdown() {
            error!("telemetry shutdown failed: {err}");
        }
    }

    detect_result
}

/// Expands `--app` values, resolving `@file` references to one path per line
/// (circular references rejected).
fn expand_path_args(args: &[String], base_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut expanded = Vec::new();
    let mut stack = Vec::new();
    for arg in args {
        expanded.extend(expand_path_arg(arg, base_dir, &mut stack)?);
    }
    Ok(expanded)
}

fn expand_path_arg(arg: &str, base_dir: &Path, stack: &mut Vec<PathBuf>) -> Result<Vec<PathBuf>> {
    let Some(path_str) = arg.strip_prefix('@') else {
        return Ok(vec![PathBuf::from(arg)]);
    };
    if path_str.is_empty() {
        anyhow::bail!("empty @file reference");
    }
    let file_path = PathBuf::from(path_str);
    let resolved = if file_path.is_absolute() {
        file_path
    } else {
        base_dir.join(file_path)
    };
    let canonical = resolved
        .canonicalize()
        .with_context(|| format!("failed to resolve {}", resolved.display()))?;
    if stack.contains(&canonical) {
        anyhow::bail!("circular @file reference: {}", canonical.display());
    }
    let content = fs::read_to_string(&canonical)
        .with_context(|| format!("failed to read {}", canonical.display()))?;
    stack.push(canonical.clone());
    let file_dir = canonical.parent().unwrap_or_else(|| Path::new(""));
    let mut paths = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with('@') {
            paths.extend(expand_path_arg(line, file_dir, stack)?);
            continue;
        }
        let entry = PathBuf::from(line);
        let resolved_entry = if entry.is_absolute() {
            entry
        } else {
            file_dir.join(entry)
        };
        paths.push(resolved_entry);
    }
    stack.pop();
    Ok(paths)
}

fn filter_missing_paths(label: &str, paths: Vec<PathBuf>) -> Result<Vec<PathBuf>> {
    let mut filtered = Vec::new();
    for path in paths {
        if path.exists() {
            filtered.push(path);
            continue;
        }
        anyhow::bail!("{label} not found: {}", path.display());
    }
    Ok(filtered)
}
