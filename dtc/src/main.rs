use std::{
    fs,
    io::{self, Read, Write},
    ops::Range,
    path::{Path, PathBuf},
    process,
};

use anyhow::{Context, Result};
use ariadne::{sources, Label, Report, ReportKind};
use clap::Parser;
use dts_compiler::{compile, CompileOptions, Error, Position};

mod logger;

/// Source name and character range, as reported by ariadne.
type SourceSpan = (String, Range<usize>);

/// Compile Device Tree Source into a flattened device tree blob.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Source file, `-` for standard input.
    #[arg(default_value = "-")]
    input: PathBuf,

    /// Blob output file. Defaults to standard output.
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// Physical id of the boot CPU.
    #[arg(short, long, default_value_t = 0)]
    boot_cpu: u32,

    /// Add a memory reservation, on top of the `/memreserve/` entries of the source.
    #[arg(short, long, value_name = "ADDR:SIZE", value_parser = parse_reservation)]
    reserve: Vec<(u64, u64)>,

    /// Fail on validation warnings.
    #[arg(short = 'E', long)]
    warnings_as_errors: bool,

    /// Log more, can be repeated.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let args = Args::parse();
    logger::init(args.verbose);

    match run(&args) {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            log::error!("{e:#}");
            process::exit(1);
        }
    }
}

/// Compile `args.input`, returning whether a blob was written.
fn run(args: &Args) -> Result<bool> {
    let (name, source) = read_source(&args.input)?;

    let options = CompileOptions {
        boot_cpuid: args.boot_cpu,
        reserved_memory: args.reserve.clone(),
        warnings_as_errors: args.warnings_as_errors,
        ..Default::default()
    };

    let output = match compile(&source, &options) {
        Ok(output) => output,
        Err(e) => {
            report(ReportKind::Error, &name, &source, &e)?;
            return Ok(false);
        }
    };

    for diagnostic in &output.diagnostics {
        Report::<SourceSpan>::build(ReportKind::Warning, name.clone(), 0)
            .with_message(diagnostic)
            .finish()
            .eprint(sources([(name.clone(), source.clone())]))?;
    }

    match &args.out {
        Some(path) => fs::write(path, &output.blob)
            .with_context(|| format!("failed to write {}", path.display()))?,
        None => io::stdout()
            .lock()
            .write_all(&output.blob)
            .context("failed to write the blob to standard output")?,
    }

    log::info!("{name}: wrote a {} byte blob", output.blob.len());
    Ok(true)
}

fn read_source(input: &Path) -> Result<(String, String)> {
    if input.as_os_str() == "-" {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read standard input")?;
        return Ok(("<stdin>".into(), buf));
    }

    let source = fs::read_to_string(input)
        .with_context(|| format!("failed to read {}", input.display()))?;
    Ok((input.display().to_string(), source))
}

/// Render a compilation error, pointing at its source position when it has one.
fn report(kind: ReportKind, name: &str, source: &str, err: &Error) -> io::Result<()> {
    // ariadne counts characters, not bytes.
    let offset = |p: Position| source.get(..p.offset).map_or(0, |s| s.chars().count());

    let (message, label) = match err {
        Error::Lex(e) => ("invalid token".to_string(), e.reason.to_string()),
        Error::Parse(e) => (
            "syntax error".to_string(),
            format!("expected {}, found {}", e.expected, e.found),
        ),
        Error::UnresolvedReference { label, .. } => {
            (err.to_string(), format!("'{label}' is not defined"))
        }
        Error::DuplicateLabel { label, first, .. } => {
            (err.to_string(), format!("'{label}' already labels {first}"))
        }
        Error::PhandleConflict { phandle, first, .. } => {
            (err.to_string(), format!("{phandle:#x} is already used by {first}"))
        }
        Error::InvalidPhandle { .. } => (
            err.to_string(),
            "expected a single cell, neither 0 nor 0xffffffff".to_string(),
        ),
        other => (other.to_string(), String::new()),
    };

    let start = err.position().map_or(0, offset);
    let mut builder = Report::<SourceSpan>::build(kind, name.to_string(), start).with_message(message);
    if let Some(position) = err.position() {
        builder = builder.with_label(
            Label::new((name.to_string(), start..start + 1))
                .with_message(format!("{label} (at {position})")),
        );
    }

    builder
        .finish()
        .eprint(sources([(name.to_string(), source.to_string())]))
}

/// Parse an `ADDR:SIZE` pair, in decimal or `0x` prefixed hexadecimal.
fn parse_reservation(s: &str) -> Result<(u64, u64), String> {
    let int = |v: &str| {
        let v = v.trim();
        let parsed = match v.strip_prefix("0x").or_else(|| v.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => v.parse(),
        };
        parsed.map_err(|e| format!("invalid number '{v}': {e}"))
    };

    let (address, size) = s
        .split_once(':')
        .ok_or_else(|| format!("expected ADDR:SIZE, got '{s}'"))?;
    Ok((int(address)?, int(size)?))
}
