use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use miette::{Context, IntoDiagnostic};

use vira_ir::Module;
use vira_lower::{PassId, PassManager, PipelineConfig};
use vira_target::{TargetDescriptor, TargetRegistry};

/// VIRA: lowers loop/vector kernels to the accelerator's virtual ISA
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Input module (JSON)
    input: PathBuf,

    /// Built-in target: v1, v2 or v3
    #[arg(short, long, default_value = "v2")]
    target: String,

    /// Target descriptor file (JSON); overrides --target
    #[arg(long)]
    target_file: Option<PathBuf>,

    /// Pipeline configuration file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Comma-separated pass list to run instead of the default pipeline
    #[arg(long, value_delimiter = ',')]
    passes: Option<Vec<String>>,

    /// Fix a symbolic buffer extent, e.g. `--size n=64` (repeatable)
    #[arg(long = "size", value_name = "NAME=VALUE", value_parser = parse_size)]
    sizes: Vec<(String, i64)>,

    /// Dump the input IR to stderr before lowering
    #[arg(long)]
    emit_ir: bool,

    /// Lower without writing the result
    #[arg(long)]
    dry_run: bool,

    /// Output path for the lowered module (default: stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Verbose output (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .format_timestamp(None)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        }
    }
}

fn read(path: &Path) -> miette::Result<String> {
    std::fs::read_to_string(path)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to read {}", path.display()))
}

fn load_target(cli: &Cli) -> miette::Result<TargetDescriptor> {
    if let Some(path) = &cli.target_file {
        return TargetDescriptor::from_json(&read(path)?)
            .map_err(|e| miette::miette!("{e}"))
            .wrap_err_with(|| format!("bad target descriptor {}", path.display()));
    }
    TargetRegistry::with_builtins()
        .resolve(&cli.target)
        .cloned()
        .map_err(|e| miette::miette!("{e}"))
}

fn parse_size(s: &str) -> Result<(String, i64), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got `{s}`"))?;
    let value = value
        .trim()
        .parse()
        .map_err(|e| format!("bad value for `{name}`: {e}"))?;
    Ok((name.trim().to_string(), value))
}

fn load_config(cli: &Cli) -> miette::Result<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => serde_json::from_str(&read(path)?)
            .into_diagnostic()
            .wrap_err_with(|| format!("bad pipeline configuration {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(names) = &cli.passes {
        let ids = names
            .iter()
            .map(|name| name.trim().parse::<PassId>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| miette::miette!("{e}"))?;
        config.passes = Some(ids);
    }
    config.size_bindings.extend(cli.sizes.iter().cloned());
    Ok(config)
}

fn run(cli: Cli) -> miette::Result<()> {
    // 1. Read the module, target and configuration.
    let module: Module = serde_json::from_str(&read(&cli.input)?)
        .into_diagnostic()
        .wrap_err_with(|| format!("{} is not a VIRA module", cli.input.display()))?;
    let target = load_target(&cli)?;
    let config = load_config(&cli)?;
    log::info!("target: {target}");

    // 2. Optionally dump IR to stderr.
    if cli.emit_ir {
        eprintln!("{}", vira_ir::dump_module(&module));
    }

    // 3. Lower every function; report each failure.
    let pm = PassManager::from_config(config);
    log::debug!("pipeline: {}", pm.pass_names().join(", "));
    let properties = pm
        .check_order(module.properties)
        .map_err(|e| miette::miette!("{e}"))?;
    let results = pm
        .run_each(module, &target)
        .map_err(|e| miette::miette!("{e}"))
        .wrap_err("module rejected")?;

    let mut lowered = Module::new();
    let mut first_error = None;
    for (name, result) in results {
        match result {
            Ok(func) => lowered.add_function(func),
            Err(err) => {
                log::error!("`{name}`: {err}");
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
    }
    if let Some(err) = first_error {
        return Err(miette::miette!("{err}")).wrap_err("lowering failed");
    }
    lowered.properties = properties;

    // 4. Dry-run: stop here.
    if cli.dry_run {
        return Ok(());
    }

    // 5. Write output.
    let json = serde_json::to_string_pretty(&lowered).into_diagnostic()?;
    match &cli.output {
        Some(path) => std::fs::write(path, json)
            .into_diagnostic()
            .wrap_err_with(|| format!("failed to write {}", path.display()))?,
        None => println!("{json}"),
    }
    Ok(())
}
