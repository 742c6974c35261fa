use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use patchloop::allowlist::{default_extensions, extract_locations, AllowList};
use patchloop::apply::Runner;
use patchloop::batch::{append_patch, load_batch};
use patchloop::config::Config;
use patchloop::gate::{MatchStrictness, PatchDecision, PatchGate};
use patchloop::llm::ProviderChain;
use patchloop::report::BatchReport;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "patchloop",
    about = "Gate, apply, and verify LLM-generated patches against static analyzer findings",
    version
)]
struct Cli {
    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the files an analyzer report allows patches to touch
    Allowlist(AllowlistArgs),
    /// Gate a single patch file; exit 1 when it is rejected
    Check(CheckArgs),
    /// Apply, verify, and revert every patch of a batch
    Run(RunArgs),
    /// Ask the provider chain for a patch and append it to the batch
    Generate(GenerateArgs),
}

#[derive(Args, Debug)]
struct AllowlistArgs {
    #[arg(long = "report", required = true, num_args = 1..)]
    reports: Vec<PathBuf>,
    /// Extensions to recognize (defaults to C/C++ and Python)
    #[arg(long, value_delimiter = ',')]
    extensions: Vec<String>,
    /// Also print every `path:line` location found
    #[arg(long)]
    locations: bool,
}

#[derive(Args, Debug)]
struct CheckArgs {
    #[arg(long = "report", required = true, num_args = 1..)]
    reports: Vec<PathBuf>,
    #[arg(long)]
    patch: PathBuf,
    #[arg(long, value_enum, default_value_t = MatchStrictness::Suffix)]
    strictness: MatchStrictness,
    #[arg(long, value_delimiter = ',')]
    extensions: Vec<String>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides `batch_file`
    #[arg(long)]
    batch: Option<PathBuf>,
    /// Overrides `report_file`
    #[arg(long)]
    output: Option<PathBuf>,
    /// Also write the results as JSON
    #[arg(long)]
    json: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct GenerateArgs {
    #[arg(long)]
    prompt_file: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides `batch_file`
    #[arg(long)]
    batch: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Allowlist(args) => run_allowlist(args),
        Commands::Check(args) => run_check(args),
        Commands::Run(args) => run_batch(args),
        Commands::Generate(args) => run_generate(args).await,
    };
    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn extensions_or_default(extensions: Vec<String>) -> Vec<String> {
    if extensions.is_empty() {
        default_extensions()
    } else {
        extensions
    }
}

fn run_allowlist(args: AllowlistArgs) -> Result<ExitCode> {
    let extensions = extensions_or_default(args.extensions);
    if args.locations {
        for path in &args.reports {
            let text = read_text(path, "analysis report")?;
            for loc in extract_locations(&text, &extensions) {
                println!("{}:{}", loc.path, loc.line);
            }
        }
    }
    let allow = AllowList::from_report_files(&args.reports, &extensions)?;
    for path in allow.iter() {
        println!("{}", path);
    }
    eprintln!("{} allowed file(s)", allow.len());
    Ok(ExitCode::SUCCESS)
}

fn run_check(args: CheckArgs) -> Result<ExitCode> {
    let extensions = extensions_or_default(args.extensions);
    let allow = AllowList::from_report_files(&args.reports, &extensions)?;
    let gate = PatchGate::new(allow).with_strictness(args.strictness);
    let patch = read_text(&args.patch, "patch")?;

    match gate.evaluate(&patch) {
        PatchDecision::Accepted(diff) => {
            let (additions, deletions) = diff.totals();
            println!("Accepted: +{} -{}", additions, deletions);
            for file in diff.files() {
                println!("  {}", file);
            }
            Ok(ExitCode::SUCCESS)
        }
        rejected => {
            if let Err(reason) = rejected.into_result() {
                println!("Rejected: {}", reason);
            }
            Ok(ExitCode::from(1))
        }
    }
}

fn run_batch(args: RunArgs) -> Result<ExitCode> {
    let config = Config::load(args.config.as_deref())?;
    config.require_targets()?;

    let batch_path = args.batch.unwrap_or_else(|| config.batch_path());
    let report_path = args.output.unwrap_or_else(|| config.report_path());

    let gate = config.gate()?;
    if gate.allow_list().is_empty() {
        tracing::warn!("allow-list is empty; every patch will be rejected");
    }
    let blocks = load_batch(&batch_path)?;
    if blocks.is_empty() {
        tracing::warn!(batch = %batch_path.display(), "batch contains no patches");
    }

    let mut runner = Runner::new(config.patch_tool()?, config.working_copies())
        .with_log_limit(config.log_limit);
    let _locks = runner.lock_all()?;
    let reports = runner.run_batch(&gate, &blocks);
    let quarantined = runner
        .quarantined()
        .into_iter()
        .map(String::from)
        .collect();

    let batch = BatchReport::new(reports, quarantined);
    batch.write_markdown(&report_path)?;
    if let Some(json) = &args.json {
        batch.write_json(json)?;
    }

    for line in batch.summary_lines() {
        println!("{}", line);
    }
    println!("  Report: {}", report_path.display());

    if batch.has_corruption() {
        return Ok(ExitCode::from(2));
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_generate(args: GenerateArgs) -> Result<ExitCode> {
    let config = Config::load(args.config.as_deref())?;
    let batch_path = args.batch.unwrap_or_else(|| config.batch_path());
    let prompt = read_text(&args.prompt_file, "prompt")?;

    let chain = ProviderChain::from_config(&config.providers)?;
    let completion = chain.complete_diff(&prompt).await?;

    let gate = config.gate()?;
    if let Err(reason) = gate.evaluate(&completion.text).into_result() {
        println!("Rejected patch from {}: {}", completion.provider, reason);
        return Ok(ExitCode::from(1));
    }

    let index = append_patch(&batch_path, &completion.text)?;
    println!(
        "Appended patch {} from {} to {}",
        index,
        completion.provider,
        batch_path.display()
    );
    Ok(ExitCode::SUCCESS)
}

fn read_text(path: &Path, what: &str) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("Failed to read {} '{}'", what, path.display()))
}
