use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

use jobnet::cli::{Cli, Command, EXIT_SIBLINGS_PENDING, finalize_exit_code};
use jobnet::config::JobNetConfig;
use jobnet::notifier::{ParentNotifier, SiblingGate};
use jobnet::orchestrator::{CompletionOrchestrator, RunCompletion};
use jobnet::recovery::StopFlag;
use jobnet::store::HttpRecordStore;
use jobnet::telemetry::{TracingTelemetry, init_logging};
use jobnet::ui::FinalizeProgress;
use jobnet::demo;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = JobNetConfig::load_from(&cli.config)?;
    if let Some(max) = cli.max_cycles {
        config.max_cycles = Some(max);
    }

    match cli.command {
        Command::Finalize { file } => finalize(&file, config).await,
        Command::Siblings { parent, exclude } => siblings(&parent, exclude.as_deref(), &config).await,
        Command::Demo => {
            demo::run(config).await;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn finalize(file: &Path, config: JobNetConfig) -> Result<ExitCode> {
    let completion = RunCompletion::from_file(file)
        .with_context(|| format!("reading run completion from {}", file.display()))?;
    let store = HttpRecordStore::from_config(&config)?;
    let orchestrator = CompletionOrchestrator::new(store, config);

    let progress = FinalizeProgress::start(&completion.run.id);
    let report = orchestrator.finalize(&completion).await;
    progress.finish(&report);

    let stop = orchestrator.stop_flag();
    if let Some(reason) = stop.reason() {
        eprintln!("stop signal raised: {reason}");
    }
    Ok(ExitCode::from(finalize_exit_code(&report, stop)))
}

async fn siblings(parent: &str, exclude: Option<&str>, config: &JobNetConfig) -> Result<ExitCode> {
    let store = HttpRecordStore::from_config(config)?;
    let stop = StopFlag::new();
    let notifier = ParentNotifier::new(&store, &TracingTelemetry, config, &stop);

    match notifier.sibling_gate(parent, exclude).await {
        SiblingGate::Open => {
            println!("all children of {parent} are terminal");
            Ok(ExitCode::SUCCESS)
        }
        SiblingGate::Pending(pending) => {
            println!("{} child job(s) of {parent} still running:", pending.len());
            for id in pending {
                println!("  {id}");
            }
            Ok(ExitCode::from(EXIT_SIBLINGS_PENDING))
        }
        SiblingGate::Unavailable(error) => {
            anyhow::bail!("could not list children of {parent}: {error}")
        }
    }
}
