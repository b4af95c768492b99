use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use biobank_registry_sync::config::{ConfigLoader, ResolvedConfig, Transport};
use biobank_registry_sync::output::JsonOutput;
use biobank_registry_sync::registry::{
    GraphqlRegistryClient, MockRegistryClient, RegistryClient, RestRegistryClient,
};
use biobank_registry_sync::source::HttpSourceClient;
use biobank_registry_sync::sync::{SyncOutcome, Syncer};

#[derive(Parser)]
#[command(name = "registry-sync")]
#[command(about = "Synchronize a biobank registry with aggregated local specimen data")]
#[command(version, author)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run one synchronization invocation (with internal retries)")]
    Run(RunArgs),
    #[command(about = "Load and print the resolved configuration")]
    Check(CheckArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(long, help = "Path to the config file (default: registry-sync.json)")]
    config: Option<String>,

    #[arg(long, help = "Short-circuit all registry writes, still run aggregation")]
    dry_run: bool,

    #[arg(long, value_enum, help = "Override the registry transport")]
    transport: Option<Transport>,
}

#[derive(Args)]
struct CheckArgs {
    #[arg(long, help = "Path to the config file (default: registry-sync.json)")]
    config: Option<String>,
}

fn main() -> miette::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args),
        Commands::Check(args) => check(args),
    }
}

fn run(args: RunArgs) -> miette::Result<ExitCode> {
    let mut config = ConfigLoader::resolve(args.config.as_deref()).into_diagnostic()?;
    if args.dry_run {
        config.mock_registry = true;
    }
    if let Some(transport) = args.transport {
        config.transport = transport;
    }

    let source = HttpSourceClient::new(&config.source_url).into_diagnostic()?;
    let registry = build_registry(&config).into_diagnostic()?;
    let mut syncer = Syncer::new(&config, &source, registry.as_ref());
    let report = syncer.run();
    JsonOutput::print_report(&report).into_diagnostic()?;

    match report.outcome {
        SyncOutcome::Success | SyncOutcome::Disabled => Ok(ExitCode::SUCCESS),
        SyncOutcome::Failed => Ok(ExitCode::FAILURE),
    }
}

fn build_registry(
    config: &ResolvedConfig,
) -> Result<Box<dyn RegistryClient>, biobank_registry_sync::error::SyncError> {
    if config.mock_registry {
        return Ok(Box::new(MockRegistryClient));
    }
    let (username, password) = config
        .credentials
        .as_ref()
        .map(|credentials| (credentials.username.as_str(), credentials.password.as_str()))
        .unwrap_or(("", ""));
    let client: Box<dyn RegistryClient> = match config.transport {
        Transport::Rest => Box::new(RestRegistryClient::new(
            &config.registry_url,
            username,
            password,
        )?),
        Transport::Graphql => Box::new(GraphqlRegistryClient::new(
            &config.registry_url,
            username,
            password,
        )?),
    };
    Ok(client)
}

fn check(args: CheckArgs) -> miette::Result<ExitCode> {
    let config = ConfigLoader::resolve(args.config.as_deref()).into_diagnostic()?;
    JsonOutput::print_json(&serde_json::json!({
        "registryUrl": config.registry_url,
        "sourceUrl": config.source_url,
        "transport": config.transport,
        "credentialsConfigured": config.credentials.is_some(),
        "retryMax": config.retry_max,
        "retryInterval": config.retry_interval_secs,
        "minDonors": config.min_donors,
        "maxFacts": config.max_facts,
        "starModel": config.star_model,
        "mockRegistry": config.mock_registry,
    }))
    .into_diagnostic()?;
    Ok(ExitCode::SUCCESS)
}
