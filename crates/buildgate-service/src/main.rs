use buildgate_adapters::HttpGeneratorConfig;
use buildgate_core::{StorageConfig, SweepPass};
use buildgate_service::{Command, PaymentRailMode, ServiceConfig, ServiceState};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StorageMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RailMode {
    Auto,
    Mock,
    Disabled,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SweepKind {
    Daily,
    Weekly,
    Expire,
}

impl From<SweepKind> for SweepPass {
    fn from(kind: SweepKind) -> Self {
        match kind {
            SweepKind::Daily => SweepPass::Daily,
            SweepKind::Weekly => SweepPass::Weekly,
            SweepKind::Expire => SweepPass::Expire,
        }
    }
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Run one scheduled pass over all active projects.
    Sweep {
        #[arg(value_enum)]
        pass: SweepKind,
    },
    /// Extract, score and recommend for one project event.
    ProcessEvent { event_id: String },
    /// Ask whether an automated caller may perform ACTION.
    CheckAction { action: String },
    /// Evaluate the permit submission gate for a project.
    PermitGate { project_id: String },
    /// Evaluate the review submission gate for a project.
    ReviewGate { project_id: String },
    /// Clear the payment claim a crashed transfer left on an APPROVED release.
    /// Confirm with the rail that nothing was sent first.
    ClearPaymentClaim {
        transaction_id: String,
        #[arg(long)]
        operator: String,
        #[arg(long)]
        reason: String,
    },
}

impl From<CliCommand> for Command {
    fn from(command: CliCommand) -> Self {
        match command {
            CliCommand::Sweep { pass } => Command::Sweep(pass.into()),
            CliCommand::ProcessEvent { event_id } => Command::ProcessEvent { event_id },
            CliCommand::CheckAction { action } => Command::CheckAction { action },
            CliCommand::PermitGate { project_id } => Command::PermitGate { project_id },
            CliCommand::ReviewGate { project_id } => Command::ReviewGate { project_id },
            CliCommand::ClearPaymentClaim {
                transaction_id,
                operator,
                reason,
            } => Command::ClearPaymentClaim {
                transaction_id,
                operator,
                reason,
            },
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "buildgated", version, about = "BuildGate operator CLI")]
struct Cli {
    /// Repository backend. `auto` picks postgres when a database url is configured.
    #[arg(long, value_enum, default_value_t = StorageMode::Auto, env = "BUILDGATE_STORAGE")]
    storage: StorageMode,
    /// PostgreSQL url of the owning store.
    #[arg(long, env = "BUILDGATE_DATABASE_URL")]
    database_url: Option<String>,
    /// Max PostgreSQL pool connections.
    #[arg(long, default_value_t = 5, env = "BUILDGATE_PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,
    /// Payment rail. `auto` uses the mock rail on memory storage only.
    #[arg(long, value_enum, default_value_t = RailMode::Auto, env = "BUILDGATE_PAYMENT_RAIL")]
    payment_rail: RailMode,
    /// Upper bound on one payment-rail transfer, in seconds.
    #[arg(long, default_value_t = 30, env = "BUILDGATE_PAYMENT_TIMEOUT_SECS")]
    payment_timeout_secs: u64,
    /// OpenAI-compatible endpoint for generative recommendations.
    #[arg(long, env = "BUILDGATE_GENERATION_ENDPOINT")]
    generation_endpoint: Option<String>,
    #[arg(long, default_value = "gpt-4o-mini", env = "BUILDGATE_GENERATION_MODEL")]
    generation_model: String,
    #[arg(long, env = "BUILDGATE_GENERATION_API_KEY", hide_env_values = true)]
    generation_api_key: Option<String>,
    /// JSON fixture seeding the memory backend.
    #[arg(long)]
    fixture: Option<PathBuf>,
    #[command(subcommand)]
    command: CliCommand,
}

fn resolve_storage(cli: &Cli) -> anyhow::Result<StorageConfig> {
    let resolved_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let storage = match cli.storage {
        StorageMode::Memory => StorageConfig::Memory,
        StorageMode::Postgres => {
            let database_url = resolved_url.ok_or_else(|| {
                anyhow::anyhow!("storage=postgres requires --database-url or DATABASE_URL")
            })?;
            StorageConfig::postgres(database_url, cli.pg_max_connections)
        }
        StorageMode::Auto => match resolved_url {
            Some(database_url) if cli.fixture.is_none() => {
                StorageConfig::postgres(database_url, cli.pg_max_connections)
            }
            _ => StorageConfig::Memory,
        },
    };

    Ok(storage)
}

fn resolve_payment_rail(cli: &Cli, storage: &StorageConfig) -> PaymentRailMode {
    match cli.payment_rail {
        RailMode::Auto => PaymentRailMode::default_for(storage),
        RailMode::Mock => PaymentRailMode::Mock,
        RailMode::Disabled => PaymentRailMode::Disabled,
    }
}

fn resolve_generation(cli: &Cli) -> Option<HttpGeneratorConfig> {
    cli.generation_endpoint
        .as_ref()
        .map(|endpoint| HttpGeneratorConfig {
            endpoint: endpoint.clone(),
            model: cli.generation_model.clone(),
            api_key: cli.generation_api_key.clone(),
            request_timeout: Duration::from_secs(20),
        })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "buildgate_service=info,buildgate_core=info,info".to_string()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let storage = resolve_storage(&cli)?;
    let config = ServiceConfig {
        payment_rail: resolve_payment_rail(&cli, &storage),
        storage,
        fixture: cli.fixture.clone(),
        payment_timeout: Duration::from_secs(cli.payment_timeout_secs),
        generation: resolve_generation(&cli),
    };
    info!(
        storage = config.storage.label(),
        payment_rail = config.payment_rail.label(),
        "starting buildgated"
    );

    let state = ServiceState::bootstrap(config).await?;
    let output = state.execute(cli.command.into()).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);

    if !output.is_success() {
        std::process::exit(2);
    }
    Ok(())
}
