use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dupc_core::{Alias, AliasKind};
use dupc_storage::PgSettingsStore;
use dupc_sync::{open_settings_store, ServiceConfig};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "dupc")]
#[command(about = "Duplicate Combinator: consolidate duplicate board items")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one consolidation pass and print the summary as JSON.
    Run,
    /// Serve the admin console (and the scheduler when enabled).
    Serve,
    /// Create the settings and alias tables in DATABASE_URL.
    Migrate,
    #[command(subcommand)]
    Alias(AliasCommand),
}

#[derive(Debug, Subcommand)]
enum AliasCommand {
    Set {
        #[arg(long)]
        kind: AliasKind,
        #[arg(long)]
        raw_id: String,
        #[arg(long)]
        display: String,
    },
    List {
        #[arg(long)]
        kind: AliasKind,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = dupc_sync::run_once_from_env().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Serve => dupc_web::serve_from_env().await?,
        Commands::Migrate => {
            let url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set to migrate")?;
            PgSettingsStore::connect(&url).await?.init_schema().await?;
            println!("schema ready");
        }
        Commands::Alias(AliasCommand::Set { kind, raw_id, display }) => {
            let store = open_settings_store(&ServiceConfig::from_env()).await?;
            store
                .upsert_alias(&Alias {
                    kind,
                    raw_id,
                    display,
                    extra: serde_json::Value::Object(Default::default()),
                })
                .await?;
        }
        Commands::Alias(AliasCommand::List { kind }) => {
            let store = open_settings_store(&ServiceConfig::from_env()).await?;
            for alias in store.list_aliases(kind).await? {
                println!("{}\t{}\t{}", alias.kind.as_str(), alias.raw_id, alias.display);
            }
        }
    }

    Ok(())
}
