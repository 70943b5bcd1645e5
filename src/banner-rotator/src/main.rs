//! Banner Rotator: chooses which banner to show in a slot for a social group
//! with a UCB1 multi-armed bandit over per-context click statistics.
//!
//! Entry point: loads configuration, initializes logging, opens the counter
//! store and runs one command.

mod simulate;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use rotator_core::config::{AppConfig, EngineConfig, LogFormat, StorageBackend};
use rotator_core::event_bus::{EventSink, TracingSink};
use rotator_core::types::{BannerId, SelectionOutcome, SlotId, SocialGroupId};
use rotator_core::{RotatorError, RotatorResult};
use rotator_decision::{AssignmentManager, DecisionEngine};
use rotator_store::{PostgresStore, StoreHandle};
use serde_json::json;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "banner-rotator")]
#[command(about = "Multi-armed bandit banner rotation")]
#[command(version)]
struct Cli {
    /// Path to a configuration file (TOML, JSON or YAML)
    #[arg(long, env = "ROTATOR_CONFIG")]
    config: Option<String>,

    /// Storage backend (overrides config)
    #[arg(long, value_enum)]
    backend: Option<BackendArg>,

    /// PostgreSQL connection string (overrides config)
    #[arg(long, env = "ROTATOR__STORAGE__DSN")]
    dsn: Option<String>,

    /// Counter written when a banner is chosen (overrides config)
    #[arg(long, value_enum)]
    selection_outcome: Option<OutcomeArg>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutcomeArg {
    Display,
    Click,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the PostgreSQL schema
    Migrate,
    /// Add a banner to the catalog
    CreateBanner {
        #[arg(long)]
        description: String,
    },
    /// Add a slot to the catalog
    CreateSlot {
        #[arg(long)]
        description: String,
    },
    /// Add a social group to the catalog
    CreateGroup {
        #[arg(long)]
        description: String,
    },
    /// Choose a banner for a slot and social group
    Choose {
        #[arg(long)]
        slot: i64,
        #[arg(long)]
        group: i64,
    },
    /// Count a click on a banner
    Click {
        #[arg(long)]
        banner: i64,
        #[arg(long)]
        slot: i64,
        #[arg(long)]
        group: i64,
    },
    /// Count a display of a banner
    Display {
        #[arg(long)]
        banner: i64,
        #[arg(long)]
        slot: i64,
        #[arg(long)]
        group: i64,
    },
    /// Make a banner eligible for a slot
    Assign {
        #[arg(long)]
        banner: i64,
        #[arg(long)]
        slot: i64,
    },
    /// Withdraw a banner from a slot
    Unassign {
        #[arg(long)]
        banner: i64,
        #[arg(long)]
        slot: i64,
    },
    /// Run an in-memory rotation against synthetic click-through rates
    Simulate(simulate::SimulateArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let (mut config, config_warning) = match AppConfig::load(cli.config.as_deref()) {
        Ok(config) => (config, None),
        Err(e) if cli.config.is_none() => (AppConfig::default(), Some(e.to_string())),
        Err(e) => {
            eprintln!("failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(&config);
    if let Some(e) = config_warning {
        warn!(error = %e, "Failed to load config, using defaults");
    }

    // Apply CLI overrides
    if let Some(backend) = cli.backend {
        config.storage.backend = match backend {
            BackendArg::Memory => StorageBackend::Memory,
            BackendArg::Postgres => StorageBackend::Postgres,
        };
    }
    if let Some(dsn) = cli.dsn.clone() {
        config.storage.dsn = dsn;
    }
    if let Some(outcome) = cli.selection_outcome {
        config.engine.selection_outcome = match outcome {
            OutcomeArg::Display => SelectionOutcome::Display,
            OutcomeArg::Click => SelectionOutcome::Click,
        };
    }

    info!(
        backend = ?config.storage.backend,
        selection_outcome = ?config.engine.selection_outcome,
        operation_timeout_ms = config.engine.operation_timeout_ms,
        "Configuration loaded"
    );

    match run(cli.command, config).await {
        Ok(output) => {
            println!("{output}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            let kind = e
                .downcast_ref::<RotatorError>()
                .map(|r| serde_json::to_value(r.kind()).unwrap_or_default());
            error!(error = %e, "Command failed");
            println!("{}", json!({ "error": kind, "message": format!("{e:#}") }));
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(config: &AppConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match config.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn run(command: Command, config: AppConfig) -> anyhow::Result<serde_json::Value> {
    match command {
        Command::Simulate(args) => simulate::run(args, &config.engine).await,
        Command::Migrate => {
            require_persistent(&config)?;
            PostgresStore::connect(&config.storage).await?.migrate().await?;
            Ok(json!({ "migrated": true }))
        }
        other => {
            require_persistent(&config)?;
            let stores = rotator_store::open(&config.storage)
                .await
                .context("opening counter store")?;
            run_store_command(other, &stores, &config.engine).await
        }
    }
}

/// Each invocation is a fresh process, so a memory backend would always be empty.
fn require_persistent(config: &AppConfig) -> RotatorResult<()> {
    if config.storage.backend == StorageBackend::Memory {
        return Err(RotatorError::Config(
            "store commands need the postgres backend; the memory backend does not outlive \
             the process (use `simulate` for an in-memory run)"
                .to_string(),
        ));
    }
    Ok(())
}

async fn run_store_command(
    command: Command,
    stores: &StoreHandle,
    engine_config: &EngineConfig,
) -> anyhow::Result<serde_json::Value> {
    let events: Arc<dyn EventSink> = Arc::new(TracingSink);
    let engine = DecisionEngine::new(
        stores.counters.clone(),
        events.clone(),
        engine_config.clone(),
    );
    let manager = AssignmentManager::new(stores.counters.clone(), events, engine_config);

    let output = match command {
        Command::CreateBanner { description } => {
            let banner = stores.catalog.create_banner(&description).await?;
            json!({ "banner": banner })
        }
        Command::CreateSlot { description } => {
            let slot = stores.catalog.create_slot(&description).await?;
            json!({ "slot": slot })
        }
        Command::CreateGroup { description } => {
            let group = stores.catalog.create_social_group(&description).await?;
            json!({ "social_group": group })
        }
        Command::Choose { slot, group } => {
            let (slot, group) = (SlotId(slot), SocialGroupId(group));
            group.validate()?;
            if stores.catalog.social_group(group).await?.is_none() {
                return Err(RotatorError::NotFound(format!("social group {group}")).into());
            }
            let selection = engine.choose(slot, group).await?;
            json!({ "banner_id": selection.banner, "strategy": selection.strategy })
        }
        Command::Click {
            banner,
            slot,
            group,
        } => {
            engine
                .record_click(BannerId(banner), SlotId(slot), SocialGroupId(group))
                .await?;
            json!({ "recorded": "click" })
        }
        Command::Display {
            banner,
            slot,
            group,
        } => {
            engine
                .record_display(BannerId(banner), SlotId(slot), SocialGroupId(group))
                .await?;
            json!({ "recorded": "display" })
        }
        Command::Assign { banner, slot } => {
            let (banner, slot) = (BannerId(banner), SlotId(slot));
            banner.validate()?;
            slot.validate()?;
            let Some(banner_row) = stores.catalog.banner(banner).await? else {
                return Err(RotatorError::NotFound(format!("banner {banner}")).into());
            };
            let Some(slot_row) = stores.catalog.slot(slot).await? else {
                return Err(RotatorError::NotFound(format!("slot {slot}")).into());
            };
            let arms = manager.add_assignment(banner, slot).await?;
            json!({
                "assigned": true,
                "banner": banner_row.description,
                "slot": slot_row.description,
                "arms_created": arms,
            })
        }
        Command::Unassign { banner, slot } => {
            let arms = manager
                .remove_assignment(BannerId(banner), SlotId(slot))
                .await?;
            json!({ "unassigned": true, "arms_removed": arms })
        }
        Command::Migrate | Command::Simulate(_) => {
            anyhow::bail!("command does not operate on the counter store")
        }
    };

    Ok(output)
}
