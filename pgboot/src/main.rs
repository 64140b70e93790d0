//! Command-line interface for pgboot.
//!
//! Every subcommand except `create` reads the configuration file given with
//! `--config`.

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use pgboot::client::{new_client, new_client_with_driver, ping_store, Environment, Readiness};
use pgboot::config::{self, Config, LoggingConfig};
use pgboot::utils::{logging, naming, wait_for_ping};
use pgboot::{MigrationGroup, RawHandle, RollbackTarget, Store};

#[derive(Parser)]
#[command(name = "pgboot", version, about = "PostgreSQL bring-up and migrations")]
struct Cli {
    /// Configuration file (TOML, or YAML with a .yaml/.yml extension)
    #[arg(short, long, global = true, default_value = "pgboot.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wait until the database accepts connections
    Ping,
    /// Connect, optionally reset the test schema, and apply pending migrations
    Migrate,
    /// Roll back applied migrations (the most recent one by default)
    Rollback {
        /// Number of migrations to roll back
        #[arg(long, conflicts_with_all = ["group", "to"])]
        steps: Option<usize>,
        /// Roll back every migration applied by the last `migrate`
        #[arg(long, conflicts_with = "to")]
        group: bool,
        /// Roll back every migration above this version
        #[arg(long)]
        to: Option<i64>,
    },
    /// Show applied and pending migrations
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Create an empty up/down migration pair
    Create {
        /// Description, turned into the file name
        name: String,
        /// Target directory, defaults to the first configured directory
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Run the migration outside a transaction
        #[arg(long)]
        notx: bool,
    },
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let config = config::load_from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let logging_config = config.logging.clone().or_else(|| Some(LoggingConfig::default()));
    logging::init_logging(&logging_config)?;
    Ok(config)
}

fn print_group(action: &str, group: Option<&MigrationGroup>) {
    match group {
        Some(group) if !group.is_empty() => {
            for record in group.iter() {
                println!("{} {:>16}  {}", action, record.version, record.name);
            }
        }
        _ => println!("Nothing to do"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Ping => {
            let config = load_config(&cli)?;
            let (store, raw) = new_client_with_driver(&config.database).await?;
            let readiness = Readiness::from(config.readiness);
            let result = wait_for_ping(ping_store(&store), readiness.timeout, readiness.interval).await;
            store.close().await;
            raw.release().await;
            result.context("database is unreachable")?;
            println!("Database is reachable");
        }
        Commands::Migrate => {
            let config = load_config(&cli)?;
            let mut client_config = config.client_config(Environment::from_env());
            if client_config.migrations.is_none() {
                tracing::warn!("No migration directories configured");
            }

            let (store, raw) = new_client(&mut client_config).await?;
            print_group(
                "applied",
                client_config.migrations.as_ref().and_then(|set| set.report()),
            );
            store.close().await;
            raw.release().await;
        }
        Commands::Rollback { steps, group, to } => {
            let config = load_config(&cli)?;
            let Some(mut set) = config.migration_set() else {
                bail!("no migration directories configured");
            };
            let target = match (steps, group, to) {
                (_, true, _) => RollbackTarget::LastGroup,
                (_, _, Some(version)) => RollbackTarget::ToVersion(*version),
                (Some(steps), _, _) => RollbackTarget::Steps(*steps),
                _ => RollbackTarget::default(),
            };

            let readiness = Readiness::from(config.readiness);
            let (store, raw) = new_client_with_driver(&config.database).await?;
            let result = async {
                wait_for_ping(ping_store(&store), readiness.timeout, readiness.interval).await?;
                set.rollback(&store, target).await
            }
            .await;
            print_group("reverted", set.report());
            store.close().await;
            raw.release().await;
            result?;
        }
        Commands::Status { json } => {
            let config = load_config(&cli)?;
            let set = config.migration_set().unwrap_or_default();
            let (store, raw) = new_client_with_driver(&config.database).await?;
            let status = set.status(&store).await;
            store.close().await;
            raw.release().await;
            let status = status?;

            if *json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                for record in &status.applied {
                    println!(
                        "applied {:>16}  {}  (group {}, {})",
                        record.version,
                        record.name,
                        record.group_id,
                        record.applied_at.to_rfc3339()
                    );
                }
                for pending in &status.pending {
                    println!("pending {:>16}  {}  ({})", pending.version, pending.name, pending.source);
                }
            }
        }
        Commands::Create { name, dir, notx } => {
            let dir = match dir {
                Some(dir) => dir.clone(),
                None => config::load_from_file(&cli.config)
                    .ok()
                    .and_then(|config| config.migrations.directories.first().cloned())
                    .unwrap_or_else(|| PathBuf::from("migrations")),
            };
            fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

            let version = naming::timestamp_version(chrono::Utc::now());
            let (up, down) = naming::migration_file_names(version, name, !notx);
            for file in [&up, &down] {
                let path = dir.join(file);
                if path.exists() {
                    bail!("{} already exists", path.display());
                }
                fs::write(&path, "")?;
                println!("created {}", path.display());
            }
        }
    }

    Ok(())
}
