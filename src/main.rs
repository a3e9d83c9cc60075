//! move-users: persist a user in one database, then move every user to a
//! second database in a single coordinated transaction.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, trace};

use xa_unit_of_work::logging::init_tracing;
use xa_unit_of_work::users::create_schema;
use xa_unit_of_work::{
    create_user, list_users, move_users, Config, ResourceRegistry, TransactionError,
    TransactionManager, TransactionResult,
};

/// Move users between two SQLite databases atomically.
#[derive(Parser, Debug)]
#[command(name = "move-users")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file with exactly two resources.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for the two demo databases, used when no configuration file is given.
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let config = match &args.config {
        Some(path) => match Config::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "Invalid configuration");
                return ExitCode::FAILURE;
            }
        },
        None => Config::demo(&args.data_dir),
    };

    let registry = ResourceRegistry::default();
    let manager = TransactionManager::new();

    let result = run(&registry, &manager, config).await;

    trace!("Closing transaction manager");
    manager.shutdown();
    trace!("Shutting down resources");
    registry.decommission_all().await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Run failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(
    registry: &ResourceRegistry,
    manager: &TransactionManager,
    config: Config,
) -> TransactionResult<()> {
    if config.resources.len() != 2 {
        return Err(TransactionError::InvalidConfig(format!(
            "expected exactly two resources, found {}",
            config.resources.len()
        )));
    }

    trace!("Provisioning resources");
    let pools = registry.provision_all(config.resources).await?;
    let (source, target) = (pools[0].clone(), pools[1].clone());
    create_schema(&source).await?;
    create_schema(&target).await?;

    let ctx = manager.context();

    info!(resource = %source.name(), "Persisting one new user");
    let pool = source.clone();
    ctx.run("create user", |tx| async move {
        create_user(&tx, &pool, "Test User").await.map(|_| ())
    })
    .await?;

    info!(from = %source.name(), to = %target.name(), "Moving users");
    let (from, to) = (source.clone(), target.clone());
    let moved = ctx
        .run("move users", |tx| async move { move_users(&tx, &from, &to).await })
        .await?;
    info!(count = moved.len(), "Moved users; none would have moved on failure");

    info!(resource = %target.name(), "Listing users");
    let pool = target.clone();
    ctx.run("list users", |tx| async move {
        list_users(&tx, &pool).await.map(|_| ())
    })
    .await
}
