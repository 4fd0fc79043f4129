use clap::Parser;
use fintrack_sync::args::{
    Args, Command, DeleteSubcommand, InsertSubcommand, ListSubcommand, QueueSubcommand,
    UpdateSubcommand, UpgradeSubcommand,
};
use fintrack_sync::facade::DataAccess;
use fintrack_sync::model::ReferenceKind;
use fintrack_sync::{commands, Config, Mode, Result};
use std::time::Duration;
use tracing::{debug, error, trace};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let args = Args::parse();
    let log_level = args.common().log_level();
    init_logger(log_level);
    debug!("Log level set to {}", log_level.to_string().to_lowercase());

    match main_inner(args).await {
        Ok(_) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!("Exiting with error: {e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

pub async fn main_inner(args: Args) -> Result<()> {
    trace!("{args:?}");
    let home = args.common().fintrack_home().path();

    // When FINTRACK_IN_TEST_MODE is set and non-empty, the mode will be Mode::Test and nothing
    // leaves the machine. Otherwise it will be Mode::Http.
    let mode = Mode::from_env();

    if let Command::Init(init_args) = args.command() {
        commands::init(home, init_args.api_url()).await?.print();
        return Ok(());
    }

    let config = Config::load(home).await?;
    if let Command::Upgrade(upgrade_args) = args.command() {
        let out = match upgrade_args.action() {
            UpgradeSubcommand::Status => commands::upgrade_status(&config).await?,
            UpgradeSubcommand::Apply => commands::upgrade_apply(&config).await?,
            UpgradeSubcommand::Defer => commands::upgrade_defer(&config).await?,
        };
        out.print();
        return Ok(());
    }

    let access = commands::open(&config, mode).await?;
    let result = run(&config, &access, args.command()).await;
    // Store the cache even when the command failed; earlier reads may have refreshed it.
    commands::close(&access).await?;
    result
}

async fn run(config: &Config, access: &DataAccess, command: &Command) -> Result<()> {
    let _: () = match command {
        Command::Init(_) | Command::Upgrade(_) => {}

        Command::Status => commands::status(access).await?.print(),

        Command::Sync => commands::sync(access).await?.print(),

        Command::Watch(watch_args) => {
            let interval = watch_args
                .interval_ms()
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.sync().probe_interval());
            commands::watch(access, interval).await?.print()
        }

        Command::Queue(queue_args) => match queue_args.action() {
            QueueSubcommand::List => commands::queue_list(access).await?.print(),
            QueueSubcommand::Retry(op) => commands::queue_retry(access, op.id()).await?.print(),
            QueueSubcommand::Discard(op) => {
                commands::queue_discard(access, op.id()).await?.print()
            }
        },

        Command::Insert(insert_args) => match insert_args.entity() {
            InsertSubcommand::Transaction(args) => {
                commands::insert_transaction(access, args.draft())
                    .await?
                    .print()
            }
            InsertSubcommand::Reference(args) => {
                commands::insert_reference(access, args.kind(), args.name())
                    .await?
                    .print()
            }
        },

        Command::Update(update_args) => match update_args.entity() {
            UpdateSubcommand::Transaction(args) => {
                commands::update_transaction(access, args.id.clone(), args.patch())
                    .await?
                    .print()
            }
            UpdateSubcommand::Reference(args) => {
                commands::rename_reference(access, args.kind(), args.id().clone(), args.name())
                    .await?
                    .print()
            }
        },

        Command::Delete(delete_args) => match delete_args.entity() {
            DeleteSubcommand::Transaction(args) => {
                commands::delete_transaction(access, args.id().clone())
                    .await?
                    .print()
            }
            DeleteSubcommand::Reference(args) => {
                commands::delete_reference(access, args.kind(), args.id().clone())
                    .await?
                    .print()
            }
        },

        Command::List(list_args) => match list_args.entity() {
            ListSubcommand::Transactions(args) => {
                commands::list_transactions(access, args.params())
                    .await?
                    .print()
            }
            ListSubcommand::Categories => {
                commands::list_references(access, ReferenceKind::Category)
                    .await?
                    .print()
            }
            ListSubcommand::Sources => commands::list_references(access, ReferenceKind::Source)
                .await?
                .print(),
            ListSubcommand::Targets => commands::list_references(access, ReferenceKind::Target)
                .await?
                .print(),
        },

        Command::Import(import_args) => commands::import_csv(access, import_args.path())
            .await?
            .print(),
    };
    Ok(())
}

/// Initializes the tracing subscriber.
pub fn init_logger(level: LevelFilter) {
    let filter = match std::env::var("RUST_LOG").ok() {
        Some(_) => {
            // RUST_LOG exists; use it.
            EnvFilter::from_default_env()
        }
        None => {
            // RUST_LOG does not exist; use default log level for this crate only.
            EnvFilter::new(format!(
                "{}={},{}={}",
                "fintrack_sync",
                level,
                env!("CARGO_BIN_NAME"),
                level
            ))
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
