//! These structs provide the CLI interface for the fintrack CLI.

use crate::model::{
    Amount, EntityRef, ListParams, ReferenceKind, TransactionDraft, TransactionPatch,
    TransactionType,
};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::convert::Infallible;
use std::fmt::{Display, Formatter};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::error;
use tracing_subscriber::filter::LevelFilter;

/// fintrack: record income and expenses whether or not the server can be reached.
///
/// Every write goes to the fintrack API when it is reachable. When it is not, the write is saved
/// in a local queue and delivered, in order, the next time `fintrack sync` or `fintrack watch`
/// finds the API online. Listings are served from a local cache while offline.
#[derive(Debug, Parser, Clone)]
pub struct Args {
    #[clap(flatten)]
    common: Common,

    #[command(subcommand)]
    command: Command,
}

impl Args {
    pub fn new(common: Common, command: Command) -> Self {
        Self { common, command }
    }

    pub fn common(&self) -> &Common {
        &self.common
    }

    pub fn command(&self) -> &Command {
        &self.command
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Create the data directory and initialize the configuration file.
    ///
    /// Run this first. The directory defaults to $HOME/fintrack; pass --fintrack-home to put it
    /// somewhere else. If the API needs a token, write it to `.secrets/api_token` inside the
    /// data directory afterwards.
    Init(InitArgs),
    /// Show whether the API is reachable and how many writes are waiting to be synced.
    Status,
    /// Deliver queued writes now.
    Sync,
    /// Keep checking the connection and sync whenever the API comes back. Stop with Ctrl-C.
    Watch(WatchArgs),
    /// Inspect and manage queued writes.
    Queue(QueueArgs),
    /// Create a transaction or a category, source or target.
    Insert(InsertArgs),
    /// Change a transaction or rename a category, source or target.
    Update(UpdateArgs),
    /// Delete a transaction or a category, source or target.
    Delete(DeleteArgs),
    /// List transactions, categories, sources or targets.
    List(ListArgs),
    /// Import transactions from a CSV file.
    ///
    /// The file needs a header row. Required columns: amount, type, date. Optional columns:
    /// description, category, source, target, recurrence.
    Import(ImportArgs),
    /// Switch to a newly installed version of the application shell.
    ///
    /// Applying purges the cached UI assets (never the cached API data) and hands over to the new
    /// version. Deferring hides the upgrade for `sync.snooze_minutes`.
    Upgrade(UpgradeArgs),
}

/// Arguments common to all subcommands.
#[derive(Debug, Parser, Clone)]
pub struct Common {
    /// The logging verbosity. One of, from least to most verbose:
    /// off, error, warn, info, debug, trace
    ///
    /// This can be overridden by RUST_LOG.
    #[arg(long, default_value_t = LevelFilter::INFO)]
    log_level: LevelFilter,

    /// The directory where fintrack data and configuration is held. Defaults to ~/fintrack
    #[arg(long, env = "FINTRACK_HOME", default_value_t = default_fintrack_home())]
    fintrack_home: DisplayPath,
}

impl Common {
    pub fn new(log_level: LevelFilter, fintrack_home: PathBuf) -> Self {
        Self {
            log_level,
            fintrack_home: fintrack_home.into(),
        }
    }

    pub fn log_level(&self) -> LevelFilter {
        self.log_level
    }

    pub fn fintrack_home(&self) -> &DisplayPath {
        &self.fintrack_home
    }
}

/// (Not shown): Args for the `fintrack init` command.
#[derive(Debug, Parser, Clone)]
pub struct InitArgs {
    /// The base URL of the fintrack API, e.g. https://fintrack.example.com/api/
    #[arg(long)]
    api_url: String,
}

impl InitArgs {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }
}

/// (Not shown): Args for the `fintrack watch` command.
#[derive(Debug, Parser, Clone)]
pub struct WatchArgs {
    /// Milliseconds between connection checks. Defaults to `sync.probe_interval_ms` from the
    /// config file.
    #[arg(long)]
    interval_ms: Option<u64>,
}

impl WatchArgs {
    pub fn new(interval_ms: Option<u64>) -> Self {
        Self { interval_ms }
    }

    pub fn interval_ms(&self) -> Option<u64> {
        self.interval_ms
    }
}

/// (Not shown): Args for the `fintrack queue` command.
#[derive(Debug, Parser, Clone)]
pub struct QueueArgs {
    #[command(subcommand)]
    action: QueueSubcommand,
}

impl QueueArgs {
    pub fn action(&self) -> &QueueSubcommand {
        &self.action
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum QueueSubcommand {
    /// List queued writes, failed ones included.
    List,
    /// Put a failed write back in line.
    Retry(OperationArgs),
    /// Drop a failed write. Dropping a failed create also drops later writes to the same entity.
    /// It is refused while other queued writes still refer to that entity.
    Discard(OperationArgs),
}

/// (Not shown): Args for the `fintrack upgrade` command.
#[derive(Debug, Parser, Clone)]
pub struct UpgradeArgs {
    #[command(subcommand)]
    action: UpgradeSubcommand,
}

impl UpgradeArgs {
    pub fn new(action: UpgradeSubcommand) -> Self {
        Self { action }
    }

    pub fn action(&self) -> &UpgradeSubcommand {
        &self.action
    }
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeSubcommand {
    /// Show the cached UI assets and whether upgrades are postponed.
    Status,
    /// Upgrade now.
    Apply,
    /// Not now: postpone the upgrade.
    Defer,
}

/// (Not shown): Selects one queue entry.
#[derive(Debug, Parser, Clone)]
pub struct OperationArgs {
    /// The id shown by `fintrack queue list`.
    id: i64,
}

impl OperationArgs {
    pub fn new(id: i64) -> Self {
        Self { id }
    }

    pub fn id(&self) -> i64 {
        self.id
    }
}

/// (Not shown): Args for the `fintrack insert` command.
#[derive(Debug, Parser, Clone)]
pub struct InsertArgs {
    #[command(subcommand)]
    entity: InsertSubcommand,
}

impl InsertArgs {
    pub fn entity(&self) -> &InsertSubcommand {
        &self.entity
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum InsertSubcommand {
    /// Create a transaction.
    Transaction(Box<InsertTransactionArgs>),
    /// Create a category, source or target unless one with the same name exists.
    Reference(InsertReferenceArgs),
}

/// (Not shown): Args for `fintrack insert transaction`.
#[derive(Debug, Parser, Clone)]
pub struct InsertTransactionArgs {
    /// The amount, always positive. "$1,250.00" is accepted.
    #[arg(long)]
    pub amount: Amount,

    /// income or expense
    #[arg(long = "type")]
    pub kind: TransactionType,

    /// The date in YYYY-MM-DD format.
    #[arg(long)]
    pub date: NaiveDate,

    #[arg(long)]
    pub description: Option<String>,

    /// The id of a category. A temporary id (tmp-...) of a queued category works too.
    #[arg(long)]
    pub category: Option<EntityRef>,

    /// The id of a source (where income comes from).
    #[arg(long)]
    pub source: Option<EntityRef>,

    /// The id of a target (where an expense goes).
    #[arg(long)]
    pub target: Option<EntityRef>,

    /// The id of the recurring rule this transaction belongs to.
    #[arg(long)]
    pub recurrence: Option<i64>,
}

impl InsertTransactionArgs {
    pub fn draft(&self) -> TransactionDraft {
        TransactionDraft {
            amount: self.amount,
            kind: self.kind,
            date: self.date,
            description: self.description.clone().unwrap_or_default(),
            category: self.category.clone(),
            source: self.source.clone(),
            target: self.target.clone(),
            recurrence: self.recurrence,
        }
    }
}

/// (Not shown): Args for `fintrack insert reference`.
#[derive(Debug, Parser, Clone)]
pub struct InsertReferenceArgs {
    /// category, source or target
    kind: ReferenceKind,

    name: String,
}

impl InsertReferenceArgs {
    pub fn new(kind: ReferenceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    pub fn kind(&self) -> ReferenceKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// (Not shown): Args for the `fintrack update` command.
#[derive(Debug, Parser, Clone)]
pub struct UpdateArgs {
    #[command(subcommand)]
    entity: UpdateSubcommand,
}

impl UpdateArgs {
    pub fn entity(&self) -> &UpdateSubcommand {
        &self.entity
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum UpdateSubcommand {
    /// Change the fields given; everything else stays as it is.
    Transaction(Box<UpdateTransactionArgs>),
    /// Rename a category, source or target.
    Reference(RenameReferenceArgs),
}

/// (Not shown): Args for `fintrack update transaction`.
#[derive(Debug, Parser, Clone)]
pub struct UpdateTransactionArgs {
    /// The id of the transaction, confirmed or temporary.
    pub id: EntityRef,

    #[arg(long)]
    pub amount: Option<Amount>,

    #[arg(long = "type")]
    pub kind: Option<TransactionType>,

    #[arg(long)]
    pub date: Option<NaiveDate>,

    #[arg(long)]
    pub description: Option<String>,

    #[arg(long)]
    pub category: Option<EntityRef>,

    #[arg(long)]
    pub source: Option<EntityRef>,

    #[arg(long)]
    pub target: Option<EntityRef>,

    /// Unset a reference: category, source or target. Can be repeated.
    #[arg(long)]
    pub clear: Vec<ReferenceKind>,
}

impl UpdateTransactionArgs {
    pub fn patch(&self) -> TransactionPatch {
        let mut patch = TransactionPatch {
            amount: self.amount,
            kind: self.kind,
            date: self.date,
            description: self.description.clone(),
            category: self.category.clone().map(Some),
            source: self.source.clone().map(Some),
            target: self.target.clone().map(Some),
            recurrence: None,
        };
        for kind in &self.clear {
            match kind {
                ReferenceKind::Category => patch.category = Some(None),
                ReferenceKind::Source => patch.source = Some(None),
                ReferenceKind::Target => patch.target = Some(None),
            }
        }
        patch
    }
}

/// (Not shown): Args for `fintrack update reference`.
#[derive(Debug, Parser, Clone)]
pub struct RenameReferenceArgs {
    kind: ReferenceKind,

    id: EntityRef,

    /// The new name.
    name: String,
}

impl RenameReferenceArgs {
    pub fn new(kind: ReferenceKind, id: EntityRef, name: impl Into<String>) -> Self {
        Self {
            kind,
            id,
            name: name.into(),
        }
    }

    pub fn kind(&self) -> ReferenceKind {
        self.kind
    }

    pub fn id(&self) -> &EntityRef {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// (Not shown): Args for the `fintrack delete` command.
#[derive(Debug, Parser, Clone)]
pub struct DeleteArgs {
    #[command(subcommand)]
    entity: DeleteSubcommand,
}

impl DeleteArgs {
    pub fn entity(&self) -> &DeleteSubcommand {
        &self.entity
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum DeleteSubcommand {
    Transaction(DeleteTransactionArgs),
    Reference(DeleteReferenceArgs),
}

/// (Not shown): Args for `fintrack delete transaction`.
#[derive(Debug, Parser, Clone)]
pub struct DeleteTransactionArgs {
    id: EntityRef,
}

impl DeleteTransactionArgs {
    pub fn new(id: EntityRef) -> Self {
        Self { id }
    }

    pub fn id(&self) -> &EntityRef {
        &self.id
    }
}

/// (Not shown): Args for `fintrack delete reference`.
#[derive(Debug, Parser, Clone)]
pub struct DeleteReferenceArgs {
    kind: ReferenceKind,

    id: EntityRef,
}

impl DeleteReferenceArgs {
    pub fn new(kind: ReferenceKind, id: EntityRef) -> Self {
        Self { kind, id }
    }

    pub fn kind(&self) -> ReferenceKind {
        self.kind
    }

    pub fn id(&self) -> &EntityRef {
        &self.id
    }
}

/// (Not shown): Args for the `fintrack list` command.
#[derive(Debug, Parser, Clone)]
pub struct ListArgs {
    #[command(subcommand)]
    entity: ListSubcommand,
}

impl ListArgs {
    pub fn entity(&self) -> &ListSubcommand {
        &self.entity
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum ListSubcommand {
    /// List one page of transactions, newest first.
    Transactions(ListTransactionsArgs),
    Categories,
    Sources,
    Targets,
}

/// (Not shown): Args for `fintrack list transactions`.
#[derive(Debug, Parser, Clone)]
pub struct ListTransactionsArgs {
    #[arg(long, default_value_t = 25)]
    limit: u32,

    #[arg(long, default_value_t = 0)]
    offset: u32,

    /// Only transactions whose description contains this text.
    #[arg(long, default_value = "")]
    search: String,

    /// Only income or only expense.
    #[arg(long = "type")]
    kind: Option<TransactionType>,
}

impl ListTransactionsArgs {
    pub fn params(&self) -> ListParams {
        ListParams {
            limit: self.limit,
            offset: self.offset,
            search: self.search.clone(),
            kind: self.kind,
        }
    }
}

/// (Not shown): Args for the `fintrack import` command.
#[derive(Debug, Parser, Clone)]
pub struct ImportArgs {
    /// The CSV file to import.
    path: PathBuf,
}

impl ImportArgs {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn default_fintrack_home() -> DisplayPath {
    DisplayPath(match dirs::home_dir() {
        Some(home) => home.join("fintrack"),
        None => {
            error!(
                "There was an error when trying to get your home directory. You can get around \
                this by providing --fintrack-home or FINTRACK_HOME instead of relying on the \
                default fintrack home directory. If you continue using the program right now, you \
                may have problems!",
            );
            PathBuf::from("fintrack")
        }
    })
}

#[derive(Debug, Default, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DisplayPath(PathBuf);

impl From<PathBuf> for DisplayPath {
    fn from(value: PathBuf) -> Self {
        DisplayPath(value)
    }
}

impl Deref for DisplayPath {
    type Target = Path;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<Path> for DisplayPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl Display for DisplayPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_string_lossy())
    }
}

impl FromStr for DisplayPath {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(PathBuf::from(s)))
    }
}

impl DisplayPath {
    pub fn path(&self) -> &Path {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_transaction_args() {
        let args = Args::try_parse_from([
            "fintrack",
            "--fintrack-home",
            "/tmp/ft",
            "insert",
            "transaction",
            "--amount",
            "$1,250.00",
            "--type",
            "expense",
            "--date",
            "2025-03-14",
            "--category",
            "tmp-abc",
        ])
        .unwrap();
        assert_eq!(args.common().fintrack_home().path(), Path::new("/tmp/ft"));
        let Command::Insert(insert) = args.command() else {
            panic!("expected insert");
        };
        let InsertSubcommand::Transaction(t) = insert.entity() else {
            panic!("expected transaction");
        };
        let draft = t.draft();
        assert_eq!(draft.amount.to_string(), "1250.00");
        assert_eq!(draft.kind, TransactionType::Expense);
        assert!(draft.category.as_ref().is_some_and(EntityRef::is_temp));
    }

    #[test]
    fn test_update_clear_reference() {
        let args = Args::try_parse_from([
            "fintrack",
            "update",
            "transaction",
            "917",
            "--description",
            "Groceries",
            "--clear",
            "category",
        ])
        .unwrap();
        let Command::Update(update) = args.command() else {
            panic!("expected update");
        };
        let UpdateSubcommand::Transaction(t) = update.entity() else {
            panic!("expected transaction");
        };
        assert_eq!(t.id, EntityRef::Confirmed(917));
        let patch = t.patch();
        assert_eq!(patch.description.as_deref(), Some("Groceries"));
        assert_eq!(patch.category, Some(None));
        assert_eq!(patch.source, None);
    }

    #[test]
    fn test_list_transactions_defaults() {
        let args = Args::try_parse_from(["fintrack", "list", "transactions"]).unwrap();
        let Command::List(list) = args.command() else {
            panic!("expected list");
        };
        let ListSubcommand::Transactions(t) = list.entity() else {
            panic!("expected transactions");
        };
        assert_eq!(t.params(), ListParams::default());
    }

    #[test]
    fn test_upgrade_subcommands() {
        for (word, expected) in [
            ("status", UpgradeSubcommand::Status),
            ("apply", UpgradeSubcommand::Apply),
            ("defer", UpgradeSubcommand::Defer),
        ] {
            let args = Args::try_parse_from(["fintrack", "upgrade", word]).unwrap();
            let Command::Upgrade(upgrade) = args.command() else {
                panic!("expected upgrade");
            };
            assert_eq!(*upgrade.action(), expected);
        }
        assert!(Args::try_parse_from(["fintrack", "upgrade"]).is_err());
    }
}
