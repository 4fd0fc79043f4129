//! Command handlers for the fintrack CLI.
//!
//! Except for `init` and `upgrade`, every handler runs against an open [`DataAccess`]. The caller
//! opens it with [`open`] and hands it back to [`close`] so that background refreshes finish and
//! the cache is stored for the next run.

mod delete;
mod import;
mod init;
mod insert;
mod list;
mod queue;
mod status;
mod sync;
mod update;
mod upgrade;

use crate::facade::{DataAccess, WriteOutcome};
use crate::{Config, Mode, Result};
use serde::Serialize;
use std::fmt::Debug;
use tracing::{debug, info};

pub use delete::{delete_reference, delete_transaction};
pub use import::{import_csv, read_csv};
pub use init::init;
pub use insert::{insert_reference, insert_transaction};
pub use list::{list_references, list_transactions};
pub use queue::{queue_discard, queue_list, queue_retry};
pub use status::status;
pub use sync::{sync, watch};
pub use update::{rename_reference, update_transaction};
pub use upgrade::{upgrade_apply, upgrade_defer, upgrade_status, UpgradeReport};

/// The output type for a command. This allows the command to return a consistent message and,
/// optionally, structured data.
#[derive(Debug, Clone, Serialize)]
pub struct Out<T>
where
    T: Serialize + Clone + Debug,
{
    /// A message that can be printed to the user regarding the outcome of the command execution.
    message: String,

    /// Any structured data that needs to be output from the call.
    structure: Option<T>,
}

impl<T, S> From<S> for Out<T>
where
    T: Debug + Clone + Serialize,
    S: Into<String>,
{
    fn from(value: S) -> Self {
        Out::new_message(value)
    }
}

impl<T> Out<T>
where
    T: Serialize + Clone + Debug,
{
    /// Create a new `Out` object that has `Some(structure)`.
    pub fn new<S>(message: S, structure: T) -> Self
    where
        S: Into<String>,
    {
        Self {
            message: message.into(),
            structure: Some(structure),
        }
    }

    /// Create a new `Out` object that has `None` for `structure`.
    pub fn new_message<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            message: message.into(),
            structure: None,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn structure(&self) -> Option<&T> {
        self.structure.as_ref()
    }

    /// Print the message to `info!` and the structured data (if it exists) as JSON to `debug!`.
    pub fn print(&self) {
        info!("{}", self.message);
        if let Some(structure) = self.structure() {
            if let Ok(json) = serde_json::to_string_pretty(structure) {
                debug!("Command output:\n\n{json}\n\n");
            }
        }
    }
}

/// Opens the engine on the data directory described by `config`.
pub async fn open(config: &Config, mode: Mode) -> Result<DataAccess> {
    DataAccess::open(config, mode).await
}

/// Waits for background refreshes and stores the cache.
pub async fn close(access: &DataAccess) -> Result<()> {
    access.settle().await;
    access.persist_cache().await?;
    Ok(())
}

/// Describes a write outcome in one line, using `describe` for the entity.
fn describe_write<T>(
    what: &str,
    outcome: &WriteOutcome<T>,
    describe: impl Fn(&T) -> String,
) -> String {
    match outcome {
        WriteOutcome::Confirmed(value) => format!("Saved {what} {}", describe(value)),
        WriteOutcome::Queued(queued) => match &queued.value {
            Some(value) => format!("{}: {what} {}", queued.message, describe(value)),
            None => queued.message.clone(),
        },
        WriteOutcome::Skipped { reason, existing } => {
            format!("Skipped ({reason}): {what} {} already exists", describe(existing))
        }
    }
}
