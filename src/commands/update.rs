//! Update command handlers.

use crate::commands::insert::{describe_reference, describe_transaction};
use crate::commands::{describe_write, Out};
use crate::facade::{DataAccess, WriteOutcome};
use crate::model::{EntityRef, ReferenceEntity, ReferenceKind, Transaction, TransactionPatch};
use crate::Result;

/// Changes the fields of a transaction that `patch` sets.
pub async fn update_transaction(
    access: &DataAccess,
    id: EntityRef,
    patch: TransactionPatch,
) -> Result<Out<WriteOutcome<Transaction>>> {
    let outcome = access.update_transaction(id, patch).await?;
    let message = describe_write("transaction", &outcome, describe_transaction);
    Ok(Out::new(message, outcome))
}

pub async fn rename_reference(
    access: &DataAccess,
    kind: ReferenceKind,
    id: EntityRef,
    name: &str,
) -> Result<Out<WriteOutcome<ReferenceEntity>>> {
    let outcome = access.rename_reference(kind, id, name).await?;
    let message = describe_write(&kind.to_string(), &outcome, describe_reference);
    Ok(Out::new(message, outcome))
}
