//! Insert command handlers.

use crate::commands::{describe_write, Out};
use crate::facade::{DataAccess, WriteOutcome};
use crate::model::{ReferenceEntity, ReferenceKind, Transaction, TransactionDraft};
use crate::Result;

/// Creates a transaction. While the API is unreachable the transaction is queued under a
/// temporary id (`tmp-...`) that can be used in later commands until it is synced.
///
/// # Errors
///
/// - Returns an error if the transaction is invalid, for example a zero amount or a reference to
///   a temporary id that is not queued.
pub async fn insert_transaction(
    access: &DataAccess,
    draft: TransactionDraft,
) -> Result<Out<WriteOutcome<Transaction>>> {
    let outcome = access.create_transaction(draft).await?;
    let message = describe_write("transaction", &outcome, describe_transaction);
    Ok(Out::new(message, outcome))
}

/// Creates a category, source or target unless one with the same name already exists.
pub async fn insert_reference(
    access: &DataAccess,
    kind: ReferenceKind,
    name: &str,
) -> Result<Out<WriteOutcome<ReferenceEntity>>> {
    let outcome = access.ensure_reference(kind, name).await?;
    let message = describe_write(&kind.to_string(), &outcome, describe_reference);
    Ok(Out::new(message, outcome))
}

pub(super) fn describe_transaction(t: &Transaction) -> String {
    format!(
        "{} ({} {} on {})",
        t.id, t.fields.kind, t.fields.amount, t.fields.date
    )
}

pub(super) fn describe_reference(r: &ReferenceEntity) -> String {
    format!("{} '{}'", r.id, r.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::TestRemote;
    use crate::model::{Amount, TransactionType};
    use crate::test::TestEnv;
    use chrono::NaiveDate;
    use std::str::FromStr;
    use std::sync::Arc;

    fn draft() -> TransactionDraft {
        TransactionDraft {
            amount: Amount::from_str("12.00").unwrap(),
            kind: TransactionType::Expense,
            date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            description: "Books".to_string(),
            category: None,
            source: None,
            target: None,
            recurrence: None,
        }
    }

    #[tokio::test]
    async fn test_insert_transaction_online_and_offline() {
        let env = TestEnv::new().await;
        let remote = Arc::new(TestRemote::new());
        let access = env.access(remote.clone(), true).await;
        let out = insert_transaction(&access, draft()).await.unwrap();
        assert!(out.message().starts_with("Saved transaction"));
        assert_eq!(remote.transactions().len(), 1);

        let offline = env.access(remote.clone(), false).await;
        let out = insert_transaction(&offline, draft()).await.unwrap();
        assert!(out.message().starts_with("Saved, will sync"));
        assert!(out.message().contains("tmp-"));
        assert_eq!(remote.transactions().len(), 1);
    }

    #[tokio::test]
    async fn test_insert_reference_twice_is_skipped() {
        let env = TestEnv::new().await;
        let access = env.access(Arc::new(TestRemote::new()), true).await;
        insert_reference(&access, ReferenceKind::Source, "Salary")
            .await
            .unwrap();
        let out = insert_reference(&access, ReferenceKind::Source, " salary ")
            .await
            .unwrap();
        assert!(out.message().starts_with("Skipped (duplicate)"));
    }

    #[tokio::test]
    async fn test_insert_rejects_invalid_amount() {
        let env = TestEnv::new().await;
        let access = env.access(Arc::new(TestRemote::new()), false).await;
        let mut bad = draft();
        bad.amount = Amount::from_str("0").unwrap();
        assert!(insert_transaction(&access, bad).await.is_err());
        assert!(access.pending_operations().await.is_empty());
    }
}
