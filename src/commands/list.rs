//! List command handlers.

use crate::commands::Out;
use crate::facade::{DataAccess, ReadOutcome, TransactionPage};
use crate::model::{ListParams, ReferenceEntity, ReferenceKind};
use crate::Result;
use std::fmt::Write;

fn freshness<T>(outcome: &ReadOutcome<T>) -> &'static str {
    match outcome {
        ReadOutcome::Live(_) => "live",
        ReadOutcome::Cached {
            revalidating: true, ..
        } => "cached, refreshing",
        ReadOutcome::Cached { .. } => "cached",
        ReadOutcome::Unavailable => "unavailable",
    }
}

/// Lists one page of transactions. Transactions that only exist locally are shown on the first
/// page and do not move `next_offset`.
pub async fn list_transactions(
    access: &DataAccess,
    params: ListParams,
) -> Result<Out<ReadOutcome<TransactionPage>>> {
    let outcome = access.list_transactions(params).await?;
    let Some(page) = outcome.value() else {
        return Ok(Out::new(
            "No transactions are cached and the API is not reachable",
            outcome,
        ));
    };
    let mut message = format!(
        "{} transaction(s) from offset {} ({}, {}), next page at offset {}",
        page.items.len(),
        page.offset,
        freshness(&outcome),
        page.source,
        page.next_offset
    );
    for t in &page.items {
        let _ = write!(
            message,
            "\n  {}  {}  {} {}  {}",
            t.id, t.fields.date, t.fields.kind, t.fields.amount, t.fields.description
        );
    }
    Ok(Out::new(message, outcome))
}

/// Lists all categories, sources or targets.
pub async fn list_references(
    access: &DataAccess,
    kind: ReferenceKind,
) -> Result<Out<ReadOutcome<Vec<ReferenceEntity>>>> {
    let outcome = access.list_references(kind).await?;
    let Some(items) = outcome.value() else {
        return Ok(Out::new(
            format!(
                "No {} are cached and the API is not reachable",
                kind.collection()
            ),
            outcome,
        ));
    };
    let mut message = format!(
        "{} {} ({})",
        items.len(),
        kind.collection(),
        freshness(&outcome)
    );
    for r in items {
        let _ = write!(message, "\n  {}  {}", r.id, r.name);
    }
    Ok(Out::new(message, outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::TestRemote;
    use crate::commands::close;
    use crate::test::TestEnv;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_cached_listing_survives_restart_offline() {
        let env = TestEnv::new().await;
        let remote = Arc::new(TestRemote::new());
        remote.seed_reference(ReferenceKind::Category, "Food");
        remote.seed_reference(ReferenceKind::Category, "Rent");

        let online = env.access(remote.clone(), true).await;
        let out = list_references(&online, ReferenceKind::Category)
            .await
            .unwrap();
        assert!(out.structure().unwrap().is_live());
        close(&online).await.unwrap();

        let offline = env.access(remote.clone(), false).await;
        let out = list_references(&offline, ReferenceKind::Category)
            .await
            .unwrap();
        assert!(out.message().starts_with("2 categories (cached)"));

        let out = list_references(&offline, ReferenceKind::Target)
            .await
            .unwrap();
        assert_eq!(out.structure(), Some(&ReadOutcome::Unavailable));
    }
}
