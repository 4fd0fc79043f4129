//! Delete command handlers.

use crate::commands::{describe_write, Out};
use crate::facade::{DataAccess, WriteOutcome};
use crate::model::{EntityRef, ReferenceKind};
use crate::Result;

/// Deletes a transaction. Deleting a transaction that was created offline and never synced
/// simply removes it from the queue.
pub async fn delete_transaction(
    access: &DataAccess,
    id: EntityRef,
) -> Result<Out<WriteOutcome<EntityRef>>> {
    let outcome = access.delete_transaction(id).await?;
    let message = describe_write("deletion of transaction", &outcome, EntityRef::to_string);
    Ok(Out::new(message, outcome))
}

pub async fn delete_reference(
    access: &DataAccess,
    kind: ReferenceKind,
    id: EntityRef,
) -> Result<Out<WriteOutcome<EntityRef>>> {
    let outcome = access.delete_reference(kind, id).await?;
    let message = describe_write(&format!("deletion of {kind}"), &outcome, EntityRef::to_string);
    Ok(Out::new(message, outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::TestRemote;
    use crate::commands::queue_list;
    use crate::test::TestEnv;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_delete_of_offline_reference_cancels_its_create() {
        let env = TestEnv::new().await;
        let remote = Arc::new(TestRemote::new());
        let access = env.access(remote.clone(), false).await;
        let created = access
            .ensure_reference(ReferenceKind::Category, "Travel")
            .await
            .unwrap();
        let id = created.value().unwrap().id.clone();
        assert!(id.is_temp());
        assert_eq!(queue_list(&access).await.unwrap().structure().unwrap().len(), 1);

        delete_reference(&access, ReferenceKind::Category, id)
            .await
            .unwrap();
        assert!(queue_list(&access).await.unwrap().structure().unwrap().is_empty());
        assert!(remote.mutation_calls().is_empty());
    }
}
