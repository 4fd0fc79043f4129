use crate::commands::Out;
use crate::facade::DataAccess;
use crate::queue::{DeliveryStatus, PendingOperation};
use crate::Result;
use std::fmt::Write;

/// Lists queued writes in delivery order.
pub async fn queue_list(access: &DataAccess) -> Result<Out<Vec<PendingOperation>>> {
    let ops = access.pending_operations().await;
    if ops.is_empty() {
        return Ok(Out::new("Nothing is waiting to sync", ops));
    }
    let mut message = format!("{} queued write(s):", ops.len());
    for op in &ops {
        let _ = write!(
            message,
            "\n  {:>4}  {:<9} {:<6} {:<11} {}",
            op.id,
            op.status.to_string(),
            op.kind.to_string(),
            op.entity.to_string(),
            op.target
        );
        if op.status == DeliveryStatus::Failed {
            if let Some(error) = &op.last_error {
                let _ = write!(message, "  ({error})");
            }
        }
    }
    Ok(Out::new(message, ops))
}

/// Puts a failed write back in line. It is delivered by the next sync.
pub async fn queue_retry(access: &DataAccess, id: i64) -> Result<Out<()>> {
    access.retry_failed(id).await?;
    Ok(format!("Operation {id} will be retried on the next sync").into())
}

/// Drops a failed write along with later writes to the same entity.
pub async fn queue_discard(access: &DataAccess, id: i64) -> Result<Out<Vec<PendingOperation>>> {
    let removed = access.discard_failed(id).await?;
    Ok(Out::new(
        format!("Discarded {} queued write(s)", removed.len()),
        removed,
    ))
}
