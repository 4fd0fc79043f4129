use crate::commands::Out;
use crate::connectivity;
use crate::facade::DataAccess;
use crate::sync::DrainReport;
use crate::Result;
use std::time::Duration;
use tracing::{info, warn};

/// Delivers the queued writes once, provided the API is reachable.
pub async fn sync(access: &DataAccess) -> Result<Out<DrainReport>> {
    let (event, report) = access.probe().await?;
    if let Some(event) = event {
        info!("{event:?}");
    }
    let report = match report {
        Some(report) => report,
        None if access.is_online().await => access.sync_now().await?,
        None => {
            let pending = access.pending_operations().await.len();
            return Ok(Out::new(
                format!("The API is not reachable, {pending} write(s) stay queued"),
                DrainReport {
                    remaining: pending,
                    ..DrainReport::default()
                },
            ));
        }
    };
    for op in access.failed_operations().await {
        warn!(
            "Operation {} ({} {} {}) failed: {}",
            op.id,
            op.kind,
            op.entity,
            op.target,
            op.last_error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(Out::new(report.to_string(), report))
}

/// Probes the connection every `interval` until Ctrl-C, syncing whenever the API comes back.
pub async fn watch(access: &DataAccess, interval: Duration) -> Result<Out<()>> {
    info!("Watching the connection every {interval:?}, press Ctrl-C to stop");
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Unable to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };
    connectivity::watch(access.clone(), interval, shutdown).await?;
    let pending = access.pending_operations().await.len();
    Ok(format!("Stopped watching, {pending} write(s) still queued").into())
}
