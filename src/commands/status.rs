use crate::commands::Out;
use crate::facade::{DataAccess, Status};
use crate::Result;

/// Reports connectivity, queue and cache counts.
pub async fn status(access: &DataAccess) -> Result<Out<Status>> {
    let status = access.status().await;
    let connection = if status.online { "online" } else { "offline" };
    let mut message = format!(
        "The API is {connection}. {} write(s) waiting to sync, {} failed",
        status.pending, status.failed
    );
    if status.draining {
        message.push_str(". A sync is running");
    }
    Ok(Out::new(message, status))
}
