//! Delivers queued operations to the remote API.
//!
//! A drain sends one operation at a time in queue order. Locks are only held between remote
//! calls, never across one, so the façade keeps serving reads and accepting writes while a drain
//! is running. Temporary ids are resolved here and nowhere else.

use crate::api::{RemoteApi, RemoteError, RemoteResult};
use crate::cache::ReferenceCache;
use crate::config::SyncSettings;
use crate::connectivity::ConnectivityMonitor;
use crate::events::{EventBus, SyncEvent};
use crate::model::{EntityRef, ReferenceEntity, Transaction};
use crate::queue::{DeliveryStatus, MutationQueue, OperationKind, Payload, PendingOperation};
use crate::Result;
use serde::Serialize;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Bounds `call` by `timeout`. Running out of time is a transient failure.
pub(crate) async fn bounded<T, F>(timeout: Duration, call: F) -> RemoteResult<T>
where
    F: Future<Output = RemoteResult<T>>,
{
    tokio::time::timeout(timeout, call)
        .await
        .unwrap_or(Err(RemoteError::Timeout(timeout)))
}

/// Puts `id` back to pending when recording its progress failed, so that it does not stay in
/// flight and hold up its lineage until the next restart.
async fn release(queue: &mut MutationQueue, id: i64, error: &anyhow::Error) {
    if !queue
        .get(id)
        .is_some_and(|op| op.status == DeliveryStatus::InFlight)
    {
        return;
    }
    warn!("Operation #{id} goes back to the queue: {error:#}");
    if let Err(e) = queue.requeue(id, &format!("{error:#}")).await {
        warn!("Unable to store the state of #{id}: {e:#}");
    }
}

/// Exponential backoff between delivery attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            attempts: settings.retry_attempts.max(1),
            base_delay: settings.retry_base_delay(),
            max_delay: settings.retry_max_delay(),
        }
    }

    /// The pause after failed attempt number `attempt` (starting at 1).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Draining,
}

/// What a drain did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub delivered: usize,
    pub failed: usize,
    /// Operations put back to pending because the connection went away.
    pub requeued: usize,
    /// Entries left in the queue afterwards, failed ones included.
    pub remaining: usize,
    /// Another drain was already running, so this one did nothing.
    pub skipped: bool,
}

impl Display for DrainReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.skipped {
            return write!(f, "A sync is already running");
        }
        write!(
            f,
            "Synced {} operation(s), {} failed, {} deferred, {} left in the queue",
            self.delivered, self.failed, self.requeued, self.remaining
        )
    }
}

/// The server's answer to a delivered operation.
#[derive(Debug, Clone)]
enum Delivery {
    Transaction(Transaction),
    Reference(ReferenceEntity),
    Removed,
}

enum Step {
    Delivered,
    Failed,
    Requeued,
}

/// Resets the draining flag when a drain ends, including by error.
struct Draining<'a>(&'a AtomicBool);

impl Drop for Draining<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// See the module documentation.
#[derive(Clone)]
pub struct SyncCoordinator {
    remote: Arc<dyn RemoteApi>,
    queue: Arc<Mutex<MutationQueue>>,
    cache: Arc<Mutex<ReferenceCache>>,
    monitor: Arc<Mutex<ConnectivityMonitor>>,
    events: EventBus,
    retry: RetryPolicy,
    request_timeout: Duration,
    draining: Arc<AtomicBool>,
}

impl SyncCoordinator {
    pub fn new(
        remote: Arc<dyn RemoteApi>,
        queue: Arc<Mutex<MutationQueue>>,
        cache: Arc<Mutex<ReferenceCache>>,
        monitor: Arc<Mutex<ConnectivityMonitor>>,
        events: EventBus,
        settings: &SyncSettings,
    ) -> Self {
        Self {
            remote,
            queue,
            cache,
            monitor,
            events,
            retry: RetryPolicy::from_settings(settings),
            request_timeout: settings.request_timeout(),
            draining: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> SyncState {
        if self.draining.load(Ordering::SeqCst) {
            SyncState::Draining
        } else {
            SyncState::Idle
        }
    }

    /// Sends queued operations until the queue has nothing deliverable left or the connection
    /// goes away. Only one drain runs at a time; a concurrent call returns a skipped report.
    pub async fn drain(&self) -> Result<DrainReport> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Drain requested while one is running");
            return Ok(DrainReport {
                skipped: true,
                ..DrainReport::default()
            });
        }
        let _draining = Draining(&self.draining);

        let mut report = DrainReport::default();
        loop {
            if !self.monitor.lock().await.is_online() {
                debug!("Offline, drain stops");
                break;
            }
            let op = {
                let mut queue = self.queue.lock().await;
                let Some(op) = queue.dequeue_next() else {
                    break;
                };
                if let Err(e) = queue.mark_in_flight(op.id).await {
                    release(&mut queue, op.id, &e).await;
                    return Err(e);
                }
                op
            };
            let step = match self.step(&op).await {
                Ok(step) => step,
                Err(e) => {
                    release(&mut *self.queue.lock().await, op.id, &e).await;
                    return Err(e);
                }
            };
            match step {
                Step::Delivered => report.delivered += 1,
                Step::Failed => report.failed += 1,
                Step::Requeued => {
                    report.requeued += 1;
                    break;
                }
            }
        }
        report.remaining = self.queue.lock().await.len();
        info!("{report}");
        Ok(report)
    }

    async fn step(&self, op: &PendingOperation) -> Result<Step> {
        let result = self.deliver(op).await;
        let online = self.monitor.lock().await.is_online();
        match result {
            Ok(delivery) => {
                self.complete(op, delivery).await?;
                Ok(Step::Delivered)
            }
            Err(e) if e.is_transient() && !online => {
                debug!("Operation #{} deferred: {e}", op.id);
                self.queue.lock().await.requeue(op.id, &e.to_string()).await?;
                Ok(Step::Requeued)
            }
            Err(RemoteError::Unauthorized(message)) => {
                // Nothing else will get through either until the credentials are fixed.
                warn!("The API refused the credentials: {message}");
                self.queue.lock().await.requeue(op.id, &message).await?;
                Ok(Step::Requeued)
            }
            Err(e) => {
                warn!("Operation #{} on {} {} failed: {e}", op.id, op.entity, op.target);
                let error = e.to_string();
                self.queue.lock().await.mark_failed(op.id, &error).await?;
                self.events.publish(SyncEvent::SyncFailed {
                    operation_id: op.id,
                    entity: op.entity,
                    target: op.target.clone(),
                    error,
                });
                Ok(Step::Failed)
            }
        }
    }

    /// Sends `op`, retrying transient failures with backoff.
    async fn deliver(&self, op: &PendingOperation) -> RemoteResult<Delivery> {
        let mut attempt = 1;
        loop {
            let result = bounded(self.request_timeout, self.send(op)).await;
            match result {
                Err(e) if e.is_transient() && attempt < self.retry.attempts => {
                    let delay = self.retry.delay(attempt);
                    debug!("Attempt {attempt} for #{} failed ({e}), retrying in {delay:?}", op.id);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn send(&self, op: &PendingOperation) -> RemoteResult<Delivery> {
        let key = op.idempotency_key;
        let confirmed = || {
            op.target.confirmed().ok_or_else(|| {
                RemoteError::Validation(format!("{} {} has no server id", op.entity, op.target))
            })
        };
        match (op.entity.reference_kind(), op.kind, &op.payload) {
            (None, OperationKind::Create, Payload::Transaction(draft)) => self
                .remote
                .create_transaction(draft, key)
                .await
                .map(Delivery::Transaction),
            (None, OperationKind::Update, Payload::Patch(patch)) => self
                .remote
                .update_transaction(confirmed()?, patch, key)
                .await
                .map(Delivery::Transaction),
            (None, OperationKind::Delete, _) => {
                match self.remote.delete_transaction(confirmed()?, key).await {
                    Ok(()) | Err(RemoteError::NotFound(_)) => Ok(Delivery::Removed),
                    Err(e) => Err(e),
                }
            }
            (Some(kind), OperationKind::Create, Payload::Reference { name }) => {
                match self.remote.create_reference(kind, name, key).await {
                    Ok(entity) => Ok(Delivery::Reference(entity)),
                    // Someone else created it first: adopt the existing entity.
                    Err(RemoteError::Duplicate(message)) => self
                        .remote
                        .list_references(kind)
                        .await?
                        .into_iter()
                        .find(|e| e.same_name(name))
                        .map(Delivery::Reference)
                        .ok_or(RemoteError::Duplicate(message)),
                    Err(e) => Err(e),
                }
            }
            (Some(kind), OperationKind::Update, Payload::Reference { name }) => self
                .remote
                .rename_reference(kind, confirmed()?, name, key)
                .await
                .map(Delivery::Reference),
            (Some(kind), OperationKind::Delete, _) => {
                match self.remote.delete_reference(kind, confirmed()?, key).await {
                    Ok(()) | Err(RemoteError::NotFound(_)) => Ok(Delivery::Removed),
                    Err(e) => Err(e),
                }
            }
            _ => Err(RemoteError::Validation(format!(
                "malformed {} of {}",
                op.kind, op.entity
            ))),
        }
    }

    /// Records a delivery. For creates this is the identity resolution step: the queue and the
    /// cache are rewritten from the temporary id to the server id before `EntitySynced` goes out.
    async fn complete(&self, op: &PendingOperation, delivery: Delivery) -> Result<()> {
        let server_id = match &delivery {
            Delivery::Transaction(tx) => tx.id.confirmed(),
            Delivery::Reference(entity) => entity.id.confirmed(),
            Delivery::Removed => op.target.confirmed(),
        };
        let Some(server_id) = server_id else {
            anyhow::bail!("The server answered #{} without an id", op.id);
        };
        let temp_id = op.target.temp().cloned();

        // Lock order: queue, then cache.
        let mut queue = self.queue.lock().await;
        let mut cache = self.cache.lock().await;
        queue.mark_delivered(op.id, Some(server_id)).await?;
        if let Some(tmp) = &temp_id {
            let rewritten = cache.resolve_identity(tmp, server_id);
            debug!("Resolved {tmp} to {server_id} in {rewritten} cache item(s)");
        }

        let target = EntityRef::Confirmed(server_id);
        // Writes made while this one was in flight are newer than the server's answer.
        let superseded = queue.has_undelivered(op.entity, &target);
        match delivery {
            // The overlay only carries transactions the server has not seen yet.
            Delivery::Transaction(_) if temp_id.is_some() => cache.forget_transactions(),
            Delivery::Transaction(tx) if !superseded => {
                cache.update_transaction(&tx);
            }
            Delivery::Reference(entity) if !superseded => {
                if let Some(kind) = op.entity.reference_kind() {
                    cache.upsert_reference(kind, entity);
                }
            }
            Delivery::Removed => match op.entity.reference_kind() {
                Some(kind) => {
                    cache.remove_reference(kind, &target);
                }
                None => {
                    cache.remove_transaction(&target);
                }
            },
            _ => debug!("{} {target} has newer local changes", op.entity),
        }
        drop(cache);
        drop(queue);

        info!("Delivered #{} {} {} {}", op.id, op.kind, op.entity, target);
        self.events.publish(SyncEvent::EntitySynced {
            entity: op.entity,
            temp_id,
            id: server_id,
        });
        Ok(())
    }
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("retry", &self.retry)
            .field("request_timeout", &self.request_timeout)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
