//! The single entry point screens use to read and write data.
//!
//! Writes go straight to the server when that is safe and fall back to the mutation queue when it
//! is not: while offline, when the target or a referenced entity only has a temporary id, when the
//! entity already has undelivered operations, or when the direct call fails transiently. Reads
//! serve cached data immediately and refresh it in the background.

use crate::api::{self, Mode, RemoteApi, RemoteError, RemoteResult};
use crate::cache::{CacheKey, CachePayload, ReferenceCache, SourceFlag};
use crate::config::SyncSettings;
use crate::connectivity::{ConnectivityEvent, ConnectivityMonitor};
use crate::db::{self, keys, Store};
use crate::error::{EngineError, EngineResult};
use crate::events::{EventBus, Subscription, SyncEvent};
use crate::model::{
    EntityKind, EntityRef, ListParams, ReferenceEntity, ReferenceKind, TempId, Transaction,
    TransactionDraft, TransactionPatch, UserProfile,
};
use crate::queue::{
    DeliveryStatus, Enqueued, MutationQueue, NewOperation, OperationKind, Payload,
    PendingOperation,
};
use crate::sync::{bounded, DrainReport, SyncCoordinator, SyncState};
use crate::{Config, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const QUEUED_MESSAGE: &str = "Saved, will sync";
const CANCELLED_MESSAGE: &str = "Removed before it was synced, nothing to send";

/// Why a write was not performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// An entity with the same name already exists, either on the server or queued locally.
    Duplicate,
}

serde_plain::derive_display_from_serialize!(SkipReason);

/// A write that was stored locally and will be delivered by the sync coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Queued<T> {
    /// The queue entry holding the write. `None` when the write cancelled undelivered operations
    /// instead of adding one.
    pub operation_id: Option<i64>,
    /// The optimistic version of the entity, when it is known locally.
    pub value: Option<T>,
    pub message: String,
}

/// What happened to a write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome<T> {
    /// The server accepted the write.
    Confirmed(T),
    Queued(Queued<T>),
    Skipped { reason: SkipReason, existing: T },
}

impl<T> WriteOutcome<T> {
    fn queued(operation_id: Option<i64>, value: Option<T>) -> Self {
        let message = match operation_id {
            Some(_) => QUEUED_MESSAGE,
            None => CANCELLED_MESSAGE,
        };
        WriteOutcome::Queued(Queued {
            operation_id,
            value,
            message: message.to_string(),
        })
    }

    /// The confirmed, optimistic or existing entity.
    pub fn value(&self) -> Option<&T> {
        match self {
            WriteOutcome::Confirmed(value) => Some(value),
            WriteOutcome::Queued(queued) => queued.value.as_ref(),
            WriteOutcome::Skipped { existing, .. } => Some(existing),
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, WriteOutcome::Queued(_))
    }
}

/// What a read returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadOutcome<T> {
    /// Fetched from the server by this call.
    Live(T),
    /// Served from the cache. `revalidating` is set when a background refresh was started.
    Cached { value: T, revalidating: bool },
    /// Nothing cached and the server is out of reach.
    Unavailable,
}

impl<T> ReadOutcome<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            ReadOutcome::Live(value) | ReadOutcome::Cached { value, .. } => Some(value),
            ReadOutcome::Unavailable => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            ReadOutcome::Live(value) | ReadOutcome::Cached { value, .. } => Some(value),
            ReadOutcome::Unavailable => None,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, ReadOutcome::Live(_))
    }
}

/// One page of a transaction listing as screens see it: server items with queued edits applied
/// and, on the first page, the transactions that exist only locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionPage {
    pub items: Vec<Transaction>,
    pub total: Option<u64>,
    pub offset: u32,
    /// Where the next page starts. Only server items count, so local items never shift it.
    pub next_offset: u32,
    pub source: SourceFlag,
}

/// The result of one imported record, in input order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ImportItem {
    Created { transaction: Transaction },
    Queued { temp_id: TempId },
    Failed { error: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportOutcome {
    pub items: Vec<ImportItem>,
}

impl ImportOutcome {
    pub fn created(&self) -> usize {
        self.count(|item| matches!(item, ImportItem::Created { .. }))
    }

    pub fn queued(&self) -> usize {
        self.count(|item| matches!(item, ImportItem::Queued { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|item| matches!(item, ImportItem::Failed { .. }))
    }

    fn count(&self, f: impl Fn(&ImportItem) -> bool) -> usize {
        self.items.iter().filter(|item| f(item)).count()
    }
}

/// A summary of the engine's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    pub online: bool,
    pub draining: bool,
    pub pending: usize,
    pub failed: usize,
    pub cached_entries: usize,
    pub local_items: usize,
}

/// The collaborators a [`DataAccess`] is built from.
pub struct Components {
    pub remote: Arc<dyn RemoteApi>,
    pub store: Arc<dyn Store>,
    pub monitor: ConnectivityMonitor,
    pub cache: ReferenceCache,
    pub events: EventBus,
}

/// See the module documentation. Clones share all state.
#[derive(Clone)]
pub struct DataAccess {
    remote: Arc<dyn RemoteApi>,
    store: Arc<dyn Store>,
    queue: Arc<Mutex<MutationQueue>>,
    cache: Arc<Mutex<ReferenceCache>>,
    monitor: Arc<Mutex<ConnectivityMonitor>>,
    events: EventBus,
    sync: SyncCoordinator,
    request_timeout: Duration,
    revalidations: Arc<std::sync::Mutex<Vec<JoinHandle<()>>>>,
}

impl std::fmt::Debug for DataAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataAccess")
            .field("sync", &self.sync)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl DataAccess {
    /// Builds the engine and restores the queue from the store.
    pub async fn new(components: Components, settings: &SyncSettings) -> EngineResult<Self> {
        let Components {
            remote,
            store,
            monitor,
            cache,
            events,
        } = components;
        let queue = MutationQueue::load(store.clone())
            .await
            .map_err(EngineError::from_storage)?;
        let queue = Arc::new(Mutex::new(queue));
        let cache = Arc::new(Mutex::new(cache));
        let monitor = Arc::new(Mutex::new(monitor));
        let sync = SyncCoordinator::new(
            remote.clone(),
            queue.clone(),
            cache.clone(),
            monitor.clone(),
            events.clone(),
            settings,
        );
        Ok(Self {
            remote,
            store,
            queue,
            cache,
            monitor,
            events,
            sync,
            request_timeout: settings.request_timeout(),
            revalidations: Arc::default(),
        })
    }

    /// Opens the engine on the data directory of `config`. The initial connectivity state comes
    /// from a single ping and the cache from the last persisted snapshot.
    pub async fn open(config: &Config, mode: Mode) -> Result<Self> {
        let settings = config.sync();
        let remote = api::remote(config, mode).await?;
        let reachable = match bounded(settings.request_timeout(), remote.ping()).await {
            Ok(()) => true,
            Err(e) => {
                debug!("Initial ping failed: {e}");
                !e.is_transient()
            }
        };
        let components = Components {
            remote,
            store: Arc::new(config.db().clone()),
            monitor: ConnectivityMonitor::new(reachable, settings.stable_window()),
            cache: ReferenceCache::new(settings.cache_entries_per_namespace),
            events: EventBus::new(),
        };
        let access = Self::new(components, settings).await?;
        access.restore_cache().await?;
        Ok(access)
    }

    async fn call<T, F>(&self, call: F) -> RemoteResult<T>
    where
        F: Future<Output = RemoteResult<T>>,
    {
        bounded(self.request_timeout, call).await
    }

    pub async fn is_online(&self) -> bool {
        self.monitor.lock().await.is_online()
    }

    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Writes must be queued when a direct call could overtake or break queued work. `lineage` is
    /// the entity being written, `None` for creates.
    async fn must_queue(
        &self,
        lineage: Option<(EntityKind, &EntityRef)>,
        references: &[EntityRef],
    ) -> bool {
        if lineage.is_some_and(|(_, target)| target.is_temp()) || !self.is_online().await {
            return true;
        }
        let queue = self.queue.lock().await;
        lineage.is_some_and(|(entity, target)| queue.has_undelivered(entity, target))
            || references
                .iter()
                .filter_map(EntityRef::temp)
                .any(|tmp| queue.is_undelivered_temp(tmp))
    }

    /// Temporary ids are only meaningful while their create is queued.
    async fn check_temp<'a>(
        &self,
        references: impl IntoIterator<Item = &'a EntityRef>,
    ) -> EngineResult<()> {
        let queue = self.queue.lock().await;
        for tmp in references.into_iter().filter_map(EntityRef::temp) {
            if !queue.is_undelivered_temp(tmp) {
                return Err(EngineError::NotFound(format!(
                    "{tmp} is not a pending entity, it may have synced already"
                )));
            }
        }
        Ok(())
    }

    /// Enqueues `new`, applies `optimistic` to the cache under the same locks and announces the
    /// result.
    async fn enqueue<F>(&self, new: NewOperation, optimistic: F) -> EngineResult<Enqueued>
    where
        F: FnOnce(&mut ReferenceCache, &Enqueued),
    {
        self.enqueue_guarded(new, |_, _| Ok(()), optimistic).await
    }

    /// Like [`Self::enqueue`], but `guard` may refuse the operation first. It runs under the same
    /// locks as the enqueue itself.
    async fn enqueue_guarded<G, F>(
        &self,
        new: NewOperation,
        guard: G,
        optimistic: F,
    ) -> EngineResult<Enqueued>
    where
        G: FnOnce(&MutationQueue, &ReferenceCache) -> EngineResult<()>,
        F: FnOnce(&mut ReferenceCache, &Enqueued),
    {
        let (entity, target) = (new.entity, new.target.clone());
        let mut queue = self.queue.lock().await;
        guard(&*queue, &*self.cache.lock().await)?;
        let outcome = queue
            .enqueue(new)
            .await
            .map_err(EngineError::from_storage)?;
        let mut cache = self.cache.lock().await;
        optimistic(&mut cache, &outcome);
        drop(cache);
        drop(queue);

        let event = match &outcome {
            Enqueued::Queued(op) | Enqueued::Merged(op) => SyncEvent::Queued {
                operation_id: op.id,
                entity,
                target,
            },
            Enqueued::Cancelled { removed } => SyncEvent::Collapsed {
                entity,
                target,
                removed: removed.len(),
            },
        };
        info!("{event}");
        self.events.publish(event);
        Ok(outcome)
    }

    // Transactions.

    pub async fn create_transaction(
        &self,
        draft: TransactionDraft,
    ) -> EngineResult<WriteOutcome<Transaction>> {
        draft.validate().map_err(EngineError::Validation)?;
        self.check_temp(draft.references().map(|(_, r)| r)).await?;
        let tmp = TempId::generate();
        let op = NewOperation::create_transaction(tmp.clone(), draft.clone());

        let refs: Vec<EntityRef> = draft.references().map(|(_, r)| r.clone()).collect();
        if !self.must_queue(None, &refs).await {
            match self
                .call(self.remote.create_transaction(&draft, op.idempotency_key))
                .await
            {
                Ok(tx) => {
                    info!("Created transaction {}", tx.id);
                    self.cache.lock().await.forget_transactions();
                    return Ok(WriteOutcome::Confirmed(tx));
                }
                Err(e) if e.is_transient() => debug!("Create failed ({e}), queueing it"),
                Err(e) => return Err(e.into()),
            }
        }
        self.queue_create(op, Transaction::new(tmp, draft)).await
    }

    async fn queue_create(
        &self,
        op: NewOperation,
        optimistic: Transaction,
    ) -> EngineResult<WriteOutcome<Transaction>> {
        let outcome = self
            .enqueue(op, |cache, _| cache.push_local(optimistic.clone()))
            .await?;
        Ok(WriteOutcome::queued(operation_id(&outcome), Some(optimistic)))
    }

    pub async fn update_transaction(
        &self,
        target: EntityRef,
        patch: TransactionPatch,
    ) -> EngineResult<WriteOutcome<Transaction>> {
        if patch.is_empty() {
            return Err(EngineError::Validation("nothing to update".to_string()));
        }
        if let Some(amount) = &patch.amount {
            if !amount.is_positive() {
                return Err(EngineError::Validation(format!(
                    "amount must be positive, got {amount}"
                )));
            }
        }
        self.check_temp(std::iter::once(&target).chain(patch.references().map(|(_, r)| r)))
            .await?;
        let optimistic = {
            let cache = self.cache.lock().await;
            cache.find_transaction(&target).cloned().map(|mut tx| {
                tx.fields.apply(&patch);
                tx
            })
        };
        if let Some(tx) = &optimistic {
            tx.fields.validate().map_err(EngineError::Validation)?;
        }

        let op = NewOperation::update_transaction(target.clone(), patch.clone());
        let refs: Vec<EntityRef> = patch.references().map(|(_, r)| r.clone()).collect();
        if let (false, Some(id)) = (
            self.must_queue(Some((op.entity, &target)), &refs).await,
            target.confirmed(),
        ) {
            match self
                .call(self.remote.update_transaction(id, &patch, op.idempotency_key))
                .await
            {
                Ok(tx) => {
                    info!("Updated transaction {id}");
                    self.cache.lock().await.update_transaction(&tx);
                    return Ok(WriteOutcome::Confirmed(tx));
                }
                Err(e) if e.is_transient() => debug!("Update failed ({e}), queueing it"),
                Err(e) => return Err(e.into()),
            }
        }

        let outcome = self
            .enqueue(op, |cache, _| {
                // Pages pick queued edits up when they are read; only the overlay is edited here.
                if let Some(local) = cache.local_mut(&target) {
                    local.fields.apply(&patch);
                }
            })
            .await?;
        Ok(WriteOutcome::queued(operation_id(&outcome), optimistic))
    }

    pub async fn delete_transaction(
        &self,
        target: EntityRef,
    ) -> EngineResult<WriteOutcome<EntityRef>> {
        self.check_temp(std::iter::once(&target)).await?;
        let op = NewOperation::delete(EntityKind::Transaction, target.clone());
        if let (false, Some(id)) = (
            self.must_queue(Some((op.entity, &target)), &[]).await,
            target.confirmed(),
        ) {
            match self
                .call(self.remote.delete_transaction(id, op.idempotency_key))
                .await
            {
                Ok(()) => {
                    info!("Deleted transaction {id}");
                    self.cache.lock().await.remove_transaction(&target);
                    return Ok(WriteOutcome::Confirmed(target));
                }
                Err(e) if e.is_transient() => debug!("Delete failed ({e}), queueing it"),
                Err(e) => return Err(e.into()),
            }
        }
        let outcome = self
            .enqueue(op, |cache, _| {
                cache.remove_local(&target);
            })
            .await?;
        Ok(WriteOutcome::queued(operation_id(&outcome), Some(target)))
    }

    /// Sends many records in one request. Records that fail local validation are reported without
    /// being sent. When the server is out of reach, every valid record is queued individually.
    pub async fn import_transactions(
        &self,
        drafts: Vec<TransactionDraft>,
    ) -> EngineResult<ImportOutcome> {
        let mut items: Vec<Option<ImportItem>> = vec![None; drafts.len()];
        let mut valid: Vec<(usize, TransactionDraft)> = Vec::new();
        for (i, draft) in drafts.into_iter().enumerate() {
            let checked = match draft.validate() {
                Ok(()) => self.check_temp(draft.references().map(|(_, r)| r)).await,
                Err(e) => Err(EngineError::Validation(e)),
            };
            match checked {
                Ok(()) => valid.push((i, draft)),
                Err(e) => {
                    items[i] = Some(ImportItem::Failed {
                        error: e.to_string(),
                    })
                }
            }
        }

        let temp_refs: Vec<EntityRef> = valid
            .iter()
            .flat_map(|(_, d)| d.references().map(|(_, r)| r.clone()))
            .filter(EntityRef::is_temp)
            .collect();
        let direct = !valid.is_empty()
            && temp_refs.is_empty()
            && !self.must_queue(None, &[]).await;
        if direct {
            let records: Vec<TransactionDraft> = valid.iter().map(|(_, d)| d.clone()).collect();
            let key = uuid::Uuid::new_v4();
            match self.call(self.remote.bulk_import(&records, key)).await {
                Ok(results) if results.len() == records.len() => {
                    let mut created = false;
                    for ((i, _), result) in valid.drain(..).zip(results) {
                        items[i] = Some(match result {
                            api::ImportItemResult::Created { transaction } => {
                                created = true;
                                ImportItem::Created { transaction }
                            }
                            api::ImportItemResult::Failed { error } => ImportItem::Failed { error },
                        });
                    }
                    if created {
                        self.cache.lock().await.forget_transactions();
                    }
                }
                Ok(results) => {
                    return Err(EngineError::Storage(anyhow::anyhow!(
                        "The server answered {} results for {} records",
                        results.len(),
                        records.len()
                    )))
                }
                Err(e) if e.is_transient() => debug!("Import failed ({e}), queueing records"),
                Err(e) => return Err(e.into()),
            }
        }

        for (i, draft) in valid {
            let tmp = TempId::generate();
            let op = NewOperation::create_transaction(tmp.clone(), draft.clone());
            self.queue_create(op, Transaction::new(tmp.clone(), draft))
                .await?;
            items[i] = Some(ImportItem::Queued { temp_id: tmp });
        }

        let outcome = ImportOutcome {
            items: items.into_iter().flatten().collect(),
        };
        info!(
            "Imported {} record(s): {} created, {} queued, {} failed",
            outcome.items.len(),
            outcome.created(),
            outcome.queued(),
            outcome.failed()
        );
        Ok(outcome)
    }

    /// Lists transactions. Serves the cached page when there is one and refreshes it in the
    /// background while online.
    pub async fn list_transactions(
        &self,
        params: ListParams,
    ) -> EngineResult<ReadOutcome<TransactionPage>> {
        let key = CacheKey::transactions(&params);
        let online = self.is_online().await;
        let cached = self.cache.lock().await.get(&key);
        match (cached, online) {
            (Some(entry), online) => {
                if online {
                    self.revalidate_transactions(params.clone(), entry.generation);
                }
                let page = self.compose_page(&params, entry.payload).await;
                Ok(ReadOutcome::Cached {
                    value: page,
                    revalidating: online,
                })
            }
            (None, false) => Ok(ReadOutcome::Unavailable),
            (None, true) => match self.call(self.remote.list_transactions(&params)).await {
                Ok(page) => {
                    let payload = CachePayload::Transactions {
                        items: page.items,
                        total: page.total,
                    };
                    self.store_page(key, None, payload.clone()).await;
                    Ok(ReadOutcome::Live(self.compose_page(&params, payload).await))
                }
                Err(e) if e.is_transient() => {
                    debug!("Listing failed ({e}) and nothing is cached");
                    Ok(ReadOutcome::Unavailable)
                }
                Err(e) => Err(e.into()),
            },
        }
    }

    /// Stores a fetched page unless the entry moved on since `expected`.
    async fn store_page(&self, key: CacheKey, expected: Option<u64>, payload: CachePayload) {
        self.cache
            .lock()
            .await
            .put_if_unchanged(key, expected, payload, SourceFlag::Server);
    }

    fn revalidate_transactions(&self, params: ListParams, generation: u64) {
        let this = self.clone();
        self.track(tokio::spawn(async move {
            let key = CacheKey::transactions(&params);
            match this.call(this.remote.list_transactions(&params)).await {
                Ok(page) => {
                    let payload = CachePayload::Transactions {
                        items: page.items,
                        total: page.total,
                    };
                    this.store_page(key, Some(generation), payload).await;
                }
                Err(e) => debug!("Revalidating {}/{} failed: {e}", key.namespace, key.key),
            }
        }));
    }

    /// Applies queued edits and deletes to a server page and adds queued creates to the first
    /// page. Only items without a server id are added; confirmed ones come from server pages.
    async fn compose_page(&self, params: &ListParams, payload: CachePayload) -> TransactionPage {
        let (mut items, total) = match payload {
            CachePayload::Transactions { items, total } => (items, total),
            CachePayload::References(_) => (Vec::new(), None),
        };
        let server_count = u32::try_from(items.len()).unwrap_or(u32::MAX);
        let mut local_changes = false;

        let queue = self.queue.lock().await;
        let cache = self.cache.lock().await;
        for op in queue.operations() {
            if op.entity != EntityKind::Transaction || op.target.is_temp() {
                continue;
            }
            match (&op.kind, &op.payload) {
                (OperationKind::Update, Payload::Patch(patch)) => {
                    for tx in items.iter_mut().filter(|tx| tx.id == op.target) {
                        tx.fields.apply(patch);
                        local_changes = true;
                    }
                }
                (OperationKind::Delete, _) => {
                    let before = items.len();
                    items.retain(|tx| tx.id != op.target);
                    local_changes |= before != items.len();
                }
                _ => {}
            }
        }
        if params.offset == 0 {
            let present: HashSet<EntityRef> = items.iter().map(|tx| tx.id.clone()).collect();
            let mut local: Vec<Transaction> = cache
                .local()
                .iter()
                .rev()
                .filter(|tx| tx.id.is_temp() && !present.contains(&tx.id) && tx.matches(params))
                .cloned()
                .collect();
            local_changes |= !local.is_empty();
            local.append(&mut items);
            items = local;
        }

        TransactionPage {
            items,
            total,
            offset: params.offset,
            next_offset: params.offset.saturating_add(server_count),
            source: if local_changes {
                SourceFlag::Mixed
            } else {
                SourceFlag::Server
            },
        }
    }

    // Reference collections.

    pub async fn list_categories(&self) -> EngineResult<ReadOutcome<Vec<ReferenceEntity>>> {
        self.list_references(ReferenceKind::Category).await
    }

    pub async fn list_sources(&self) -> EngineResult<ReadOutcome<Vec<ReferenceEntity>>> {
        self.list_references(ReferenceKind::Source).await
    }

    pub async fn list_targets(&self) -> EngineResult<ReadOutcome<Vec<ReferenceEntity>>> {
        self.list_references(ReferenceKind::Target).await
    }

    /// Lists a reference collection, queued creates and renames included.
    pub async fn list_references(
        &self,
        kind: ReferenceKind,
    ) -> EngineResult<ReadOutcome<Vec<ReferenceEntity>>> {
        let key = CacheKey::references(kind);
        let online = self.is_online().await;
        let cached = self.cache.lock().await.get(&key);
        match (cached, online) {
            (Some(entry), online) => {
                if online {
                    self.revalidate_references(kind, entry.generation);
                }
                let value = match entry.payload {
                    CachePayload::References(entities) => entities,
                    CachePayload::Transactions { .. } => Vec::new(),
                };
                Ok(ReadOutcome::Cached {
                    value,
                    revalidating: online,
                })
            }
            (None, false) => Ok(ReadOutcome::Unavailable),
            (None, true) => match self.call(self.remote.list_references(kind)).await {
                Ok(entities) => Ok(ReadOutcome::Live(
                    self.store_references(kind, None, entities).await,
                )),
                Err(e) if e.is_transient() => Ok(ReadOutcome::Unavailable),
                Err(e) => Err(e.into()),
            },
        }
    }

    /// Merges queued reference writes into a server list and caches the result unless the entry
    /// moved on since `expected`.
    async fn store_references(
        &self,
        kind: ReferenceKind,
        expected: Option<u64>,
        server: Vec<ReferenceEntity>,
    ) -> Vec<ReferenceEntity> {
        let queue = self.queue.lock().await;
        let mut cache = self.cache.lock().await;
        let (entities, source) = overlay_references(queue.operations(), kind, server);
        cache.put_if_unchanged(
            CacheKey::references(kind),
            expected,
            CachePayload::References(entities.clone()),
            source,
        );
        entities
    }

    fn revalidate_references(&self, kind: ReferenceKind, generation: u64) {
        let this = self.clone();
        self.track(tokio::spawn(async move {
            match this.call(this.remote.list_references(kind)).await {
                Ok(entities) => {
                    this.store_references(kind, Some(generation), entities).await;
                }
                Err(e) => debug!("Revalidating {} failed: {e}", kind.collection()),
            }
        }));
    }

    /// An entity of `kind` named like `name`, among cached and queued ones.
    async fn find_reference(
        &self,
        kind: ReferenceKind,
        name: &str,
        except: Option<&EntityRef>,
    ) -> EngineResult<Option<ReferenceEntity>> {
        let known = self.list_references(kind).await?.into_value();
        let found = known
            .into_iter()
            .flatten()
            .find(|e| Some(&e.id) != except && e.same_name(name));
        if found.is_some() {
            return Ok(found);
        }
        let queue = self.queue.lock().await;
        let (queued, _) = overlay_references(queue.operations(), kind, Vec::new());
        Ok(queued
            .into_iter()
            .find(|e| Some(&e.id) != except && e.same_name(name)))
    }

    /// Creates a reference entity unless one with the same name (ignoring case) already exists.
    pub async fn ensure_reference(
        &self,
        kind: ReferenceKind,
        name: &str,
    ) -> EngineResult<WriteOutcome<ReferenceEntity>> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::Validation(format!("{kind} name is empty")));
        }
        if let Some(existing) = self.find_reference(kind, name, None).await? {
            debug!("{kind} '{name}' already exists as {}", existing.id);
            return Ok(WriteOutcome::Skipped {
                reason: SkipReason::Duplicate,
                existing,
            });
        }

        let tmp = TempId::generate();
        let op = NewOperation::create_reference(kind, tmp.clone(), name);
        if !self.must_queue(None, &[]).await {
            match self
                .call(self.remote.create_reference(kind, name, op.idempotency_key))
                .await
            {
                Ok(entity) => {
                    info!("Created {kind} '{}' as {}", entity.name, entity.id);
                    self.cache.lock().await.upsert_reference(kind, entity.clone());
                    return Ok(WriteOutcome::Confirmed(entity));
                }
                Err(RemoteError::Duplicate(message)) => {
                    let entities = self.call(self.remote.list_references(kind)).await?;
                    let entities = self.store_references(kind, None, entities).await;
                    return match entities.into_iter().find(|e| e.same_name(name)) {
                        Some(existing) => Ok(WriteOutcome::Skipped {
                            reason: SkipReason::Duplicate,
                            existing,
                        }),
                        None => Err(EngineError::Conflict(message)),
                    };
                }
                Err(e) if e.is_transient() => debug!("Create failed ({e}), queueing it"),
                Err(e) => return Err(e.into()),
            }
        }

        let optimistic = ReferenceEntity::new(tmp, name);
        let outcome = self
            .enqueue(op, |cache, _| {
                cache.upsert_reference(kind, optimistic.clone());
            })
            .await?;
        Ok(WriteOutcome::queued(operation_id(&outcome), Some(optimistic)))
    }

    pub async fn rename_reference(
        &self,
        kind: ReferenceKind,
        target: EntityRef,
        name: &str,
    ) -> EngineResult<WriteOutcome<ReferenceEntity>> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::Validation(format!("{kind} name is empty")));
        }
        self.check_temp(std::iter::once(&target)).await?;
        if let Some(existing) = self.find_reference(kind, name, Some(&target)).await? {
            return Ok(WriteOutcome::Skipped {
                reason: SkipReason::Duplicate,
                existing,
            });
        }

        let op = NewOperation::rename_reference(kind, target.clone(), name);
        if let (false, Some(id)) = (
            self.must_queue(Some((op.entity, &target)), &[]).await,
            target.confirmed(),
        ) {
            match self
                .call(self.remote.rename_reference(kind, id, name, op.idempotency_key))
                .await
            {
                Ok(entity) => {
                    self.cache.lock().await.upsert_reference(kind, entity.clone());
                    return Ok(WriteOutcome::Confirmed(entity));
                }
                Err(e) if e.is_transient() => debug!("Rename failed ({e}), queueing it"),
                Err(e) => return Err(e.into()),
            }
        }

        let optimistic = ReferenceEntity::new(target, name);
        let outcome = self
            .enqueue(op, |cache, _| {
                cache.upsert_reference(kind, optimistic.clone());
            })
            .await?;
        Ok(WriteOutcome::queued(operation_id(&outcome), Some(optimistic)))
    }

    pub async fn delete_reference(
        &self,
        kind: ReferenceKind,
        target: EntityRef,
    ) -> EngineResult<WriteOutcome<EntityRef>> {
        self.check_temp(std::iter::once(&target)).await?;
        let op = NewOperation::delete(kind.into(), target.clone());
        if let (false, Some(id)) = (
            self.must_queue(Some((op.entity, &target)), &[]).await,
            target.confirmed(),
        ) {
            match self
                .call(self.remote.delete_reference(kind, id, op.idempotency_key))
                .await
            {
                Ok(()) => {
                    self.cache.lock().await.remove_reference(kind, &target);
                    return Ok(WriteOutcome::Confirmed(target));
                }
                Err(e) if e.is_transient() => debug!("Delete failed ({e}), queueing it"),
                Err(e) => return Err(e.into()),
            }
        }
        let outcome = self
            .enqueue_guarded(
                op,
                |queue, cache| ensure_unreferenced(queue, cache, &target),
                |cache, _| {
                    cache.remove_reference(kind, &target);
                },
            )
            .await?;
        Ok(WriteOutcome::queued(operation_id(&outcome), Some(target)))
    }

    // Identity.

    /// The signed-in user. Falls back to the last snapshot while the server is out of reach.
    pub async fn current_user(&self) -> EngineResult<ReadOutcome<UserProfile>> {
        if self.is_online().await {
            match self.call(self.remote.current_user()).await {
                Ok(profile) => {
                    db::save_state(self.store.as_ref(), keys::PROFILE, &profile)
                        .await
                        .map_err(EngineError::from_storage)?;
                    return Ok(ReadOutcome::Live(profile));
                }
                Err(e) if e.is_transient() => debug!("Profile fetch failed ({e})"),
                Err(e) => return Err(e.into()),
            }
        }
        let snapshot: Option<UserProfile> = db::load_state(self.store.as_ref(), keys::PROFILE)
            .await
            .map_err(EngineError::from_storage)?;
        Ok(match snapshot {
            Some(profile) => ReadOutcome::Cached {
                value: profile,
                revalidating: false,
            },
            None => ReadOutcome::Unavailable,
        })
    }

    // Connectivity and delivery.

    /// Feeds a reachability observation to the monitor. A transition is published and coming
    /// back online drains the queue.
    pub async fn report_connectivity(
        &self,
        reachable: bool,
    ) -> EngineResult<(Option<ConnectivityEvent>, Option<DrainReport>)> {
        let event = self
            .monitor
            .lock()
            .await
            .observe(reachable, tokio::time::Instant::now());
        match event {
            Some(ConnectivityEvent::BecameOnline) => {
                self.events.publish(SyncEvent::BecameOnline);
                let report = self.sync_now().await?;
                Ok((event, Some(report)))
            }
            Some(ConnectivityEvent::BecameOffline) => {
                self.events.publish(SyncEvent::BecameOffline);
                Ok((event, None))
            }
            None => Ok((None, None)),
        }
    }

    /// Pings the server and reports the result. While online, a queue with deliverable entries
    /// is drained even without a transition.
    pub async fn probe(&self) -> EngineResult<(Option<ConnectivityEvent>, Option<DrainReport>)> {
        let reachable = match self.call(self.remote.ping()).await {
            Ok(()) => true,
            Err(e) if e.is_transient() => false,
            Err(e) => {
                warn!("Ping answered with {e}");
                true
            }
        };
        let (event, report) = self.report_connectivity(reachable).await?;
        if report.is_some() || !self.is_online().await {
            return Ok((event, report));
        }
        let deliverable = self.queue.lock().await.dequeue_next().is_some();
        if !deliverable {
            return Ok((event, None));
        }
        Ok((event, Some(self.sync_now().await?)))
    }

    /// Drains the queue now.
    pub async fn sync_now(&self) -> EngineResult<DrainReport> {
        self.sync.drain().await.map_err(EngineError::from_storage)
    }

    pub async fn pending_operations(&self) -> Vec<PendingOperation> {
        self.queue.lock().await.operations().to_vec()
    }

    pub async fn failed_operations(&self) -> Vec<PendingOperation> {
        self.queue.lock().await.failed()
    }

    /// Makes a failed operation eligible for delivery again.
    pub async fn retry_failed(&self, id: i64) -> EngineResult<()> {
        let mut queue = self.queue.lock().await;
        ensure_failed(&queue, id)?;
        queue
            .retry_failed(id)
            .await
            .map_err(EngineError::from_storage)?;
        info!("Operation #{id} will be retried");
        Ok(())
    }

    /// Drops a failed operation and undoes its optimistic effect on the cache.
    pub async fn discard_failed(&self, id: i64) -> EngineResult<Vec<PendingOperation>> {
        let mut queue = self.queue.lock().await;
        ensure_failed(&queue, id)?;
        let mut cache = self.cache.lock().await;
        if let Some(op) = queue.get(id).filter(|op| op.kind == OperationKind::Create) {
            ensure_unreferenced(&queue, &cache, &op.target)?;
        }
        let removed = queue.discard(id).await.map_err(EngineError::from_storage)?;
        for op in removed.iter().filter(|op| op.kind == OperationKind::Create) {
            match op.entity.reference_kind() {
                Some(kind) => {
                    cache.remove_reference(kind, &op.target);
                }
                None => {
                    cache.remove_local(&op.target);
                }
            }
        }
        info!("Discarded {} queued operation(s)", removed.len());
        Ok(removed)
    }

    pub async fn status(&self) -> Status {
        let online = self.is_online().await;
        let queue = self.queue.lock().await;
        let cache = self.cache.lock().await;
        Status {
            online,
            draining: self.sync.state() == SyncState::Draining,
            pending: queue.len() - queue.failed().len(),
            failed: queue.failed().len(),
            cached_entries: cache.len(),
            local_items: cache.local().len(),
        }
    }

    // Background work and persistence.

    fn track(&self, handle: JoinHandle<()>) {
        let mut handles = self
            .revalidations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Waits for background revalidations started so far.
    pub async fn settle(&self) {
        let handles: Vec<_> = self
            .revalidations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("A background refresh did not finish: {e}");
            }
        }
    }

    /// Stores the cache so that the next process starts warm.
    pub async fn persist_cache(&self) -> EngineResult<()> {
        let snapshot = self.cache.lock().await.snapshot();
        db::save_state(self.store.as_ref(), keys::CACHE_SNAPSHOT, &snapshot)
            .await
            .map_err(EngineError::from_storage)
    }

    /// Loads the stored cache snapshot, if there is one.
    pub async fn restore_cache(&self) -> EngineResult<bool> {
        let snapshot = db::load_state(self.store.as_ref(), keys::CACHE_SNAPSHOT)
            .await
            .map_err(EngineError::from_storage)?;
        match snapshot {
            Some(snapshot) => {
                self.cache.lock().await.restore(snapshot);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

fn ensure_failed(queue: &MutationQueue, id: i64) -> EngineResult<()> {
    match queue.get(id) {
        None => Err(EngineError::NotFound(format!("queued operation {id}"))),
        Some(op) if op.status != DeliveryStatus::Failed => Err(EngineError::Validation(format!(
            "operation {id} is {}, not failed",
            op.status
        ))),
        Some(_) => Ok(()),
    }
}

/// A temporary entity can only be dropped while no other queued write or local item refers to
/// it. Confirmed targets always pass; the server judges those.
fn ensure_unreferenced(
    queue: &MutationQueue,
    cache: &ReferenceCache,
    target: &EntityRef,
) -> EngineResult<()> {
    let Some(tmp) = target.temp() else {
        return Ok(());
    };
    let dependents = queue.dependents_of(tmp);
    if !dependents.is_empty() {
        let ids: Vec<String> = dependents.iter().map(|id| format!("#{id}")).collect();
        return Err(EngineError::Conflict(format!(
            "{tmp} is used by queued operation(s) {}",
            ids.join(", ")
        )));
    }
    if cache.local().iter().any(|tx| tx.id != *target && tx.mentions(tmp)) {
        return Err(EngineError::Conflict(format!(
            "{tmp} is used by a transaction that has not synced yet"
        )));
    }
    Ok(())
}

fn operation_id(outcome: &Enqueued) -> Option<i64> {
    match outcome {
        Enqueued::Queued(op) | Enqueued::Merged(op) => Some(op.id),
        Enqueued::Cancelled { .. } => None,
    }
}

/// Applies queued writes on reference entities of `kind` to `entities`, in queue order.
fn overlay_references(
    ops: &[PendingOperation],
    kind: ReferenceKind,
    mut entities: Vec<ReferenceEntity>,
) -> (Vec<ReferenceEntity>, SourceFlag) {
    let entity: EntityKind = kind.into();
    let mut local = false;
    for op in ops.iter().filter(|op| op.entity == entity) {
        match (&op.kind, &op.payload) {
            (OperationKind::Create, Payload::Reference { name }) => {
                if !entities.iter().any(|e| e.id == op.target) {
                    entities.push(ReferenceEntity::new(op.target.clone(), name.clone()));
                    local = true;
                }
            }
            (OperationKind::Update, Payload::Reference { name }) => {
                for e in entities.iter_mut().filter(|e| e.id == op.target) {
                    e.name = name.clone();
                    local = true;
                }
            }
            (OperationKind::Delete, _) => {
                let before = entities.len();
                entities.retain(|e| e.id != op.target);
                local |= before != entities.len();
            }
            _ => {}
        }
    }
    let source = if local {
        SourceFlag::Mixed
    } else {
        SourceFlag::Server
    };
    (entities, source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Call, TestRemote};
    use crate::db::MemoryStore;
    use crate::model::{Amount, TransactionType};
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    struct Harness {
        remote: Arc<TestRemote>,
        store: Arc<MemoryStore>,
        access: DataAccess,
    }

    fn settings() -> SyncSettings {
        SyncSettings {
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 2,
            request_timeout_ms: 500,
            stable_window_ms: 0,
            ..SyncSettings::default()
        }
    }

    async fn engine(remote: Arc<TestRemote>, store: Arc<MemoryStore>, online: bool) -> DataAccess {
        let components = Components {
            remote,
            store,
            monitor: ConnectivityMonitor::new(online, Duration::ZERO),
            cache: ReferenceCache::new(8),
            events: EventBus::new(),
        };
        DataAccess::new(components, &settings()).await.unwrap()
    }

    async fn harness() -> Harness {
        let remote = Arc::new(TestRemote::new());
        let store = Arc::new(MemoryStore::new());
        let access = engine(remote.clone(), store.clone(), true).await;
        Harness {
            remote,
            store,
            access,
        }
    }

    fn income_on(description: &str, day: u32) -> TransactionDraft {
        TransactionDraft {
            amount: Amount::from_str("42.50").unwrap(),
            kind: TransactionType::Income,
            date: NaiveDate::from_ymd_opt(2025, 5, day).unwrap(),
            description: description.to_string(),
            category: None,
            source: None,
            target: None,
            recurrence: None,
        }
    }

    fn income(description: &str) -> TransactionDraft {
        income_on(description, 20)
    }

    fn expense(description: &str, category: EntityRef) -> TransactionDraft {
        TransactionDraft {
            kind: TransactionType::Expense,
            category: Some(category),
            ..income(description)
        }
    }

    async fn go_offline(access: &DataAccess) {
        let (event, _) = access.report_connectivity(false).await.unwrap();
        assert_eq!(event, Some(ConnectivityEvent::BecameOffline));
    }

    async fn first_page(access: &DataAccess) -> TransactionPage {
        access
            .list_transactions(ListParams::page(10, 0))
            .await
            .unwrap()
            .into_value()
            .unwrap()
    }

    #[tokio::test]
    async fn test_online_create_is_confirmed() {
        let h = harness().await;
        let outcome = h.access.create_transaction(income("salary")).await.unwrap();
        let WriteOutcome::Confirmed(tx) = outcome else {
            panic!("expected a confirmed write, got {outcome:?}");
        };
        assert_eq!(tx.id, EntityRef::Confirmed(1));
        assert_eq!(h.remote.transactions(), vec![tx]);
        assert!(h.access.pending_operations().await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_write_is_never_queued() {
        let h = harness().await;
        go_offline(&h.access).await;
        let draft = TransactionDraft {
            kind: TransactionType::Expense,
            ..income("no category")
        };
        let err = h.access.create_transaction(draft).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        let err = h
            .access
            .create_transaction(TransactionDraft {
                amount: Amount::new(Decimal::ZERO),
                ..income("zero")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(h.access.pending_operations().await.is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_falls_back_to_queue_with_same_key() {
        let h = harness().await;
        h.remote.fail_next(RemoteError::Transient("connection reset".into()));
        let outcome = h.access.create_transaction(income("bonus")).await.unwrap();
        let WriteOutcome::Queued(queued) = &outcome else {
            panic!("expected a queued write, got {outcome:?}");
        };
        assert_eq!(queued.message, QUEUED_MESSAGE);

        let report = h.access.sync_now().await.unwrap();
        assert_eq!(report.delivered, 1);
        let keys: Vec<_> = h
            .remote
            .mutation_calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::CreateTransaction { key, .. } => Some(key),
                _ => None,
            })
            .collect();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0], keys[1]);
        assert_eq!(h.remote.transactions().len(), 1);
    }

    #[tokio::test]
    async fn test_create_then_delete_offline_sends_nothing() {
        let h = harness().await;
        let mut events = h.access.subscribe();
        go_offline(&h.access).await;
        let created = h.access.create_transaction(income("coffee")).await.unwrap();
        let id = created.value().unwrap().id.clone();
        let deleted = h.access.delete_transaction(id.clone()).await.unwrap();
        assert!(matches!(
            deleted,
            WriteOutcome::Queued(Queued {
                operation_id: None,
                ..
            })
        ));

        let (event, report) = h.access.report_connectivity(true).await.unwrap();
        assert_eq!(event, Some(ConnectivityEvent::BecameOnline));
        assert_eq!(report.unwrap().delivered, 0);
        assert!(h.remote.mutation_calls().is_empty());
        assert_eq!(h.access.status().await.local_items, 0);
        assert!(events.drain().contains(&SyncEvent::Collapsed {
            entity: EntityKind::Transaction,
            target: id,
            removed: 1,
        }));
    }

    #[tokio::test]
    async fn test_reconnect_delivers_offline_writes_in_order() {
        let h = harness().await;
        let kept = h.remote.seed_transaction(income("kept"));
        let gone = h.remote.seed_transaction(income("gone"));
        go_offline(&h.access).await;

        h.access.create_transaction(income("first")).await.unwrap();
        let patch = TransactionPatch {
            description: Some("second".to_string()),
            ..TransactionPatch::default()
        };
        h.access
            .update_transaction(kept.id.clone(), patch)
            .await
            .unwrap();
        h.access.delete_transaction(gone.id.clone()).await.unwrap();
        assert_eq!(h.access.pending_operations().await.len(), 3);
        assert!(h.remote.mutation_calls().is_empty());

        let (event, report) = h.access.report_connectivity(true).await.unwrap();
        assert_eq!(event, Some(ConnectivityEvent::BecameOnline));
        assert_eq!(report.unwrap().delivered, 3);
        let sent: Vec<String> = h
            .remote
            .mutation_calls()
            .into_iter()
            .map(|c| match c {
                Call::CreateTransaction { description, .. } => format!("create {description}"),
                Call::UpdateTransaction { id, .. } => format!("update {id}"),
                Call::DeleteTransaction { id, .. } => format!("delete {id}"),
                other => panic!("unexpected call {other:?}"),
            })
            .collect();
        assert_eq!(
            sent,
            vec![
                "create first".to_string(),
                format!("update {}", kept.id),
                format!("delete {}", gone.id),
            ]
        );
        assert!(h.access.pending_operations().await.is_empty());
        let descriptions: Vec<_> = h
            .remote
            .transactions()
            .into_iter()
            .map(|tx| tx.fields.description)
            .collect();
        assert_eq!(descriptions.len(), 2);
        assert!(descriptions.contains(&"second".to_string()));
        assert!(descriptions.contains(&"first".to_string()));
    }

    #[tokio::test]
    async fn test_offline_create_is_resolved_to_server_id() {
        let h = harness().await;
        assert!(first_page(&h.access).await.items.is_empty());
        let mut events = h.access.subscribe();
        go_offline(&h.access).await;

        let outcome = h.access.create_transaction(income("refund")).await.unwrap();
        let tmp = outcome.value().unwrap().id.temp().cloned().unwrap();
        let page = first_page(&h.access).await;
        assert_eq!(page.items[0].id, EntityRef::Temp(tmp.clone()));
        assert_eq!(page.source, SourceFlag::Mixed);

        h.remote.set_next_id(917);
        h.access.report_connectivity(true).await.unwrap();
        let synced: Vec<_> = events
            .drain()
            .into_iter()
            .filter(|e| matches!(e, SyncEvent::EntitySynced { .. }))
            .collect();
        assert_eq!(
            synced,
            vec![SyncEvent::EntitySynced {
                entity: EntityKind::Transaction,
                temp_id: Some(tmp),
                id: 917,
            }]
        );

        let page = first_page(&h.access).await;
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].id, EntityRef::Confirmed(917));
        h.access.settle().await;
        let page = first_page(&h.access).await;
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.source, SourceFlag::Server);
        assert_eq!(h.access.status().await.local_items, 0);
    }

    #[tokio::test]
    async fn test_transaction_waits_for_its_offline_category() {
        let h = harness().await;
        go_offline(&h.access).await;
        let category = h
            .access
            .ensure_reference(ReferenceKind::Category, "Travel")
            .await
            .unwrap();
        let category_id = category.value().unwrap().id.clone();
        assert!(category_id.is_temp());
        h.access
            .create_transaction(expense("train", category_id))
            .await
            .unwrap();

        let (_, report) = h.access.report_connectivity(true).await.unwrap();
        assert_eq!(report.unwrap().delivered, 2);
        let server_category = h.remote.references(ReferenceKind::Category)[0].clone();
        let server_tx = h.remote.transactions()[0].clone();
        assert_eq!(server_tx.fields.category, Some(server_category.id.clone()));
        let categories = h.access.list_categories().await.unwrap().into_value().unwrap();
        assert_eq!(categories, vec![server_category]);
    }

    #[tokio::test]
    async fn test_offline_category_in_use_cannot_be_deleted() {
        let h = harness().await;
        go_offline(&h.access).await;
        let category = h
            .access
            .ensure_reference(ReferenceKind::Category, "Travel")
            .await
            .unwrap();
        let category_id = category.value().unwrap().id.clone();
        let created = h
            .access
            .create_transaction(expense("train", category_id.clone()))
            .await
            .unwrap();
        let before = h.access.pending_operations().await;
        assert_eq!(before.len(), 2);

        let err = h
            .access
            .delete_reference(ReferenceKind::Category, category_id.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)), "{err:?}");
        assert_eq!(h.access.pending_operations().await, before);
        let categories = h.access.list_categories().await.unwrap().into_value().unwrap();
        assert_eq!(categories[0].id, category_id);

        // Once the transaction is gone the category can go too, and nothing is sent.
        let tx_id = created.value().unwrap().id.clone();
        h.access.delete_transaction(tx_id).await.unwrap();
        let deleted = h
            .access
            .delete_reference(ReferenceKind::Category, category_id)
            .await
            .unwrap();
        assert!(matches!(
            deleted,
            WriteOutcome::Queued(Queued {
                operation_id: None,
                ..
            })
        ));
        let (_, report) = h.access.report_connectivity(true).await.unwrap();
        assert_eq!(report.unwrap().delivered, 0);
        assert!(h.remote.mutation_calls().is_empty());
    }

    #[tokio::test]
    async fn test_ensure_reference_skips_duplicates() {
        let h = harness().await;
        let existing = h.remote.seed_reference(ReferenceKind::Category, "Groceries");
        let outcome = h
            .access
            .ensure_reference(ReferenceKind::Category, "  groceries ")
            .await
            .unwrap();
        assert_eq!(
            outcome,
            WriteOutcome::Skipped {
                reason: SkipReason::Duplicate,
                existing
            }
        );

        go_offline(&h.access).await;
        let first = h
            .access
            .ensure_reference(ReferenceKind::Source, "Cash")
            .await
            .unwrap();
        assert!(first.is_queued());
        let second = h
            .access
            .ensure_reference(ReferenceKind::Source, "CASH")
            .await
            .unwrap();
        assert!(matches!(second, WriteOutcome::Skipped { .. }));
        assert_eq!(h.access.pending_operations().await.len(), 1);
        assert!(!h
            .remote
            .calls()
            .iter()
            .any(|c| matches!(c, Call::CreateReference { .. })));
    }

    #[tokio::test]
    async fn test_next_offset_counts_only_server_items() {
        let h = harness().await;
        for day in 1..=25 {
            h.remote.seed_transaction(income_on("paycheck", day));
        }
        h.remote.fail_times(2, RemoteError::Transient("flaky".into()));
        for name in ["local one", "local two"] {
            let outcome = h.access.create_transaction(income(name)).await.unwrap();
            assert!(outcome.is_queued());
        }

        let mut offset = 0;
        for n in 1..=3u32 {
            let page = h
                .access
                .list_transactions(ListParams::page(10, offset))
                .await
                .unwrap()
                .into_value()
                .unwrap();
            match n {
                1 => {
                    assert_eq!(page.items.len(), 12);
                    assert_eq!(page.source, SourceFlag::Mixed);
                }
                2 => assert_eq!(page.items.len(), 10),
                _ => assert_eq!(page.items.len(), 5),
            }
            assert_eq!(page.next_offset, (n * 10).min(25));
            offset = page.next_offset;
        }
    }

    /// Reads the first three pages of ten and returns every id shown.
    async fn ids_across_pages(access: &DataAccess) -> Vec<EntityRef> {
        let mut ids = Vec::new();
        for offset in [0, 10, 20] {
            let page = access
                .list_transactions(ListParams::page(10, offset))
                .await
                .unwrap()
                .into_value()
                .unwrap();
            ids.extend(page.items.into_iter().map(|tx| tx.id));
        }
        ids
    }

    #[tokio::test]
    async fn test_online_create_is_listed_once_across_pages() {
        let h = harness().await;
        for day in 2..=26 {
            h.remote.seed_transaction(income_on("paycheck", day));
        }
        assert_eq!(first_page(&h.access).await.items.len(), 10);

        // The oldest date sorts it onto the last page.
        let outcome = h
            .access
            .create_transaction(income_on("back pay", 1))
            .await
            .unwrap();
        let created = outcome.value().unwrap().id.clone();
        assert_eq!(created, EntityRef::Confirmed(26));

        let ids = ids_across_pages(&h.access).await;
        assert_eq!(ids.len(), 26);
        assert_eq!(ids.iter().filter(|id| **id == created).count(), 1);
        assert_eq!(ids.last(), Some(&created));
        assert_eq!(h.access.status().await.local_items, 0);
    }

    #[tokio::test]
    async fn test_synced_create_is_listed_once_across_pages() {
        let h = harness().await;
        for day in 2..=26 {
            h.remote.seed_transaction(income_on("paycheck", day));
        }
        first_page(&h.access).await;
        go_offline(&h.access).await;
        h.access
            .create_transaction(income_on("back pay", 1))
            .await
            .unwrap();
        assert_eq!(first_page(&h.access).await.items.len(), 11);

        let (_, report) = h.access.report_connectivity(true).await.unwrap();
        assert_eq!(report.unwrap().delivered, 1);
        let created = EntityRef::Confirmed(26);
        let ids = ids_across_pages(&h.access).await;
        assert_eq!(ids.len(), 26);
        assert_eq!(ids.iter().filter(|id| **id == created).count(), 1);
        assert!(ids.iter().all(|id| !id.is_temp()));
    }

    #[tokio::test]
    async fn test_cached_read_is_revalidated_in_background() {
        let h = harness().await;
        h.remote.seed_transaction(income("first"));
        let params = ListParams::page(10, 0);
        assert!(h.access.list_transactions(params.clone()).await.unwrap().is_live());

        h.remote.seed_transaction(income("second"));
        let stale = h.access.list_transactions(params.clone()).await.unwrap();
        assert!(matches!(
            &stale,
            ReadOutcome::Cached {
                revalidating: true,
                ..
            }
        ));
        assert_eq!(stale.value().unwrap().items.len(), 1);

        h.access.settle().await;
        let fresh = h.access.list_transactions(params).await.unwrap();
        assert_eq!(fresh.value().unwrap().items.len(), 2);
    }

    #[tokio::test]
    async fn test_offline_read_without_cache_is_unavailable() {
        let h = harness().await;
        go_offline(&h.access).await;
        let outcome = h
            .access
            .list_transactions(ListParams::page(10, 0))
            .await
            .unwrap();
        assert_eq!(outcome, ReadOutcome::Unavailable);
        assert!(h.remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_queued_edits_show_in_cached_pages() {
        let h = harness().await;
        let kept = h.remote.seed_transaction(income("kept"));
        let gone = h.remote.seed_transaction(income("gone"));
        first_page(&h.access).await;
        go_offline(&h.access).await;

        let patch = TransactionPatch {
            amount: Some(Amount::from_str("75").unwrap()),
            ..TransactionPatch::default()
        };
        let outcome = h
            .access
            .update_transaction(kept.id.clone(), patch)
            .await
            .unwrap();
        assert_eq!(
            outcome.value().unwrap().fields.amount,
            Amount::from_str("75").unwrap()
        );
        h.access.delete_transaction(gone.id.clone()).await.unwrap();

        let page = first_page(&h.access).await;
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].id, kept.id);
        assert_eq!(page.items[0].fields.amount, Amount::from_str("75").unwrap());
        assert_eq!(page.next_offset, 2);
        assert_eq!(page.source, SourceFlag::Mixed);
    }

    #[tokio::test]
    async fn test_update_of_unknown_temp_id_is_not_found() {
        let h = harness().await;
        let patch = TransactionPatch {
            description: Some("renamed".to_string()),
            ..TransactionPatch::default()
        };
        let err = h
            .access
            .update_transaction(EntityRef::Temp(TempId::fixed("gone")), patch)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_current_user_falls_back_to_snapshot() {
        let h = harness().await;
        let live = h.access.current_user().await.unwrap();
        assert!(live.is_live());
        go_offline(&h.access).await;
        let cached = h.access.current_user().await.unwrap();
        assert!(!cached.is_live());
        assert_eq!(cached.value(), live.value());

        let fresh = engine(h.remote.clone(), Arc::new(MemoryStore::new()), false).await;
        assert_eq!(fresh.current_user().await.unwrap(), ReadOutcome::Unavailable);
    }

    #[tokio::test]
    async fn test_failed_create_can_be_retried_or_discarded() {
        let h = harness().await;
        go_offline(&h.access).await;
        // The server has no category 999.
        let outcome = h
            .access
            .create_transaction(expense("bike", EntityRef::Confirmed(999)))
            .await
            .unwrap();
        let op_id = match outcome {
            WriteOutcome::Queued(queued) => queued.operation_id.unwrap(),
            other => panic!("expected a queued write, got {other:?}"),
        };
        let err = h.access.retry_failed(op_id).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let (_, report) = h.access.report_connectivity(true).await.unwrap();
        assert_eq!(report.unwrap().failed, 1);
        h.access.retry_failed(op_id).await.unwrap();
        assert_eq!(h.access.sync_now().await.unwrap().failed, 1);

        let removed = h.access.discard_failed(op_id).await.unwrap();
        assert_eq!(removed.len(), 1);
        assert!(h.access.pending_operations().await.is_empty());
        assert_eq!(h.access.status().await.local_items, 0);
        assert!(matches!(
            h.access.discard_failed(op_id).await.unwrap_err(),
            EngineError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_import_reports_each_record() {
        let h = harness().await;
        let bad = TransactionDraft {
            amount: Amount::new(Decimal::ZERO),
            ..income("bad")
        };
        let outcome = h
            .access
            .import_transactions(vec![income("a"), bad, income("b")])
            .await
            .unwrap();
        assert_eq!((outcome.created(), outcome.failed()), (2, 1));
        assert!(matches!(outcome.items[1], ImportItem::Failed { .. }));
        assert_eq!(h.remote.transactions().len(), 2);

        go_offline(&h.access).await;
        let outcome = h
            .access
            .import_transactions(vec![income("c"), income("d")])
            .await
            .unwrap();
        assert_eq!(outcome.queued(), 2);
        assert_eq!(h.access.pending_operations().await.len(), 2);
    }

    #[tokio::test]
    async fn test_cache_snapshot_warms_next_engine() {
        let h = harness().await;
        h.remote.seed_reference(ReferenceKind::Category, "Rent");
        h.access.list_categories().await.unwrap();
        h.access.persist_cache().await.unwrap();

        let next = engine(h.remote.clone(), h.store.clone(), false).await;
        assert!(next.restore_cache().await.unwrap());
        let categories = next.list_categories().await.unwrap();
        assert!(matches!(categories, ReadOutcome::Cached { .. }));
        assert_eq!(categories.value().unwrap().len(), 1);
    }
}
