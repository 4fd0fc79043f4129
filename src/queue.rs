//! The durable, ordered list of writes that have not reached the server yet.
//!
//! Operations on the same entity (its *lineage*) are delivered in the order they were made. Every
//! change is written through to the [`Store`] before the call returns.

use crate::db::Store;
use crate::model::{
    EntityKind, EntityRef, ReferenceKind, TempId, TransactionDraft, TransactionPatch,
};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

serde_plain::derive_display_from_serialize!(OperationKind);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    InFlight,
    Failed,
}

serde_plain::derive_display_from_serialize!(DeliveryStatus);

/// The data a queued operation sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "data")]
pub enum Payload {
    Transaction(TransactionDraft),
    Patch(TransactionPatch),
    Reference { name: String },
    Empty,
}

impl Payload {
    fn references(&self) -> Vec<&EntityRef> {
        match self {
            Payload::Transaction(draft) => draft.references().map(|(_, r)| r).collect(),
            Payload::Patch(patch) => patch.references().map(|(_, r)| r).collect(),
            Payload::Reference { .. } | Payload::Empty => Vec::new(),
        }
    }

    fn resolve(&mut self, tmp: &TempId, server_id: i64) -> bool {
        let refs: Vec<&mut EntityRef> = match self {
            Payload::Transaction(draft) => draft.references_mut().collect(),
            Payload::Patch(patch) => patch.references_mut().collect(),
            Payload::Reference { .. } | Payload::Empty => Vec::new(),
        };
        refs.into_iter()
            .fold(false, |changed, r| r.resolve(tmp, server_id) | changed)
    }

    /// Folds a later update into this payload. Returns `false` if the two do not combine.
    fn absorb(&mut self, later: &Payload) -> bool {
        match (self, later) {
            (Payload::Transaction(draft), Payload::Patch(patch)) => {
                draft.apply(patch);
                true
            }
            (Payload::Patch(patch), Payload::Patch(later)) => {
                patch.merge(later);
                true
            }
            (Payload::Reference { name }, Payload::Reference { name: later }) => {
                *name = later.clone();
                true
            }
            _ => false,
        }
    }
}

/// A write the caller wants delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOperation {
    pub kind: OperationKind,
    pub entity: EntityKind,
    pub target: EntityRef,
    pub payload: Payload,
    /// Used for every delivery attempt, including a direct call made before the write was queued.
    pub idempotency_key: Uuid,
}

impl NewOperation {
    pub fn create_transaction(tmp: TempId, draft: TransactionDraft) -> Self {
        Self {
            kind: OperationKind::Create,
            entity: EntityKind::Transaction,
            target: EntityRef::Temp(tmp),
            payload: Payload::Transaction(draft),
            idempotency_key: Uuid::new_v4(),
        }
    }

    pub fn update_transaction(target: EntityRef, patch: TransactionPatch) -> Self {
        Self {
            kind: OperationKind::Update,
            entity: EntityKind::Transaction,
            target,
            payload: Payload::Patch(patch),
            idempotency_key: Uuid::new_v4(),
        }
    }

    pub fn create_reference(kind: ReferenceKind, tmp: TempId, name: &str) -> Self {
        Self {
            kind: OperationKind::Create,
            entity: kind.into(),
            target: EntityRef::Temp(tmp),
            payload: Payload::Reference {
                name: name.trim().to_string(),
            },
            idempotency_key: Uuid::new_v4(),
        }
    }

    pub fn rename_reference(kind: ReferenceKind, target: EntityRef, name: &str) -> Self {
        Self {
            kind: OperationKind::Update,
            entity: kind.into(),
            target,
            payload: Payload::Reference {
                name: name.trim().to_string(),
            },
            idempotency_key: Uuid::new_v4(),
        }
    }

    pub fn delete(entity: EntityKind, target: EntityRef) -> Self {
        Self {
            kind: OperationKind::Delete,
            entity,
            target,
            payload: Payload::Empty,
            idempotency_key: Uuid::new_v4(),
        }
    }
}

/// A queued write with its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PendingOperation {
    /// Assigned by the store, increasing in enqueue order.
    #[serde(default)]
    pub id: i64,
    pub kind: OperationKind,
    pub entity: EntityKind,
    pub target: EntityRef,
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
    pub status: DeliveryStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Sent with every delivery attempt so that the server can recognize a retry.
    pub idempotency_key: Uuid,
}

impl PendingOperation {
    fn lineage(&self) -> (EntityKind, &EntityRef) {
        (self.entity, &self.target)
    }

    pub fn is_lineage_of(&self, entity: EntityKind, target: &EntityRef) -> bool {
        self.entity == entity && &self.target == target
    }

    /// Temporary ids in the payload, other than the operation's own target.
    pub fn depends_on(&self) -> Vec<&TempId> {
        self.payload
            .references()
            .into_iter()
            .filter_map(|r| r.temp())
            .collect()
    }

    pub fn mentions(&self, tmp: &TempId) -> bool {
        self.target.temp() == Some(tmp) || self.depends_on().contains(&tmp)
    }

    fn resolve(&mut self, tmp: &TempId, server_id: i64) -> bool {
        let target = self.target.resolve(tmp, server_id);
        self.payload.resolve(tmp, server_id) | target
    }

    fn is_open_create(&self) -> bool {
        self.kind == OperationKind::Create && self.status != DeliveryStatus::InFlight
    }
}

/// What `enqueue` did with an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enqueued {
    /// Stored as a new entry.
    Queued(PendingOperation),
    /// Folded into an undelivered entry of the same lineage, which is returned.
    Merged(PendingOperation),
    /// A delete of an entity that was never delivered. The listed entries were removed and
    /// nothing will be sent.
    Cancelled { removed: Vec<PendingOperation> },
}

/// See the module documentation.
pub struct MutationQueue {
    store: Arc<dyn Store>,
    ops: Vec<PendingOperation>,
}

impl std::fmt::Debug for MutationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationQueue")
            .field("ops", &self.ops)
            .finish_non_exhaustive()
    }
}

impl MutationQueue {
    /// Restores the queue from `store`. Entries left in flight by a previous process go back to
    /// pending: their outcome is unknown and the idempotency key makes a resend safe.
    pub async fn load(store: Arc<dyn Store>) -> Result<Self> {
        let mut ops = store.load_operations().await?;
        for op in ops.iter_mut() {
            if op.status == DeliveryStatus::InFlight {
                op.status = DeliveryStatus::Pending;
                store.update_operation(op).await?;
            }
        }
        debug!("Loaded {} queued operation(s)", ops.len());
        Ok(Self { store, ops })
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// All entries in enqueue order.
    pub fn operations(&self) -> &[PendingOperation] {
        &self.ops
    }

    pub fn get(&self, id: i64) -> Option<&PendingOperation> {
        self.ops.iter().find(|op| op.id == id)
    }

    pub fn pending(&self) -> Vec<PendingOperation> {
        self.with_status(DeliveryStatus::Pending)
    }

    pub fn failed(&self) -> Vec<PendingOperation> {
        self.with_status(DeliveryStatus::Failed)
    }

    fn with_status(&self, status: DeliveryStatus) -> Vec<PendingOperation> {
        self.ops
            .iter()
            .filter(|op| op.status == status)
            .cloned()
            .collect()
    }

    /// Whether the entity has writes that have not been delivered.
    pub fn has_undelivered(&self, entity: EntityKind, target: &EntityRef) -> bool {
        self.ops.iter().any(|op| op.is_lineage_of(entity, target))
    }

    /// Whether `tmp` names an entity whose create has not been delivered yet.
    pub fn is_undelivered_temp(&self, tmp: &TempId) -> bool {
        self.ops
            .iter()
            .any(|op| op.kind == OperationKind::Create && op.target.temp() == Some(tmp))
    }

    pub fn references_temp(&self, tmp: &TempId) -> bool {
        self.ops.iter().any(|op| op.mentions(tmp))
    }

    /// Ids of operations outside the lineage of `tmp` whose payload refers to it.
    pub fn dependents_of(&self, tmp: &TempId) -> Vec<i64> {
        self.ops
            .iter()
            .filter(|op| op.target.temp() != Some(tmp) && op.depends_on().contains(&tmp))
            .map(|op| op.id)
            .collect()
    }

    /// Adds `new` to the queue, collapsing it into undelivered entries of the same lineage where
    /// possible:
    /// - a delete of an entity whose create is not in flight removes the whole lineage
    /// - an update of such an entity is merged into its create
    /// - an update following an undelivered update is merged into it
    pub async fn enqueue(&mut self, new: NewOperation) -> Result<Enqueued> {
        let lineage: Vec<usize> = self
            .ops
            .iter()
            .enumerate()
            .filter(|(_, op)| op.is_lineage_of(new.entity, &new.target))
            .map(|(i, _)| i)
            .collect();
        let head = lineage.first().map(|&i| &self.ops[i]);

        match new.kind {
            OperationKind::Delete if head.is_some_and(PendingOperation::is_open_create) => {
                let mut removed = Vec::with_capacity(lineage.len());
                for &i in lineage.iter().rev() {
                    let op = self.ops.remove(i);
                    self.store.delete_operation(op.id).await?;
                    removed.push(op);
                }
                removed.reverse();
                info!(
                    "Delete of undelivered {} {} cancelled {} queued operation(s)",
                    new.entity,
                    new.target,
                    removed.len()
                );
                return Ok(Enqueued::Cancelled { removed });
            }
            OperationKind::Delete => {
                // Pending updates of an entity about to be deleted need not be sent.
                for &i in lineage.iter().rev() {
                    let op = &self.ops[i];
                    if op.kind == OperationKind::Update && op.status == DeliveryStatus::Pending {
                        let op = self.ops.remove(i);
                        self.store.delete_operation(op.id).await?;
                    }
                }
            }
            OperationKind::Update => {
                let open_create = head.is_some_and(PendingOperation::is_open_create);
                let last = lineage.last().copied();
                let into = match last {
                    Some(i) if lineage.len() == 1 && open_create => Some(i),
                    Some(i)
                        if self.ops[i].kind == OperationKind::Update
                            && self.ops[i].status == DeliveryStatus::Pending =>
                    {
                        Some(i)
                    }
                    _ => None,
                };
                if let Some(i) = into {
                    let op = &mut self.ops[i];
                    if op.payload.absorb(&new.payload) {
                        // An edited create that had been rejected gets another chance.
                        if op.status == DeliveryStatus::Failed {
                            op.status = DeliveryStatus::Pending;
                            op.attempts = 0;
                        }
                        debug!("Merged update of {} {} into #{}", new.entity, new.target, op.id);
                        self.store.update_operation(&self.ops[i]).await?;
                        return Ok(Enqueued::Merged(self.ops[i].clone()));
                    }
                }
            }
            OperationKind::Create => {}
        }

        let mut op = PendingOperation {
            id: 0,
            kind: new.kind,
            entity: new.entity,
            target: new.target,
            payload: new.payload,
            created_at: Utc::now(),
            status: DeliveryStatus::Pending,
            attempts: 0,
            last_error: None,
            idempotency_key: new.idempotency_key,
        };
        op.id = self.store.insert_operation(&op).await?;
        debug!("Queued #{} {} {} {}", op.id, op.kind, op.entity, op.target);
        self.ops.push(op.clone());
        Ok(Enqueued::Queued(op))
    }

    /// The oldest operation that may be sent now: it is pending, nothing earlier in its lineage
    /// is in flight, failed or held back, and it does not refer to an entity whose create is
    /// still queued.
    pub fn dequeue_next(&self) -> Option<PendingOperation> {
        let mut blocked: HashSet<(EntityKind, &EntityRef)> = HashSet::new();
        for op in &self.ops {
            if blocked.contains(&op.lineage()) {
                continue;
            }
            let waiting = op
                .depends_on()
                .into_iter()
                .any(|tmp| self.is_undelivered_temp(tmp));
            if op.status != DeliveryStatus::Pending || waiting {
                blocked.insert(op.lineage());
                continue;
            }
            return Some(op.clone());
        }
        None
    }

    fn position(&self, id: i64) -> Result<usize> {
        match self.ops.iter().position(|op| op.id == id) {
            Some(i) => Ok(i),
            None => anyhow::bail!("Queued operation {id} does not exist"),
        }
    }

    async fn set_status(&mut self, id: i64, status: DeliveryStatus, error: Option<String>) -> Result<()> {
        let i = self.position(id)?;
        let op = &mut self.ops[i];
        op.status = status;
        if status == DeliveryStatus::InFlight {
            op.attempts += 1;
        }
        if error.is_some() {
            op.last_error = error;
        }
        self.store.update_operation(&self.ops[i]).await
    }

    pub async fn mark_in_flight(&mut self, id: i64) -> Result<()> {
        self.set_status(id, DeliveryStatus::InFlight, None).await
    }

    /// Puts an in-flight operation back to pending after a transient failure.
    pub async fn requeue(&mut self, id: i64, error: &str) -> Result<()> {
        self.set_status(id, DeliveryStatus::Pending, Some(error.to_string()))
            .await
    }

    pub async fn mark_failed(&mut self, id: i64, error: &str) -> Result<()> {
        self.set_status(id, DeliveryStatus::Failed, Some(error.to_string()))
            .await
    }

    /// Removes a delivered operation. When a create is confirmed with `server_id`, every queued
    /// reference to its temporary id is rewritten first.
    pub async fn mark_delivered(
        &mut self,
        id: i64,
        server_id: Option<i64>,
    ) -> Result<PendingOperation> {
        let i = self.position(id)?;
        let op = self.ops.remove(i);
        self.store.delete_operation(op.id).await?;
        if let (Some(tmp), Some(server_id)) = (op.target.temp(), server_id) {
            self.resolve(tmp, server_id).await?;
        }
        Ok(op)
    }

    /// Rewrites `tmp` to `server_id` in every entry.
    pub async fn resolve(&mut self, tmp: &TempId, server_id: i64) -> Result<usize> {
        let mut changed = 0;
        for i in 0..self.ops.len() {
            if self.ops[i].resolve(tmp, server_id) {
                self.store.update_operation(&self.ops[i]).await?;
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Gives a failed operation a fresh set of attempts.
    pub async fn retry_failed(&mut self, id: i64) -> Result<bool> {
        let i = self.position(id)?;
        if self.ops[i].status != DeliveryStatus::Failed {
            return Ok(false);
        }
        self.ops[i].status = DeliveryStatus::Pending;
        self.ops[i].attempts = 0;
        self.store.update_operation(&self.ops[i]).await?;
        Ok(true)
    }

    /// Drops an operation that is not in flight. Discarding a create also drops the rest of its
    /// lineage, since those operations target an entity that will never exist.
    pub async fn discard(&mut self, id: i64) -> Result<Vec<PendingOperation>> {
        let i = self.position(id)?;
        anyhow::ensure!(
            self.ops[i].status != DeliveryStatus::InFlight,
            "Operation {id} is being delivered and cannot be discarded"
        );
        let op = self.ops.remove(i);
        self.store.delete_operation(op.id).await?;
        let mut removed = vec![op];
        if removed[0].kind == OperationKind::Create {
            let (entity, target) = (removed[0].entity, removed[0].target.clone());
            let mut j = 0;
            while j < self.ops.len() {
                if self.ops[j].is_lineage_of(entity, &target)
                    && self.ops[j].status != DeliveryStatus::InFlight
                {
                    let follower = self.ops.remove(j);
                    self.store.delete_operation(follower.id).await?;
                    removed.push(follower);
                } else {
                    j += 1;
                }
            }
        }
        info!("Discarded {} queued operation(s)", removed.len());
        Ok(removed)
    }
}
