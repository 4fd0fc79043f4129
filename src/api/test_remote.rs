//! An in-memory `RemoteApi` used by tests and by the CLI when `FINTRACK_IN_TEST_MODE` is set.
//!
//! It behaves like a small server: ids are assigned sequentially, reference names are unique
//! ignoring case, idempotency keys are honored, and every call is recorded so that tests can
//! assert on exactly what went over the wire. Failures and latency can be injected.

use crate::api::{ImportItemResult, Page, RemoteApi, RemoteError, RemoteResult};
use crate::model::{
    EntityRef, ListParams, ReferenceEntity, ReferenceKind, Transaction, TransactionDraft,
    TransactionPatch, UserProfile,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

/// A call received by `TestRemote`, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Ping,
    CurrentUser,
    ListTransactions(ListParams),
    CreateTransaction { key: Uuid, description: String },
    UpdateTransaction { id: i64, key: Uuid },
    DeleteTransaction { id: i64, key: Uuid },
    BulkImport { count: usize, key: Uuid },
    ListReferences(ReferenceKind),
    CreateReference { kind: ReferenceKind, name: String, key: Uuid },
    RenameReference { kind: ReferenceKind, id: i64, name: String, key: Uuid },
    DeleteReference { kind: ReferenceKind, id: i64, key: Uuid },
}

impl Call {
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            Call::Ping | Call::CurrentUser | Call::ListTransactions(_) | Call::ListReferences(_)
        )
    }
}

#[derive(Debug, Clone)]
enum Reply {
    Transaction(Transaction),
    Reference(ReferenceEntity),
    Import(Vec<ImportItemResult>),
    Done,
}

#[derive(Debug)]
struct State {
    reachable: bool,
    next_id: i64,
    latency: Option<Duration>,
    failures: VecDeque<RemoteError>,
    calls: Vec<Call>,
    profile: UserProfile,
    transactions: BTreeMap<i64, Transaction>,
    references: BTreeMap<ReferenceKind, BTreeMap<i64, ReferenceEntity>>,
    replies: HashMap<Uuid, Reply>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            reachable: true,
            next_id: 1,
            latency: None,
            failures: VecDeque::new(),
            calls: Vec::new(),
            profile: UserProfile {
                id: 1,
                email: "test@example.com".to_string(),
                display_name: "Test User".to_string(),
            },
            transactions: BTreeMap::new(),
            references: BTreeMap::new(),
            replies: HashMap::new(),
        }
    }
}

impl State {
    fn allocate_id(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn check_references(&self, draft: &TransactionDraft) -> RemoteResult<()> {
        for (kind, r) in draft.references() {
            let known = match r {
                EntityRef::Confirmed(id) => self
                    .references
                    .get(&kind)
                    .is_some_and(|entities| entities.contains_key(id)),
                EntityRef::Temp(_) => false,
            };
            if !known {
                return Err(RemoteError::Validation(format!("unknown {kind} '{r}'")));
            }
        }
        Ok(())
    }

    fn insert_transaction(&mut self, draft: &TransactionDraft) -> RemoteResult<Transaction> {
        draft.validate().map_err(RemoteError::Validation)?;
        self.check_references(draft)?;
        let id = self.allocate_id();
        let tx = Transaction::new(id, draft.clone());
        self.transactions.insert(id, tx.clone());
        Ok(tx)
    }

    fn name_taken(&self, kind: ReferenceKind, name: &str, except: Option<i64>) -> bool {
        self.references.get(&kind).is_some_and(|entities| {
            entities
                .iter()
                .any(|(id, e)| Some(*id) != except && e.same_name(name))
        })
    }
}

/// See the module documentation.
#[derive(Debug, Default)]
pub struct TestRemote {
    state: Mutex<State>,
}

impl TestRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulates the network going away (`false`) or coming back (`true`).
    pub fn set_reachable(&self, reachable: bool) {
        self.state().reachable = reachable;
    }

    /// The next call fails with `error`. Queued failures are consumed one per call.
    pub fn fail_next(&self, error: RemoteError) {
        self.state().failures.push_back(error);
    }

    pub fn fail_times(&self, n: usize, error: RemoteError) {
        let mut state = self.state();
        for _ in 0..n {
            state.failures.push_back(error.clone());
        }
    }

    /// Every call sleeps for `latency` before it is answered.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state().latency = latency;
    }

    /// The id the next created entity will receive.
    pub fn set_next_id(&self, id: i64) {
        self.state().next_id = id;
    }

    pub fn set_profile(&self, profile: UserProfile) {
        self.state().profile = profile;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    /// The recorded calls that would have changed server state.
    pub fn mutation_calls(&self) -> Vec<Call> {
        self.state()
            .calls
            .iter()
            .filter(|c| c.is_mutation())
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// All stored transactions in id order.
    pub fn transactions(&self) -> Vec<Transaction> {
        self.state().transactions.values().cloned().collect()
    }

    pub fn references(&self, kind: ReferenceKind) -> Vec<ReferenceEntity> {
        self.state()
            .references
            .get(&kind)
            .map(|entities| entities.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Stores a reference directly, bypassing the call log.
    pub fn seed_reference(&self, kind: ReferenceKind, name: &str) -> ReferenceEntity {
        let mut state = self.state();
        let id = state.allocate_id();
        let entity = ReferenceEntity::new(id, name);
        state
            .references
            .entry(kind)
            .or_default()
            .insert(id, entity.clone());
        entity
    }

    /// Stores a transaction directly, bypassing the call log and validation.
    pub fn seed_transaction(&self, draft: TransactionDraft) -> Transaction {
        let mut state = self.state();
        let id = state.allocate_id();
        let tx = Transaction::new(id, draft);
        state.transactions.insert(id, tx.clone());
        tx
    }

    /// Records `call` and decides whether it gets through, after the configured latency.
    async fn receive(&self, call: Call) -> RemoteResult<()> {
        let latency = {
            let mut state = self.state();
            state.calls.push(call);
            state.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state();
        if !state.reachable {
            return Err(RemoteError::Transient("network unreachable".to_string()));
        }
        match state.failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Answers a repeated idempotency key with the first reply, otherwise runs `apply`.
    fn idempotent<F>(&self, key: Uuid, apply: F) -> RemoteResult<Reply>
    where
        F: FnOnce(&mut State) -> RemoteResult<Reply>,
    {
        let mut state = self.state();
        if let Some(reply) = state.replies.get(&key) {
            return Ok(reply.clone());
        }
        let reply = apply(&mut *state)?;
        state.replies.insert(key, reply.clone());
        Ok(reply)
    }
}

fn unexpected(reply: Reply) -> RemoteError {
    RemoteError::Validation(format!("idempotency key reused for a different call: {reply:?}"))
}

#[async_trait::async_trait]
impl RemoteApi for TestRemote {
    async fn ping(&self) -> RemoteResult<()> {
        self.receive(Call::Ping).await
    }

    async fn current_user(&self) -> RemoteResult<UserProfile> {
        self.receive(Call::CurrentUser).await?;
        Ok(self.state().profile.clone())
    }

    async fn list_transactions(&self, params: &ListParams) -> RemoteResult<Page> {
        self.receive(Call::ListTransactions(params.clone())).await?;
        let state = self.state();
        let mut matching: Vec<&Transaction> = state
            .transactions
            .values()
            .filter(|tx| tx.matches(params))
            .collect();
        // Newest first, ties broken by id so that pages are stable.
        matching.sort_by(|a, b| b.fields.date.cmp(&a.fields.date).then(b.id.cmp(&a.id)));
        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(params.offset as usize)
            .take(params.limit as usize)
            .cloned()
            .collect();
        Ok(Page {
            items,
            total: Some(total),
        })
    }

    async fn create_transaction(
        &self,
        draft: &TransactionDraft,
        idempotency_key: Uuid,
    ) -> RemoteResult<Transaction> {
        self.receive(Call::CreateTransaction {
            key: idempotency_key,
            description: draft.description.clone(),
        })
        .await?;
        match self.idempotent(idempotency_key, |state| {
            state.insert_transaction(draft).map(Reply::Transaction)
        })? {
            Reply::Transaction(tx) => Ok(tx),
            other => Err(unexpected(other)),
        }
    }

    async fn update_transaction(
        &self,
        id: i64,
        patch: &TransactionPatch,
        idempotency_key: Uuid,
    ) -> RemoteResult<Transaction> {
        self.receive(Call::UpdateTransaction {
            id,
            key: idempotency_key,
        })
        .await?;
        let reply = self.idempotent(idempotency_key, |state| {
            let mut fields = state
                .transactions
                .get(&id)
                .map(|tx| tx.fields.clone())
                .ok_or_else(|| RemoteError::NotFound(format!("transaction {id}")))?;
            fields.apply(patch);
            fields.validate().map_err(RemoteError::Validation)?;
            state.check_references(&fields)?;
            let tx = Transaction::new(id, fields);
            state.transactions.insert(id, tx.clone());
            Ok(Reply::Transaction(tx))
        })?;
        match reply {
            Reply::Transaction(tx) => Ok(tx),
            other => Err(unexpected(other)),
        }
    }

    async fn delete_transaction(&self, id: i64, idempotency_key: Uuid) -> RemoteResult<()> {
        self.receive(Call::DeleteTransaction {
            id,
            key: idempotency_key,
        })
        .await?;
        self.idempotent(idempotency_key, |state| {
            state
                .transactions
                .remove(&id)
                .map(|_| Reply::Done)
                .ok_or_else(|| RemoteError::NotFound(format!("transaction {id}")))
        })?;
        Ok(())
    }

    async fn bulk_import(
        &self,
        drafts: &[TransactionDraft],
        idempotency_key: Uuid,
    ) -> RemoteResult<Vec<ImportItemResult>> {
        self.receive(Call::BulkImport {
            count: drafts.len(),
            key: idempotency_key,
        })
        .await?;
        let reply = self.idempotent(idempotency_key, |state| {
            let results = drafts
                .iter()
                .map(|draft| match state.insert_transaction(draft) {
                    Ok(transaction) => ImportItemResult::Created { transaction },
                    Err(e) => ImportItemResult::Failed {
                        error: e.to_string(),
                    },
                })
                .collect();
            Ok(Reply::Import(results))
        })?;
        match reply {
            Reply::Import(results) => Ok(results),
            other => Err(unexpected(other)),
        }
    }

    async fn list_references(&self, kind: ReferenceKind) -> RemoteResult<Vec<ReferenceEntity>> {
        self.receive(Call::ListReferences(kind)).await?;
        Ok(self.references(kind))
    }

    async fn create_reference(
        &self,
        kind: ReferenceKind,
        name: &str,
        idempotency_key: Uuid,
    ) -> RemoteResult<ReferenceEntity> {
        self.receive(Call::CreateReference {
            kind,
            name: name.to_string(),
            key: idempotency_key,
        })
        .await?;
        let reply = self.idempotent(idempotency_key, |state| {
            let name = name.trim();
            if name.is_empty() {
                return Err(RemoteError::Validation(format!("{kind} name is empty")));
            }
            if state.name_taken(kind, name, None) {
                return Err(RemoteError::Duplicate(format!("{kind} '{name}' exists")));
            }
            let id = state.allocate_id();
            let entity = ReferenceEntity::new(id, name);
            state
                .references
                .entry(kind)
                .or_default()
                .insert(id, entity.clone());
            Ok(Reply::Reference(entity))
        })?;
        match reply {
            Reply::Reference(entity) => Ok(entity),
            other => Err(unexpected(other)),
        }
    }

    async fn rename_reference(
        &self,
        kind: ReferenceKind,
        id: i64,
        name: &str,
        idempotency_key: Uuid,
    ) -> RemoteResult<ReferenceEntity> {
        self.receive(Call::RenameReference {
            kind,
            id,
            name: name.to_string(),
            key: idempotency_key,
        })
        .await?;
        let reply = self.idempotent(idempotency_key, |state| {
            if state.name_taken(kind, name, Some(id)) {
                return Err(RemoteError::Duplicate(format!("{kind} '{name}' exists")));
            }
            let entity = state
                .references
                .get_mut(&kind)
                .and_then(|entities| entities.get_mut(&id))
                .ok_or_else(|| RemoteError::NotFound(format!("{kind} {id}")))?;
            entity.name = name.trim().to_string();
            Ok(Reply::Reference(entity.clone()))
        })?;
        match reply {
            Reply::Reference(entity) => Ok(entity),
            other => Err(unexpected(other)),
        }
    }

    async fn delete_reference(
        &self,
        kind: ReferenceKind,
        id: i64,
        idempotency_key: Uuid,
    ) -> RemoteResult<()> {
        self.receive(Call::DeleteReference {
            kind,
            id,
            key: idempotency_key,
        })
        .await?;
        self.idempotent(idempotency_key, |state| {
            state
                .references
                .get_mut(&kind)
                .and_then(|entities| entities.remove(&id))
                .map(|_| Reply::Done)
                .ok_or_else(|| RemoteError::NotFound(format!("{kind} {id}")))
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Amount, TransactionType};
    use chrono::NaiveDate;
    use std::str::FromStr;

    fn income(description: &str, day: u32) -> TransactionDraft {
        TransactionDraft {
            amount: Amount::from_str("10").unwrap(),
            kind: TransactionType::Income,
            date: NaiveDate::from_ymd_opt(2025, 1, day).unwrap(),
            description: description.to_string(),
            category: None,
            source: None,
            target: None,
            recurrence: None,
        }
    }

    #[tokio::test]
    async fn test_idempotency_key_is_honored() {
        let remote = TestRemote::new();
        let key = Uuid::new_v4();
        let a = remote.create_transaction(&income("pay", 1), key).await.unwrap();
        let b = remote.create_transaction(&income("pay", 1), key).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(remote.transactions().len(), 1);
        assert_eq!(remote.mutation_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_and_injected_failures() {
        let remote = TestRemote::new();
        remote.set_reachable(false);
        assert!(remote.ping().await.unwrap_err().is_transient());
        remote.set_reachable(true);
        remote.fail_next(RemoteError::Conflict("stale".into()));
        assert!(matches!(
            remote.ping().await,
            Err(RemoteError::Conflict(_))
        ));
        remote.ping().await.unwrap();
        assert_eq!(remote.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_reference_names_are_unique_ignoring_case() {
        let remote = TestRemote::new();
        remote.seed_reference(ReferenceKind::Category, "Groceries");
        let err = remote
            .create_reference(ReferenceKind::Category, "groceries ", Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Duplicate(_)));
        remote
            .create_reference(ReferenceKind::Source, "Groceries", Uuid::new_v4())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_listing_pages_newest_first() {
        let remote = TestRemote::new();
        for day in 1..=5 {
            remote.seed_transaction(income(&format!("d{day}"), day));
        }
        let page = remote
            .list_transactions(&ListParams::page(2, 2))
            .await
            .unwrap();
        let names: Vec<_> = page.items.iter().map(|t| t.fields.description.as_str()).collect();
        assert_eq!(names, vec!["d3", "d2"]);
        assert_eq!(page.total, Some(5));
    }

    #[tokio::test]
    async fn test_create_rejects_unknown_reference() {
        let remote = TestRemote::new();
        let mut draft = income("x", 1);
        draft.kind = TransactionType::Expense;
        draft.category = Some(EntityRef::Confirmed(99));
        let err = remote
            .create_transaction(&draft, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Validation(_)));
    }

    #[tokio::test]
    async fn test_bulk_import_reports_per_item() {
        let remote = TestRemote::new();
        let mut bad = income("bad", 2);
        bad.amount = Amount::from_str("0").unwrap();
        let results = remote
            .bulk_import(&[income("good", 1), bad], Uuid::new_v4())
            .await
            .unwrap();
        assert!(matches!(results[0], ImportItemResult::Created { .. }));
        assert!(matches!(results[1], ImportItemResult::Failed { .. }));
        assert_eq!(remote.transactions().len(), 1);
    }
}
