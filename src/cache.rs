//! Read-through cache for reference collections and transaction pages.
//!
//! Entries are grouped in namespaces (`transactions`, `categories`, `sources`, `targets`), each
//! bounded to a number of entries with least-recently-used eviction. Transactions created while
//! offline live in a separate local overlay until their create is delivered. After that the
//! transaction pages are dropped and fetched again.

use crate::model::{EntityRef, ReferenceEntity, ReferenceKind, TempId, Transaction};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::trace;

const TRANSACTIONS: &str = "transactions";

/// Where the data of a cache entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFlag {
    Server,
    Local,
    /// Server data with local, unconfirmed items mixed in. Never authoritative for offsets.
    Mixed,
}

serde_plain::derive_display_from_serialize!(SourceFlag);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub namespace: String,
    pub key: String,
}

impl CacheKey {
    pub fn new(namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            key: key.into(),
        }
    }

    pub fn references(kind: ReferenceKind) -> Self {
        Self::new(kind.collection(), "all")
    }

    pub fn transactions(params: &crate::model::ListParams) -> Self {
        Self::new(TRANSACTIONS, params.cache_key())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "data")]
pub enum CachePayload {
    /// One server page of a transaction listing, exactly as the server returned it.
    Transactions {
        items: Vec<Transaction>,
        total: Option<u64>,
    },
    References(Vec<ReferenceEntity>),
}

impl CachePayload {
    fn mentions(&self, tmp: &TempId) -> bool {
        match self {
            CachePayload::Transactions { items, .. } => items.iter().any(|tx| tx.mentions(tmp)),
            CachePayload::References(entities) => {
                entities.iter().any(|e| e.id.temp() == Some(tmp))
            }
        }
    }

    fn has_temp(&self) -> bool {
        match self {
            CachePayload::Transactions { items, .. } => items.iter().any(|tx| {
                tx.id.is_temp() || tx.fields.references().any(|(_, r)| r.is_temp())
            }),
            CachePayload::References(entities) => entities.iter().any(|e| e.id.is_temp()),
        }
    }

    fn resolve(&mut self, tmp: &TempId, server_id: i64) -> bool {
        match self {
            CachePayload::Transactions { items, .. } => items
                .iter_mut()
                .fold(false, |changed, tx| tx.resolve(tmp, server_id) | changed),
            CachePayload::References(entities) => entities
                .iter_mut()
                .fold(false, |changed, e| e.id.resolve(tmp, server_id) | changed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub payload: CachePayload,
    pub retrieved_at: DateTime<Utc>,
    pub source: SourceFlag,
    /// Changes on every write. Used to detect that an entry moved on while a fetch was running.
    pub generation: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Namespace {
    slots: BTreeMap<String, Slot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Slot {
    entry: CacheEntry,
    used: u64,
}

/// The serializable content of a [`ReferenceCache`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheSnapshot {
    entries: Vec<(CacheKey, CacheEntry)>,
    local: Vec<Transaction>,
}

#[derive(Debug, Clone)]
pub struct ReferenceCache {
    per_namespace: usize,
    namespaces: BTreeMap<String, Namespace>,
    local: Vec<Transaction>,
    clock: u64,
}

impl ReferenceCache {
    pub fn new(per_namespace: usize) -> Self {
        Self {
            per_namespace: per_namespace.max(1),
            namespaces: BTreeMap::new(),
            local: Vec::new(),
            clock: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Returns the entry under `key` and marks it as recently used.
    pub fn get(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let now = self.tick();
        let slot = self
            .namespaces
            .get_mut(&key.namespace)?
            .slots
            .get_mut(&key.key)?;
        slot.used = now;
        Some(slot.entry.clone())
    }

    /// Returns the entry without touching its recency.
    pub fn peek(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.namespaces
            .get(&key.namespace)?
            .slots
            .get(&key.key)
            .map(|slot| &slot.entry)
    }

    pub fn generation(&self, key: &CacheKey) -> Option<u64> {
        self.peek(key).map(|entry| entry.generation)
    }

    /// Stores `payload` under `key` and returns the generation of the new entry.
    pub fn put(&mut self, key: CacheKey, payload: CachePayload, source: SourceFlag) -> u64 {
        let generation = self.tick();
        let entry = CacheEntry {
            payload,
            retrieved_at: Utc::now(),
            source,
            generation,
        };
        self.store(key, entry);
        generation
    }

    /// Stores `payload` only if the generation under `key` is still `expected` (`None` meaning
    /// there was no entry). Returns whether the write happened.
    pub fn put_if_unchanged(
        &mut self,
        key: CacheKey,
        expected: Option<u64>,
        payload: CachePayload,
        source: SourceFlag,
    ) -> bool {
        if self.generation(&key) != expected {
            trace!("Skipping stale write to {}/{}", key.namespace, key.key);
            return false;
        }
        self.put(key, payload, source);
        true
    }

    fn store(&mut self, key: CacheKey, entry: CacheEntry) {
        let limit = self.per_namespace;
        let used = entry.generation;
        let namespace = self.namespaces.entry(key.namespace.clone()).or_default();
        if !namespace.slots.contains_key(&key.key) && namespace.slots.len() >= limit {
            let oldest = namespace
                .slots
                .iter()
                .min_by_key(|(_, slot)| slot.used)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                trace!("Evicting {}/{oldest}", key.namespace);
                namespace.slots.remove(&oldest);
            }
        }
        namespace.slots.insert(key.key, Slot { entry, used });
    }

    pub fn invalidate(&mut self, key: &CacheKey) -> bool {
        self.namespaces
            .get_mut(&key.namespace)
            .and_then(|namespace| namespace.slots.remove(&key.key))
            .is_some()
    }

    pub fn invalidate_namespace(&mut self, namespace: &str) {
        self.namespaces.remove(namespace);
    }

    pub fn namespace_len(&self, namespace: &str) -> usize {
        self.namespaces
            .get(namespace)
            .map(|n| n.slots.len())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.namespaces.values().map(|n| n.slots.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0 && self.local.is_empty()
    }

    /// Runs `f` on every stored payload and bumps the generation of the entries it changed.
    fn rewrite<F>(&mut self, mut f: F) -> usize
    where
        F: FnMut(&mut CacheEntry) -> bool,
    {
        let mut changed = 0;
        let mut clock = self.clock;
        for namespace in self.namespaces.values_mut() {
            for slot in namespace.slots.values_mut() {
                if f(&mut slot.entry) {
                    clock += 1;
                    slot.entry.generation = clock;
                    changed += 1;
                }
            }
        }
        self.clock = clock;
        changed
    }

    // Local overlay.

    /// Transactions that exist only locally, oldest first.
    pub fn local(&self) -> &[Transaction] {
        &self.local
    }

    pub fn push_local(&mut self, tx: Transaction) {
        self.local.retain(|existing| existing.id != tx.id);
        self.local.push(tx);
    }

    pub fn local_mut(&mut self, id: &EntityRef) -> Option<&mut Transaction> {
        self.local.iter_mut().find(|tx| &tx.id == id)
    }

    pub fn remove_local(&mut self, id: &EntityRef) -> Option<Transaction> {
        let index = self.local.iter().position(|tx| &tx.id == id)?;
        Some(self.local.remove(index))
    }

    /// Drops every cached transaction page along with overlay items that already carry a server
    /// id. The next listing is fetched from the server, which decides the page a confirmed
    /// transaction lands on.
    pub fn forget_transactions(&mut self) {
        self.local.retain(|tx| tx.id.is_temp());
        self.invalidate_namespace(TRANSACTIONS);
    }

    // Transactions inside cached pages.

    /// The freshest cached copy of a transaction: the overlay first, then cached pages.
    pub fn find_transaction(&self, id: &EntityRef) -> Option<&Transaction> {
        if let Some(tx) = self.local.iter().find(|tx| &tx.id == id) {
            return Some(tx);
        }
        self.namespaces
            .get(TRANSACTIONS)?
            .slots
            .values()
            .filter_map(|slot| match &slot.entry.payload {
                CachePayload::Transactions { items, .. } => Some(items),
                CachePayload::References(_) => None,
            })
            .flatten()
            .find(|tx| &tx.id == id)
    }

    /// Replaces the cached copies of `tx` with the given version.
    pub fn update_transaction(&mut self, tx: &Transaction) -> usize {
        if let Some(local) = self.local_mut(&tx.id) {
            *local = tx.clone();
        }
        self.rewrite(|entry| match &mut entry.payload {
            CachePayload::Transactions { items, .. } => {
                let mut hit = false;
                for item in items.iter_mut().filter(|item| item.id == tx.id) {
                    *item = tx.clone();
                    hit = true;
                }
                hit
            }
            CachePayload::References(_) => false,
        })
    }

    /// Removes every cached copy of the transaction `id`.
    pub fn remove_transaction(&mut self, id: &EntityRef) -> usize {
        self.remove_local(id);
        self.rewrite(|entry| match &mut entry.payload {
            CachePayload::Transactions { items, .. } => {
                let before = items.len();
                items.retain(|item| &item.id != id);
                before != items.len()
            }
            CachePayload::References(_) => false,
        })
    }

    // Reference collections.

    /// The cached list for `kind`, if any.
    pub fn references(&self, kind: ReferenceKind) -> Option<&[ReferenceEntity]> {
        match &self.peek(&CacheKey::references(kind))?.payload {
            CachePayload::References(entities) => Some(entities),
            CachePayload::Transactions { .. } => None,
        }
    }

    /// Adds or replaces `entity` in the cached list for `kind`.
    pub fn upsert_reference(&mut self, kind: ReferenceKind, entity: ReferenceEntity) {
        let key = CacheKey::references(kind);
        let (mut entities, source) = match self.peek(&key) {
            Some(CacheEntry {
                payload: CachePayload::References(entities),
                source,
                ..
            }) => (entities.clone(), *source),
            _ => (Vec::new(), SourceFlag::Local),
        };
        // Identity resolution can leave two entries with the same id when a queued create turned
        // out to be a duplicate of an existing entity. Keep the first.
        let mut seen = false;
        entities.retain_mut(|e| {
            if e.id != entity.id {
                return true;
            }
            if seen {
                return false;
            }
            *e = entity.clone();
            seen = true;
            true
        });
        if !seen {
            entities.push(entity);
        }
        let source = match source {
            SourceFlag::Server if entities.iter().any(|e| e.id.is_temp()) => SourceFlag::Mixed,
            other => other,
        };
        self.put(key, CachePayload::References(entities), source);
    }

    pub fn remove_reference(&mut self, kind: ReferenceKind, id: &EntityRef) -> bool {
        let key = CacheKey::references(kind);
        let Some(CacheEntry {
            payload: CachePayload::References(entities),
            source,
            ..
        }) = self.peek(&key)
        else {
            return false;
        };
        let source = *source;
        let before = entities.len();
        let entities: Vec<_> = entities.iter().filter(|e| &e.id != id).cloned().collect();
        if entities.len() == before {
            return false;
        }
        self.put(key, CachePayload::References(entities), source);
        true
    }

    // Identity resolution.

    /// Rewrites every occurrence of `tmp` to `server_id`. Returns the number of entries and
    /// overlay items that changed.
    pub fn resolve_identity(&mut self, tmp: &TempId, server_id: i64) -> usize {
        let mut changed = self
            .local
            .iter_mut()
            .fold(0, |n, tx| n + usize::from(tx.resolve(tmp, server_id)));
        changed += self.rewrite(|entry| {
            if !entry.payload.resolve(tmp, server_id) {
                return false;
            }
            if entry.source == SourceFlag::Mixed && !entry.payload.has_temp() {
                entry.source = SourceFlag::Server;
            }
            true
        });
        changed
    }

    /// Whether any entry or overlay item still mentions `tmp`.
    pub fn references_temp(&self, tmp: &TempId) -> bool {
        self.local.iter().any(|tx| tx.mentions(tmp))
            || self
                .namespaces
                .values()
                .flat_map(|n| n.slots.values())
                .any(|slot| slot.entry.payload.mentions(tmp))
    }

    // Persistence between processes.

    pub fn snapshot(&self) -> CacheSnapshot {
        let entries = self
            .namespaces
            .iter()
            .flat_map(|(namespace, n)| {
                n.slots
                    .iter()
                    .map(move |(key, slot)| (CacheKey::new(namespace, key), slot.entry.clone()))
            })
            .collect();
        CacheSnapshot {
            entries,
            local: self.local.clone(),
        }
    }

    /// Replaces the content of the cache with `snapshot`.
    pub fn restore(&mut self, snapshot: CacheSnapshot) {
        self.namespaces.clear();
        let mut entries = snapshot.entries;
        entries.sort_by_key(|(_, entry)| entry.generation);
        for (key, entry) in entries {
            self.clock = self.clock.max(entry.generation);
            self.store(key, entry);
        }
        self.local = snapshot.local;
        self.local.retain(|tx| tx.id.is_temp());
    }
}
