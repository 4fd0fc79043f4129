//! The remote API collaborator.
//!
//! The engine only depends on the `RemoteApi` trait. `HttpRemote` talks to the real server with
//! `reqwest`; `TestRemote` keeps everything in memory so that the whole engine (and the CLI) can
//! run without a server.

mod http;
mod test_remote;

use crate::model::{
    ListParams, ReferenceEntity, ReferenceKind, Transaction, TransactionDraft, TransactionPatch,
    UserProfile,
};
use crate::{Config, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub use http::HttpRemote;
pub use test_remote::{Call, TestRemote};

/// When this environment variable is set and non-empty, the CLI uses `TestRemote`.
pub const TEST_MODE_ENV: &str = "FINTRACK_IN_TEST_MODE";

/// Failures reported by the remote API, classified by what the engine should do about them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// The request did not reach the server or the server could not answer. Retry later.
    #[error("network failure: {0}")]
    Transient(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// The server will always reject this request.
    #[error("rejected: {0}")]
    Validation(String),
    /// The entity changed on the server since it was edited locally.
    #[error("conflict: {0}")]
    Conflict(String),
    /// An entity with the same unique name already exists.
    #[error("duplicate: {0}")]
    Duplicate(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

impl RemoteError {
    /// Whether the failure says nothing about the request itself and may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_) | RemoteError::Timeout(_))
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// One page of a transaction listing as returned by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Page {
    pub items: Vec<Transaction>,
    #[serde(default)]
    pub total: Option<u64>,
}

/// The outcome of one record of a bulk import, in request order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ImportItemResult {
    Created { transaction: Transaction },
    Failed { error: String },
}

/// The remote API contract the engine consumes. Every mutating call carries an idempotency key
/// that stays the same across retries of the same queued operation.
#[async_trait::async_trait]
pub trait RemoteApi: Send + Sync {
    /// Cheap reachability probe.
    async fn ping(&self) -> RemoteResult<()>;

    async fn current_user(&self) -> RemoteResult<UserProfile>;

    async fn list_transactions(&self, params: &ListParams) -> RemoteResult<Page>;

    async fn create_transaction(
        &self,
        draft: &TransactionDraft,
        idempotency_key: Uuid,
    ) -> RemoteResult<Transaction>;

    async fn update_transaction(
        &self,
        id: i64,
        patch: &TransactionPatch,
        idempotency_key: Uuid,
    ) -> RemoteResult<Transaction>;

    async fn delete_transaction(&self, id: i64, idempotency_key: Uuid) -> RemoteResult<()>;

    /// Accepts normalized records and reports success or failure per record.
    async fn bulk_import(
        &self,
        drafts: &[TransactionDraft],
        idempotency_key: Uuid,
    ) -> RemoteResult<Vec<ImportItemResult>>;

    async fn list_references(&self, kind: ReferenceKind) -> RemoteResult<Vec<ReferenceEntity>>;

    async fn create_reference(
        &self,
        kind: ReferenceKind,
        name: &str,
        idempotency_key: Uuid,
    ) -> RemoteResult<ReferenceEntity>;

    async fn rename_reference(
        &self,
        kind: ReferenceKind,
        id: i64,
        name: &str,
        idempotency_key: Uuid,
    ) -> RemoteResult<ReferenceEntity>;

    async fn delete_reference(
        &self,
        kind: ReferenceKind,
        id: i64,
        idempotency_key: Uuid,
    ) -> RemoteResult<()>;
}

/// Selects the remote implementation used by the CLI.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Http,
    Test,
}

serde_plain::derive_display_from_serialize!(Mode);
serde_plain::derive_fromstr_from_deserialize!(Mode);

impl Mode {
    pub fn from_env() -> Self {
        match std::env::var(TEST_MODE_ENV) {
            Ok(value) if !value.is_empty() => Mode::Test,
            _ => Mode::Http,
        }
    }
}

/// Builds the remote for `mode`.
pub async fn remote(config: &Config, mode: Mode) -> Result<Arc<dyn RemoteApi>> {
    Ok(match mode {
        Mode::Http => Arc::new(HttpRemote::new(config.api_url(), config.api_token().await?)?),
        Mode::Test => Arc::new(TestRemote::default()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(RemoteError::Transient("reset".into()).is_transient());
        assert!(RemoteError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!RemoteError::Validation("bad".into()).is_transient());
        assert!(!RemoteError::Conflict("stale".into()).is_transient());
        assert!(!RemoteError::NotFound("gone".into()).is_transient());
    }

    #[test]
    fn import_result_shape() {
        let json = r#"[{"status":"failed","error":"amount must be positive"}]"#;
        let parsed: Vec<ImportItemResult> = serde_json::from_str(json).unwrap();
        assert_eq!(
            parsed,
            vec![ImportItemResult::Failed {
                error: "amount must be positive".to_string()
            }]
        );
    }
}
