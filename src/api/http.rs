//! Implements the `RemoteApi` trait over HTTP with `reqwest`.

use crate::api::{ImportItemResult, Page, RemoteApi, RemoteError, RemoteResult};
use crate::model::{
    ListParams, ReferenceEntity, ReferenceKind, Transaction, TransactionDraft, TransactionPatch,
    UserProfile,
};
use crate::Result;
use anyhow::Context;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::trace;
use url::Url;
use uuid::Uuid;

const IDEMPOTENCY_KEY: &str = "Idempotency-Key";

/// Talks to the finance API at `base`. Requests carry a bearer token when one is configured.
pub struct HttpRemote {
    base: Url,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpRemote {
    pub fn new(api_url: &str, token: Option<String>) -> Result<Self> {
        let mut base =
            Url::parse(api_url).with_context(|| format!("Invalid API URL '{api_url}'"))?;
        // Url::join replaces the last path segment unless the base ends with a slash.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            base,
            token,
            client: reqwest::Client::new(),
        })
    }

    fn url(&self, path: &str) -> RemoteResult<Url> {
        self.base
            .join(path)
            .map_err(|e| RemoteError::Validation(format!("bad endpoint '{path}': {e}")))
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> RemoteResult<Response> {
        let response = self
            .authorized(builder)
            .send()
            .await
            .map_err(|e| RemoteError::Transient(e.to_string()))?;
        let status = response.status();
        trace!("{} {}", status, response.url());
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to read response body".to_string());
        Err(classify(status, body))
    }

    async fn json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> RemoteResult<T> {
        self.send(builder)
            .await?
            .json::<T>()
            .await
            .map_err(|e| RemoteError::Transient(format!("unreadable response: {e}")))
    }
}

/// Maps an unsuccessful HTTP status onto the engine's error taxonomy.
fn classify(status: StatusCode, body: String) -> RemoteError {
    match status.as_u16() {
        401 | 403 => RemoteError::Unauthorized(body),
        404 | 410 => RemoteError::NotFound(body),
        409 if body.to_lowercase().contains("duplicate") => RemoteError::Duplicate(body),
        409 | 412 => RemoteError::Conflict(body),
        408 | 425 | 429 => RemoteError::Transient(format!("{status}: {body}")),
        500..=599 => RemoteError::Transient(format!("{status}: {body}")),
        _ => RemoteError::Validation(format!("{status}: {body}")),
    }
}

#[async_trait::async_trait]
impl RemoteApi for HttpRemote {
    async fn ping(&self) -> RemoteResult<()> {
        self.send(self.client.get(self.url("health")?)).await?;
        Ok(())
    }

    async fn current_user(&self) -> RemoteResult<UserProfile> {
        self.json(self.client.get(self.url("me")?)).await
    }

    async fn list_transactions(&self, params: &ListParams) -> RemoteResult<Page> {
        let mut query = vec![
            ("limit", params.limit.to_string()),
            ("offset", params.offset.to_string()),
        ];
        if !params.search.is_empty() {
            query.push(("search", params.search.clone()));
        }
        if let Some(kind) = params.kind {
            query.push(("type", kind.to_string()));
        }
        self.json(self.client.get(self.url("transactions")?).query(&query))
            .await
    }

    async fn create_transaction(
        &self,
        draft: &TransactionDraft,
        idempotency_key: Uuid,
    ) -> RemoteResult<Transaction> {
        let request = self
            .client
            .post(self.url("transactions")?)
            .header(IDEMPOTENCY_KEY, idempotency_key.to_string())
            .json(draft);
        self.json(request).await
    }

    async fn update_transaction(
        &self,
        id: i64,
        patch: &TransactionPatch,
        idempotency_key: Uuid,
    ) -> RemoteResult<Transaction> {
        let request = self
            .client
            .patch(self.url(&format!("transactions/{id}"))?)
            .header(IDEMPOTENCY_KEY, idempotency_key.to_string())
            .json(patch);
        self.json(request).await
    }

    async fn delete_transaction(&self, id: i64, idempotency_key: Uuid) -> RemoteResult<()> {
        let request = self
            .client
            .delete(self.url(&format!("transactions/{id}"))?)
            .header(IDEMPOTENCY_KEY, idempotency_key.to_string());
        self.send(request).await?;
        Ok(())
    }

    async fn bulk_import(
        &self,
        drafts: &[TransactionDraft],
        idempotency_key: Uuid,
    ) -> RemoteResult<Vec<ImportItemResult>> {
        let request = self
            .client
            .post(self.url("transactions/import")?)
            .header(IDEMPOTENCY_KEY, idempotency_key.to_string())
            .json(&serde_json::json!({ "records": drafts }));
        self.json(request).await
    }

    async fn list_references(&self, kind: ReferenceKind) -> RemoteResult<Vec<ReferenceEntity>> {
        self.json(self.client.get(self.url(kind.collection())?))
            .await
    }

    async fn create_reference(
        &self,
        kind: ReferenceKind,
        name: &str,
        idempotency_key: Uuid,
    ) -> RemoteResult<ReferenceEntity> {
        let request = self
            .client
            .post(self.url(kind.collection())?)
            .header(IDEMPOTENCY_KEY, idempotency_key.to_string())
            .json(&serde_json::json!({ "name": name }));
        self.json(request).await
    }

    async fn rename_reference(
        &self,
        kind: ReferenceKind,
        id: i64,
        name: &str,
        idempotency_key: Uuid,
    ) -> RemoteResult<ReferenceEntity> {
        let request = self
            .client
            .patch(self.url(&format!("{}/{id}", kind.collection()))?)
            .header(IDEMPOTENCY_KEY, idempotency_key.to_string())
            .json(&serde_json::json!({ "name": name }));
        self.json(request).await
    }

    async fn delete_reference(
        &self,
        kind: ReferenceKind,
        id: i64,
        idempotency_key: Uuid,
    ) -> RemoteResult<()> {
        let request = self
            .client
            .delete(self.url(&format!("{}/{id}", kind.collection()))?)
            .header(IDEMPOTENCY_KEY, idempotency_key.to_string());
        self.send(request).await?;
        Ok(())
    }
}
