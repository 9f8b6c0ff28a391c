//! HTTP implementation of [`NoteStore`].
//!
//! One shared `reqwest::Client` per replica, wrapped in an explicit
//! interceptor chain. Interceptors see every outgoing request builder in
//! order; there is no global patching of the HTTP stack.

use crate::error::SyncError;
use crate::store::{DirEntry, NoteStore, Notebook};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Hook applied to every outgoing request, in registration order.
pub trait Interceptor: Send + Sync {
    fn apply(&self, req: RequestBuilder) -> RequestBuilder;
}

/// Attaches the replica's bearer credential.
pub struct AuthInterceptor {
    token: String,
}

impl AuthInterceptor {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl Interceptor for AuthInterceptor {
    fn apply(&self, req: RequestBuilder) -> RequestBuilder {
        req.bearer_auth(&self.token)
    }
}

/// Emits one debug line per outgoing request.
pub struct TraceInterceptor {
    replica: String,
}

impl TraceInterceptor {
    pub fn new(replica: impl Into<String>) -> Self {
        Self {
            replica: replica.into(),
        }
    }
}

impl Interceptor for TraceInterceptor {
    fn apply(&self, req: RequestBuilder) -> RequestBuilder {
        if let Some(cloned) = req.try_clone() {
            if let Ok(built) = cloned.build() {
                debug!("[{}] {} {}", self.replica, built.method(), built.url());
            }
        }
        req
    }
}

/// [`NoteStore`] backed by the host's note-storage HTTP API.
pub struct HttpNoteStore {
    client: Client,
    base: String,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

#[derive(Deserialize)]
struct ListResponse {
    entries: Vec<DirEntry>,
}

#[derive(Deserialize)]
struct CreateDocumentResponse {
    id: String,
}

#[derive(Deserialize)]
struct NotebooksResponse {
    notebooks: Vec<Notebook>,
}

#[derive(Deserialize)]
struct UnusedAssetsResponse {
    paths: Vec<String>,
}

impl HttpNoteStore {
    /// Build a store for `base` with the default interceptor chain
    /// (credential + request tracing).
    pub fn new(base: impl Into<String>, token: impl Into<String>, replica_name: &str) -> Self {
        let mut store = Self::bare(base);
        store.push_interceptor(Arc::new(AuthInterceptor::new(token)));
        store.push_interceptor(Arc::new(TraceInterceptor::new(replica_name)));
        store
    }

    /// Build a store with an empty interceptor chain.
    pub fn bare(base: impl Into<String>) -> Self {
        let base = base.into();
        Self {
            client: Client::new(),
            base: base.trim_end_matches('/').to_string(),
            interceptors: Vec::new(),
        }
    }

    pub fn push_interceptor(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.push(interceptor);
    }

    fn url(&self, route: &str, path: &str) -> String {
        format!("{}/{}/{}", self.base, route, urlencoding::encode(path))
    }

    fn intercept(&self, req: RequestBuilder) -> RequestBuilder {
        self.interceptors
            .iter()
            .fold(req, |req, interceptor| interceptor.apply(req))
    }

    async fn send(&self, req: RequestBuilder) -> Result<reqwest::Response, SyncError> {
        Ok(self.intercept(req).send().await?)
    }

    /// Send a request where any non-success status is an API error.
    async fn send_expect_ok(
        &self,
        req: RequestBuilder,
        what: &str,
    ) -> Result<reqwest::Response, SyncError> {
        let resp = self.send(req).await?;
        if !resp.status().is_success() {
            return Err(SyncError::Api(format!("{}: HTTP {}", what, resp.status())));
        }
        Ok(resp)
    }

    /// The search index is updated alongside every blob mutation. Index
    /// drift is recoverable by the host, so failures here only warn.
    async fn update_index(&self, verb: &str, path: &str) {
        let url = format!("{}/index/{}", self.base, verb);
        let req = self.client.post(&url).json(&serde_json::json!({ "path": path }));
        match self.send(req).await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => warn!("index {} for {} failed: HTTP {}", verb, path, resp.status()),
            Err(e) => warn!("index {} for {} failed: {}", verb, path, e),
        }
    }
}

#[async_trait]
impl NoteStore for HttpNoteStore {
    async fn list_directory(&self, path: &str) -> Result<Option<Vec<DirEntry>>, SyncError> {
        let req = self.client.get(self.url("fs/list", path));
        let resp = self.send(req).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body: ListResponse = resp.json().await?;
                Ok(Some(body.entries))
            }
            status => Err(SyncError::Api(format!("list {}: HTTP {}", path, status))),
        }
    }

    async fn get_blob(&self, path: &str) -> Result<Option<Vec<u8>>, SyncError> {
        let req = self.client.get(self.url("fs/blob", path));
        let resp = self.send(req).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(resp.bytes().await?.to_vec())),
            status => Err(SyncError::Api(format!("get {}: HTTP {}", path, status))),
        }
    }

    async fn put_blob(
        &self,
        path: &str,
        bytes: Vec<u8>,
        modified_at_ms: u64,
    ) -> Result<(), SyncError> {
        let url = format!("{}?modified={}", self.url("fs/blob", path), modified_at_ms);
        let req = self.client.put(&url).body(bytes);
        self.send_expect_ok(req, &format!("put {}", path)).await?;
        self.update_index("upsert", path).await;
        Ok(())
    }

    async fn delete_file(&self, path: &str) -> Result<(), SyncError> {
        let req = self.client.delete(self.url("fs/blob", path));
        let resp = self.send(req).await?;
        // Absent is fine: the goal state is "gone".
        if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
            return Err(SyncError::Api(format!(
                "delete {}: HTTP {}",
                path,
                resp.status()
            )));
        }
        self.update_index("remove", path).await;
        Ok(())
    }

    async fn create_document(
        &self,
        notebook_id: &str,
        path: &str,
        initial_content: &str,
    ) -> Result<String, SyncError> {
        let url = format!("{}/docs", self.base);
        let req = self.client.post(&url).json(&serde_json::json!({
            "notebook_id": notebook_id,
            "path": path,
            "content": initial_content,
        }));
        let resp = self
            .send_expect_ok(req, &format!("create document {}", path))
            .await?;
        let body: CreateDocumentResponse = resp.json().await?;
        Ok(body.id)
    }

    async fn rename_document(&self, document_id: &str, new_title: &str) -> Result<(), SyncError> {
        let url = format!(
            "{}/docs/{}/rename",
            self.base,
            urlencoding::encode(document_id)
        );
        let req = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "title": new_title }));
        self.send_expect_ok(req, &format!("rename document {}", document_id))
            .await?;
        Ok(())
    }

    async fn list_notebooks(&self) -> Result<Vec<Notebook>, SyncError> {
        let req = self.client.get(format!("{}/notebooks", self.base));
        let resp = self.send_expect_ok(req, "list notebooks").await?;
        let body: NotebooksResponse = resp.json().await?;
        Ok(body.notebooks)
    }

    async fn list_unused_assets(&self) -> Result<Vec<String>, SyncError> {
        let req = self.client.get(format!("{}/assets/unused", self.base));
        let resp = self.send_expect_ok(req, "list unused assets").await?;
        let body: UnusedAssetsResponse = resp.json().await?;
        Ok(body.paths)
    }

    async fn refresh_file_tree(&self) -> Result<(), SyncError> {
        let req = self.client.post(format!("{}/ui/refresh-tree", self.base));
        self.send_expect_ok(req, "refresh file tree").await?;
        Ok(())
    }

    async fn reload_open_document(&self, path: &str) -> Result<(), SyncError> {
        let req = self
            .client
            .post(format!("{}/ui/reload-doc", self.base))
            .json(&serde_json::json!({ "path": path }));
        self.send_expect_ok(req, &format!("reload document {}", path))
            .await?;
        Ok(())
    }

    async fn reload_workspace(&self) -> Result<(), SyncError> {
        let req = self.client.post(format!("{}/ui/reload", self.base));
        self.send_expect_ok(req, "reload workspace").await?;
        Ok(())
    }

    async fn create_snapshot(&self, reason: &str) -> Result<(), SyncError> {
        let req = self
            .client
            .post(format!("{}/repo/snapshot", self.base))
            .json(&serde_json::json!({ "reason": reason }));
        self.send_expect_ok(req, "create snapshot").await?;
        Ok(())
    }
}
