//! A small stateful in-memory [`RemoteClient`], used by the integration
//! tests that need a full upload -> import -> visible round trip rather
//! than a single mocked call. Complements `MockRemoteClient` (used for
//! isolated unit tests in `shelfsync_core::fsm`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use shelfsync_core::error::{CoreError, Result};
use shelfsync_core::remote::{DocumentRef, DocumentStatus, OperationHandle, RemoteClient};

#[derive(Debug, Default)]
struct State {
    raw_artifacts: HashMap<String, (Vec<u8>, String)>,
    documents: HashMap<String, HashMap<String, String>>,
    deleted_raw: Vec<String>,
    deleted_docs: Vec<(String, String)>,
}

/// An in-memory fake backend. `upload_raw` assigns sequential raw ids,
/// `import_into_store` completes synchronously, and `get_document` /
/// `list_store_documents` reflect whatever has been imported.
#[derive(Debug)]
pub struct FakeRemoteClient {
    state: Mutex<State>,
    next_id: AtomicU64,
    /// Call indices (1-based) on which `upload_raw` should fail transient.
    pub fail_uploads_on: Mutex<Vec<u64>>,
    upload_calls: AtomicU64,
}

impl Default for FakeRemoteClient {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRemoteClient {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            next_id: AtomicU64::new(1),
            fail_uploads_on: Mutex::new(Vec::new()),
            upload_calls: AtomicU64::new(0),
        }
    }

    pub fn live_document_count(&self, store: &str) -> usize {
        self.state.lock().unwrap().documents.get(store).map(|d| d.len()).unwrap_or(0)
    }

    pub fn raw_artifact_count(&self) -> usize {
        self.state.lock().unwrap().raw_artifacts.len()
    }

    pub fn deleted_raw_ids(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted_raw.clone()
    }
}

#[async_trait]
impl RemoteClient for FakeRemoteClient {
    async fn upload_raw(&self, bytes: Vec<u8>, display_name: &str) -> Result<String> {
        let call = self.upload_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_uploads_on.lock().unwrap().contains(&call) {
            return Err(CoreError::RemoteTransient {
                status: 429,
                body: "rate limited".into(),
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let raw_id = format!("raw{id:08}ab");
        self.state
            .lock()
            .unwrap()
            .raw_artifacts
            .insert(raw_id.clone(), (bytes, display_name.trim_start().to_string()));
        Ok(raw_id)
    }

    async fn import_into_store(&self, raw_id: &str, store: &str) -> Result<OperationHandle> {
        let (raw_prefix, display_name) = {
            let state = self.state.lock().unwrap();
            let (_, name) = state
                .raw_artifacts
                .get(raw_id)
                .cloned()
                .ok_or_else(|| CoreError::Internal(format!("no such raw artifact {raw_id}")))?;
            (raw_id[..12].to_string(), name)
        };
        let doc_id = format!("{raw_prefix}-doc{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.state
            .lock()
            .unwrap()
            .documents
            .entry(store.to_string())
            .or_default()
            .insert(doc_id.clone(), display_name);
        Ok(OperationHandle(format!("op-{doc_id}")))
    }

    async fn await_operation(&self, op: &OperationHandle, _timeout: Duration) -> Result<String> {
        Ok(op.0.strip_prefix("op-").unwrap_or(&op.0).to_string())
    }

    async fn get_document(&self, store: &str, doc_id: &str) -> Result<DocumentStatus> {
        let state = self.state.lock().unwrap();
        if state.documents.get(store).is_some_and(|d| d.contains_key(doc_id)) {
            Ok(DocumentStatus::Present)
        } else {
            Ok(DocumentStatus::NotFound)
        }
    }

    async fn list_store_documents(&self, store: &str) -> Result<Vec<DocumentRef>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .documents
            .get(store)
            .map(|docs| {
                docs.iter()
                    .map(|(id, name)| DocumentRef {
                        doc_id: id.clone(),
                        display_name: name.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_document(&self, store: &str, doc_name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(docs) = state.documents.get_mut(store) {
            docs.retain(|id, _| !id.starts_with(doc_name));
        }
        state.deleted_docs.push((store.to_string(), doc_name.to_string()));
        Ok(())
    }

    async fn delete_raw(&self, raw_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.raw_artifacts.remove(raw_id);
        state.deleted_raw.push(raw_id.to_string());
        Ok(())
    }

    async fn resolve_store(&self, name_or_resource: &str) -> Result<String> {
        if name_or_resource.starts_with("stores/") {
            Ok(name_or_resource.to_string())
        } else {
            Ok(format!("stores/{name_or_resource}"))
        }
    }
}
