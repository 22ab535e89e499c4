//! A [`FileScanner`] fixture backed by an in-memory map, so reconciler
//! tests don't need a real filesystem.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use shelfsync_core::error::{CoreError, Result};
use shelfsync_core::reconciler::FileScanner;
use shelfsync_model::{RelPath, ScannedFile};

#[derive(Debug, Default)]
pub struct FakeFileScanner {
    files: Mutex<HashMap<RelPath, Vec<u8>>>,
}

impl FakeFileScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, path: &str, bytes: impl Into<Vec<u8>>) {
        self.files.lock().unwrap().insert(RelPath::from(path), bytes.into());
    }

    pub fn remove(&self, path: &str) {
        self.files.lock().unwrap().remove(&RelPath::from(path));
    }
}

#[async_trait]
impl FileScanner for FakeFileScanner {
    async fn scan(&self, _library_root: &Path) -> Result<Vec<ScannedFile>> {
        let files = self.files.lock().unwrap();
        Ok(files
            .iter()
            .map(|(path, bytes)| ScannedFile {
                file_path: path.clone(),
                size: bytes.len() as u64,
                mtime: 0.0,
                path_derived_metadata: serde_json::Value::Null,
            })
            .collect())
    }

    async fn read_bytes(&self, _library_root: &Path, file_path: &RelPath) -> Result<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(file_path)
            .cloned()
            .ok_or_else(|| CoreError::Internal(format!("no such file in fixture: {file_path}")))
    }
}
