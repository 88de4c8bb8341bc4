//! Per-file state and the registry that hands it out.
//!
//! Each file has one `FileRecord` behind its own mutex. Holding that mutex
//! is the serialization point for the file: lock state, pending partial
//! puts and head commits of one file never change concurrently, while
//! different files proceed in parallel up to the store's own write lock.

use crate::partial::PartialPuts;
use cellstore_lock::FileLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, Default)]
pub struct FileRecord {
    pub lock: FileLock,
    pub partials: PartialPuts,
}

impl FileRecord {
    /// Nothing left worth keeping in memory.
    pub fn is_idle(&self) -> bool {
        self.lock.is_idle() && self.partials.is_empty()
    }
}

pub type SharedFile = Arc<Mutex<FileRecord>>;

#[derive(Debug, Default)]
pub struct FileRegistry {
    files: RwLock<HashMap<String, SharedFile>>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The record for `url`, created on first use.
    pub async fn get_or_create(&self, url: &str) -> SharedFile {
        if let Some(file) = self.files.read().await.get(url) {
            return file.clone();
        }
        let mut files = self.files.write().await;
        files.entry(url.to_string()).or_default().clone()
    }

    pub async fn get(&self, url: &str) -> Option<SharedFile> {
        self.files.read().await.get(url).cloned()
    }

    /// Snapshot of every tracked file.
    pub async fn all(&self) -> Vec<(String, SharedFile)> {
        self.files
            .read()
            .await
            .iter()
            .map(|(url, f)| (url.clone(), f.clone()))
            .collect()
    }

    /// Forget idle records nobody else holds. Returns how many.
    pub async fn evict_idle(&self) -> usize {
        let mut files = self.files.write().await;
        let before = files.len();
        files.retain(|_, file| {
            if Arc::strong_count(file) > 1 {
                return true;
            }
            match file.try_lock() {
                Ok(record) => !record.is_idle(),
                Err(_) => true,
            }
        });
        before - files.len()
    }

    pub async fn len(&self) -> usize {
        self.files.read().await.len()
    }
}
