//! JSON Page Store
//!
//! File-backed default implementation of the page-store boundary: one
//! JSON document mapping target keys to page entries. Writes take an
//! advisory lock with bounded retries since different run modes may
//! overlap on this one file.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task;

#[cfg(unix)]
use fs2::FileExt;

use super::{PageContent, PageStore};
use crate::signals::{ExistingState, TargetKey};

const MAX_LOCK_RETRIES: usize = 10;
const LOCK_RETRY_SLEEP: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PageEntry {
    service: String,
    location: String,
    frozen: bool,
    title: String,
    updated_at: DateTime<Utc>,
}

pub struct JsonPageStore {
    path: PathBuf,
}

impl JsonPageStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load_entries(path: &Path) -> Result<HashMap<String, PageEntry>> {
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read page state {}", path.display()))?;
        if raw.trim().is_empty() {
            return Ok(HashMap::new());
        }
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid page state {}", path.display()))
    }

    /// Read-modify-write under an exclusive advisory lock.
    async fn update<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut HashMap<String, PageEntry>) + Send + 'static,
    {
        let path = self.path.clone();
        task::spawn_blocking(move || -> Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?;

            for _ in 0..MAX_LOCK_RETRIES {
                #[cfg(unix)]
                let locked = file.try_lock_exclusive().is_ok();
                #[cfg(not(unix))]
                let locked = true;

                if locked {
                    let mut entries = Self::load_entries(&path)?;
                    mutate(&mut entries);
                    let serialized = serde_json::to_string_pretty(&entries)?;
                    file.set_len(0)?;
                    file.seek(SeekFrom::Start(0))?;
                    file.write_all(serialized.as_bytes())?;
                    file.flush()?;
                    #[cfg(unix)]
                    let _ = fs2::FileExt::unlock(&file);
                    return Ok(());
                }
                std::thread::sleep(LOCK_RETRY_SLEEP);
            }
            anyhow::bail!("could not acquire exclusive lock on page state")
        })
        .await?
    }
}

#[async_trait]
impl PageStore for JsonPageStore {
    async fn existing_state(&self) -> Result<ExistingState> {
        let path = self.path.clone();
        let entries = task::spawn_blocking(move || Self::load_entries(&path)).await??;

        let mut targets = HashSet::new();
        let mut frozen = HashSet::new();
        for entry in entries.values() {
            let key = TargetKey::new(&entry.service, &entry.location);
            if entry.frozen {
                frozen.insert(key.clone());
            }
            targets.insert(key);
        }
        Ok(ExistingState::new(targets, frozen))
    }

    async fn upsert_page(&self, target: &TargetKey, content: &PageContent) -> Result<()> {
        let key = target.to_string();
        let entry = PageEntry {
            service: target.service.clone(),
            location: target.location.clone(),
            frozen: false,
            title: content.title.clone(),
            updated_at: Utc::now(),
        };
        self.update(move |entries| {
            let frozen = entries.get(&key).map(|e| e.frozen).unwrap_or(false);
            entries.insert(key, PageEntry { frozen, ..entry });
        })
        .await
    }

    async fn mark_frozen(&self, target: &TargetKey) -> Result<()> {
        let key = target.to_string();
        let service = target.service.clone();
        let location = target.location.clone();
        self.update(move |entries| {
            entries
                .entry(key)
                .and_modify(|e| e.frozen = true)
                .or_insert_with(|| PageEntry {
                    service,
                    location,
                    frozen: true,
                    title: String::new(),
                    updated_at: Utc::now(),
                });
        })
        .await
    }
}
