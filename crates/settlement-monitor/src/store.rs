//! Persistence of the channel id, the only state needed to resume a session.
//!
//! Where the id lives is up to the embedder: an in-memory slot, a small JSON
//! file, or a resumable URL carrying it as a query parameter. All stores are
//! idempotent: saving the same id twice or clearing an empty store succeeds.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

/// Query parameter used by [`UrlStore`].
pub const DEFAULT_URL_PARAM: &str = "channel";

/// Errors emitted by channel id stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid channel id: {0:?}")]
    InvalidId(String),
}

/// Location the caller controls for the persisted channel id.
pub trait ChannelIdStore: Send + Sync + std::fmt::Debug {
    fn load(&self) -> Result<Option<String>, StoreError>;
    fn save(&self, channel_id: &str) -> Result<(), StoreError>;
    fn clear(&self) -> Result<(), StoreError>;
}

fn validate_id(channel_id: &str) -> Result<(), StoreError> {
    if channel_id.trim().is_empty() {
        return Err(StoreError::InvalidId(channel_id.to_string()));
    }
    Ok(())
}

/// Process-local store, useful for tests and short-lived embedders.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slot: RwLock<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the store with an id, as if it had been persisted earlier.
    pub fn with_id(channel_id: impl Into<String>) -> Self {
        Self {
            slot: RwLock::new(Some(channel_id.into())),
        }
    }
}

impl ChannelIdStore for MemoryStore {
    fn load(&self) -> Result<Option<String>, StoreError> {
        Ok(self
            .slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save(&self, channel_id: &str) -> Result<(), StoreError> {
        validate_id(channel_id)?;
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = Some(channel_id.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

/// On-disk record written by [`FileStore`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct PersistedChannel {
    channel_id: String,
    #[serde(with = "time::serde::rfc3339")]
    saved_at: OffsetDateTime,
}

/// JSON file holding the channel id; survives process restarts.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ChannelIdStore for FileStore {
    fn load(&self) -> Result<Option<String>, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let record: PersistedChannel = serde_json::from_slice(&bytes)?;
        Ok(Some(record.channel_id))
    }

    fn save(&self, channel_id: &str) -> Result<(), StoreError> {
        validate_id(channel_id)?;
        if self.load().ok().flatten().as_deref() == Some(channel_id) {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let record = PersistedChannel {
            channel_id: channel_id.to_string(),
            saved_at: OffsetDateTime::now_utc(),
        };
        // Write to a sibling file first so readers never see a torn record.
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec(&record)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Keeps the id in a query parameter of a resumable URL.
///
/// The embedder reads [`UrlStore::url`] after each change and exposes it
/// (address bar, deep link, redirect target) so a reload lands back on the
/// same channel.
#[derive(Debug)]
pub struct UrlStore {
    param: String,
    url: RwLock<Url>,
}

impl UrlStore {
    pub fn new(url: Url) -> Self {
        Self::with_param(url, DEFAULT_URL_PARAM)
    }

    pub fn with_param(url: Url, param: impl Into<String>) -> Self {
        Self {
            param: param.into(),
            url: RwLock::new(url),
        }
    }

    /// Current URL including (or lacking) the channel parameter.
    pub fn url(&self) -> Url {
        self.url.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Rewrites the query, dropping the channel parameter and optionally re-adding it.
    fn rewrite(&self, channel_id: Option<&str>) {
        let mut url = self.url.write().unwrap_or_else(PoisonError::into_inner);
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(key, _)| *key != self.param.as_str())
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        if kept.is_empty() && channel_id.is_none() {
            url.set_query(None);
            return;
        }
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        for (key, value) in &kept {
            pairs.append_pair(key, value);
        }
        if let Some(id) = channel_id {
            pairs.append_pair(&self.param, id);
        }
    }
}

impl ChannelIdStore for UrlStore {
    fn load(&self) -> Result<Option<String>, StoreError> {
        let url = self.url.read().unwrap_or_else(PoisonError::into_inner);
        Ok(url
            .query_pairs()
            .find(|(key, _)| *key == self.param.as_str())
            .map(|(_, value)| value.into_owned())
            .filter(|value| !value.trim().is_empty()))
    }

    fn save(&self, channel_id: &str) -> Result<(), StoreError> {
        validate_id(channel_id)?;
        self.rewrite(Some(channel_id));
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.rewrite(None);
        Ok(())
    }
}
