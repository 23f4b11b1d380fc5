use crate::cache::DictCache;
use crate::session::ReaderSession;
use crate::source::{AnySource, FetchError, HttpSourceConfig};
use crate::store::{DocumentStore, StoreError};
use std::fmt;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Base URL of the content server, or a directory laid out like its sidecar tree.
    pub content: String,
    /// Append log for annotations. `None` keeps them in memory only.
    pub store_path: Option<PathBuf>,
    /// Bounds the line payload cache; unbounded when `None`.
    pub dict_cache_capacity: Option<NonZeroUsize>,
    pub request_timeout: Duration,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            content: "http://127.0.0.1:8080".to_string(),
            store_path: Some(PathBuf::from("sidecar.jsonl")),
            dict_cache_capacity: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Store(StoreError),
    Http(FetchError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Store(err) => write!(f, "failed to open store: {err}"),
            ConfigError::Http(err) => write!(f, "failed to build content client: {err}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<StoreError> for ConfigError {
    fn from(value: StoreError) -> Self {
        ConfigError::Store(value)
    }
}

impl From<FetchError> for ConfigError {
    fn from(value: FetchError) -> Self {
        ConfigError::Http(value)
    }
}

impl ReaderConfig {
    pub fn http_config(&self) -> HttpSourceConfig {
        HttpSourceConfig {
            request_timeout: self.request_timeout,
            ..HttpSourceConfig::default()
        }
    }

    pub fn open_store(&self) -> Result<DocumentStore, StoreError> {
        match &self.store_path {
            Some(path) => DocumentStore::open(path.clone()),
            None => Ok(DocumentStore::in_memory()),
        }
    }

    pub fn build_cache(&self) -> DictCache {
        match self.dict_cache_capacity {
            Some(capacity) => DictCache::with_capacity(capacity),
            None => DictCache::unbounded(),
        }
    }

    pub fn build_session(&self) -> Result<ReaderSession<AnySource>, ConfigError> {
        let source = AnySource::from_location(&self.content, &self.http_config())?;
        let store = self.open_store()?;
        Ok(ReaderSession::new(
            Arc::new(source),
            store,
            Arc::new(self.build_cache()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_directory_session() {
        let dir = tempfile::tempdir().unwrap();
        let config = ReaderConfig {
            content: dir.path().display().to_string(),
            store_path: None,
            dict_cache_capacity: NonZeroUsize::new(4),
            ..ReaderConfig::default()
        };
        let session = config.build_session().unwrap();
        assert!(session.store().is_empty());
        assert!(session.cache().is_empty());
        assert!(session.doc_name().is_none());
    }

    #[test]
    fn store_path_opens_a_persistent_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = ReaderConfig {
            store_path: Some(dir.path().join("annotations.jsonl")),
            ..ReaderConfig::default()
        };
        let store = config.open_store().unwrap();
        store
            .upsert("k", |value: serde_json::Value| {
                if value.is_null() { serde_json::json!(1) } else { value }
            })
            .unwrap();
        assert_eq!(config.open_store().unwrap().len(), 1);
        assert_eq!(config.http_config().request_timeout, Duration::from_secs(30));
    }
}
