//! Clients for the static content server that publishes documents and
//! per-line sidecar files under `/dict-hits-per-line`.

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// Mount point of the sidecar tree on the content server.
pub const DICT_PATH: &str = "/dict-hits-per-line";

const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'.').remove(b'-').remove(b'_');

/// Relative path of a line's sidecar payload.
pub fn line_path(hash: &str) -> String {
    format!("line-{hash}.json")
}

#[derive(Debug)]
pub enum FetchError {
    Status { path: String, status: u16 },
    NotFound(String),
    InvalidPath(String),
    Http(reqwest::Error),
    Io(io::Error),
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Status { path, status } => write!(f, "{path}: HTTP status {status}"),
            FetchError::NotFound(path) => write!(f, "{path}: not found"),
            FetchError::InvalidPath(path) => write!(f, "{path}: invalid content path"),
            FetchError::Http(err) => write!(f, "http error: {err}"),
            FetchError::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl std::error::Error for FetchError {}

impl From<reqwest::Error> for FetchError {
    fn from(value: reqwest::Error) -> Self {
        FetchError::Http(value)
    }
}

impl From<io::Error> for FetchError {
    fn from(value: io::Error) -> Self {
        FetchError::Io(value)
    }
}

/// Read access to the sidecar tree. `path` is relative to [`DICT_PATH`].
pub trait ContentSource: Send + Sync + 'static {
    fn fetch(&self, path: &str) -> impl Future<Output = Result<Vec<u8>, FetchError>> + Send;
}

#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Fetches from a running content server, e.g. `http://127.0.0.1:8080`.
#[derive(Clone)]
pub struct HttpSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSource {
    pub fn new(base_url: impl Into<String>, config: &HttpSourceConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        let encoded = utf8_percent_encode(path, PATH_SEGMENT);
        format!("{}{DICT_PATH}/{encoded}", self.base_url)
    }
}

impl ContentSource for HttpSource {
    async fn fetch(&self, path: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.client.get(self.url(path)).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                path: path.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// Reads the sidecar tree straight from a local directory.
#[derive(Debug, Clone)]
pub struct DirSource {
    root: PathBuf,
}

impl DirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, FetchError> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)));
        if path.is_empty() || escapes {
            return Err(FetchError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

impl ContentSource for DirSource {
    async fn fetch(&self, path: &str) -> Result<Vec<u8>, FetchError> {
        let full = self.resolve(path)?;
        match tokio::fs::read(&full).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(FetchError::NotFound(path.to_string()))
            }
            Err(err) => Err(FetchError::Io(err)),
        }
    }
}

/// Fixed in-memory content, handy for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    files: HashMap<String, Vec<u8>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        self.insert(path, body);
        self
    }

    pub fn insert(&mut self, path: impl Into<String>, body: impl Into<Vec<u8>>) {
        self.files.insert(path.into(), body.into());
    }
}

impl ContentSource for MemorySource {
    async fn fetch(&self, path: &str) -> Result<Vec<u8>, FetchError> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(path.to_string()))
    }
}

/// Source chosen at runtime from configuration.
#[derive(Clone)]
pub enum AnySource {
    Http(HttpSource),
    Dir(DirSource),
    Memory(MemorySource),
}

impl AnySource {
    /// `http://` and `https://` locations become an [`HttpSource`], anything else a directory.
    pub fn from_location(location: &str, config: &HttpSourceConfig) -> Result<Self, FetchError> {
        if location.starts_with("http://") || location.starts_with("https://") {
            Ok(AnySource::Http(HttpSource::new(location, config)?))
        } else {
            Ok(AnySource::Dir(DirSource::new(location)))
        }
    }
}

impl ContentSource for AnySource {
    async fn fetch(&self, path: &str) -> Result<Vec<u8>, FetchError> {
        match self {
            AnySource::Http(source) => source.fetch(path).await,
            AnySource::Dir(source) => source.fetch(path).await,
            AnySource::Memory(source) => source.fetch(path).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_urls_encode_the_document_name() {
        let source = HttpSource::new("http://localhost:8080/", &HttpSourceConfig::default()).unwrap();
        assert_eq!(
            source.url("line-abc123.json"),
            "http://localhost:8080/dict-hits-per-line/line-abc123.json"
        );
        assert_eq!(
            source.url("日記 1.md"),
            "http://localhost:8080/dict-hits-per-line/%E6%97%A5%E8%A8%98%201.md"
        );
    }

    #[test]
    fn location_picks_the_source_kind() {
        let config = HttpSourceConfig::default();
        assert!(matches!(
            AnySource::from_location("https://example.com", &config).unwrap(),
            AnySource::Http(_)
        ));
        assert!(matches!(
            AnySource::from_location("./public", &config).unwrap(),
            AnySource::Dir(_)
        ));
    }

    #[tokio::test]
    async fn dir_source_reads_and_reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("line-aa.json"), b"{}").unwrap();
        let source = DirSource::new(dir.path());

        assert_eq!(source.fetch("line-aa.json").await.unwrap(), b"{}");
        assert!(matches!(
            source.fetch("line-bb.json").await,
            Err(FetchError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn dir_source_rejects_escaping_paths() {
        let source = DirSource::new("/srv/sidecar");
        assert!(matches!(
            source.fetch("../secret").await,
            Err(FetchError::InvalidPath(_))
        ));
        assert!(matches!(
            source.fetch("/etc/passwd").await,
            Err(FetchError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn memory_source_serves_registered_files() {
        let source = MemorySource::new().with_file("doc.json", "[]");
        assert_eq!(source.fetch("doc.json").await.unwrap(), b"[]");
        assert!(source.fetch("other.json").await.is_err());
    }
}
