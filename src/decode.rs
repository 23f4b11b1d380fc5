//! Validated decoding of manifests, markdown documents and line sidecars.
//!
//! Failures are contained per unit: a bad sidecar degrades its own line to
//! plain text, a bad manifest makes only that document unavailable.

use crate::cache::DictCache;
use crate::data::{Dict, LightManifest, ManifestEntry, MorphemeFurigana};
use crate::source::{ContentSource, line_path};
use serde::{Serialize, de};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

const LINE_MARKER: &str = "<line id=\"hash-";

#[derive(Debug)]
pub struct DecodeError {
    /// Which payload failed, e.g. `manifest` or `line sidecar`.
    pub payload: &'static str,
    /// Location of the offending value, empty for the payload root.
    pub path: String,
    pub source: serde_json::Error,
}

impl DecodeError {
    fn new(payload: &'static str, path: impl Into<String>, source: serde_json::Error) -> Self {
        Self {
            payload,
            path: path.into(),
            source,
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "invalid {}: {}", self.payload, self.source)
        } else {
            write!(f, "invalid {} at {}: {}", self.payload, self.path, self.source)
        }
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Decodes a lightweight manifest: an array of strings and `{line, hash, furigana}` objects.
pub fn decode_light_manifest(bytes: &[u8]) -> Result<LightManifest, DecodeError> {
    let raw: Vec<Value> =
        serde_json::from_slice(bytes).map_err(|err| DecodeError::new("manifest", "", err))?;
    raw.into_iter()
        .enumerate()
        .map(|(idx, value)| match value {
            Value::String(text) => Ok(ManifestEntry::Plain(text)),
            other => serde_path_to_error::deserialize(other)
                .map(ManifestEntry::Line)
                .map_err(|err| located("manifest", format!("[{idx}]"), err)),
        })
        .collect()
}

/// Decodes one line's sidecar payload.
///
/// Every hit's `runIdx` must be an ordered range within the line's morphemes.
pub fn decode_line_dict(bytes: &[u8]) -> Result<Dict, DecodeError> {
    let mut deserializer = serde_json::Deserializer::from_slice(bytes);
    let dict: Dict = serde_path_to_error::deserialize(&mut deserializer)
        .map_err(|err| located("line sidecar", String::new(), err))?;
    deserializer
        .end()
        .map_err(|err| DecodeError::new("line sidecar", "", err))?;
    check_run_ranges(&dict)?;
    Ok(dict)
}

fn check_run_ranges(dict: &Dict) -> Result<(), DecodeError> {
    let morphemes = dict.dict_hits.len();
    for (morpheme_idx, groups) in dict.dict_hits.iter().enumerate() {
        for (group_idx, hits) in groups.iter().enumerate() {
            for (hit_idx, hit) in hits.iter().enumerate() {
                let run = hit.run_idx;
                if run.start() <= run.end() && run.end() <= morphemes {
                    continue;
                }
                return Err(DecodeError::new(
                    "line sidecar",
                    format!("dictHits[{morpheme_idx}][{group_idx}][{hit_idx}].runIdx"),
                    de::Error::custom(format_args!(
                        "range [{}, {}] does not fit a line of {morphemes} morphemes",
                        run.start(),
                        run.end()
                    )),
                ));
            }
        }
    }
    Ok(())
}

fn located(
    payload: &'static str,
    prefix: String,
    err: serde_path_to_error::Error<serde_json::Error>,
) -> DecodeError {
    let inner = err.path().to_string();
    let mut path = prefix;
    if inner != "." {
        if !path.is_empty() && !inner.starts_with('[') {
            path.push('.');
        }
        path.push_str(&inner);
    }
    DecodeError::new(payload, path, err.into_inner())
}

/// Extracts the hash from a line containing `<line id="hash-HASH">`.
pub fn line_marker_hash(line: &str) -> Option<&str> {
    let start = line.find(LINE_MARKER)? + LINE_MARKER.len();
    let rest = &line[start..];
    let end = rest.find('"')?;
    let hash = &rest[..end];
    if hash.is_empty() || !rest[end..].starts_with("\">") {
        return None;
    }
    Some(hash)
}

/// A markdown line after decoding.
#[derive(Debug, Clone)]
pub enum DocLine {
    Raw(String),
    Annotated { hash: String, dict: Arc<Dict> },
}

/// Fetches a line payload, consulting the cache first.
///
/// Returns `None` when the sidecar is unavailable or malformed; the failure is logged.
pub async fn fetch_line_dict<S: ContentSource>(
    source: &S,
    cache: &DictCache,
    hash: &str,
) -> Option<Arc<Dict>> {
    if let Some(hit) = cache.get(hash) {
        debug!(hash, "line payload cache hit");
        return Some(hit);
    }
    let bytes = match source.fetch(&line_path(hash)).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(hash, error = %err, "failed to fetch line sidecar");
            return None;
        }
    };
    match decode_line_dict(&bytes) {
        Ok(dict) => Some(cache.insert(hash, dict)),
        Err(err) => {
            warn!(hash, error = %err, "failed to decode line sidecar");
            None
        }
    }
}

/// Splits a markdown document into lines and resolves every marked line's sidecar.
///
/// Sidecars are fetched concurrently; results are placed back by line position.
pub async fn decode_markdown_document<S: ContentSource>(
    text: &str,
    source: &Arc<S>,
    cache: &Arc<DictCache>,
) -> Vec<DocLine> {
    let raw_lines: Vec<&str> = text.split('\n').collect();
    let mut resolved: Vec<Option<DocLine>> = vec![None; raw_lines.len()];
    let mut tasks = JoinSet::new();

    for (idx, line) in raw_lines.iter().enumerate() {
        let Some(hash) = line_marker_hash(line) else {
            continue;
        };
        let hash = hash.to_string();
        let source = Arc::clone(source);
        let cache = Arc::clone(cache);
        tasks.spawn(async move {
            let dict = fetch_line_dict(source.as_ref(), &cache, &hash).await;
            (idx, hash, dict)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((idx, hash, Some(dict))) => resolved[idx] = Some(DocLine::Annotated { hash, dict }),
            Ok((_, _, None)) => {}
            Err(err) => warn!(error = %err, "line sidecar task failed"),
        }
    }

    raw_lines
        .into_iter()
        .zip(resolved)
        .map(|(raw, line)| line.unwrap_or_else(|| DocLine::Raw(raw.to_string())))
        .collect()
}

/// A loaded document in either supported format.
#[derive(Debug, Clone)]
pub enum Document {
    Manifest(LightManifest),
    Markdown(Vec<DocLine>),
}

/// Borrowed view of one document line, independent of the source format.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LineView<'a> {
    Plain {
        text: &'a str,
    },
    Annotated {
        hash: &'a str,
        text: &'a str,
        furigana: &'a [MorphemeFurigana],
    },
}

impl Document {
    pub fn lines(&self) -> Vec<LineView<'_>> {
        match self {
            Document::Manifest(entries) => entries
                .iter()
                .map(|entry| match entry {
                    ManifestEntry::Plain(text) => LineView::Plain { text },
                    ManifestEntry::Line(line) => LineView::Annotated {
                        hash: &line.hash,
                        text: &line.line,
                        furigana: &line.furigana,
                    },
                })
                .collect(),
            Document::Markdown(lines) => lines
                .iter()
                .map(|line| match line {
                    DocLine::Raw(text) => LineView::Plain { text },
                    DocLine::Annotated { hash, dict } => LineView::Annotated {
                        hash,
                        text: &dict.line,
                        furigana: &dict.furigana,
                    },
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Document::Manifest(entries) => entries.len(),
            Document::Markdown(lines) => lines.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fetches and decodes a document. `.json` filenames are manifests, everything else markdown.
///
/// Returns `None` when the document is unavailable; the failure is logged.
pub async fn load_document<S: ContentSource>(
    source: &Arc<S>,
    cache: &Arc<DictCache>,
    filename: &str,
) -> Option<Document> {
    let bytes = match source.fetch(filename).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(path = filename, error = %err, "failed to fetch document");
            return None;
        }
    };
    if filename.ends_with(".json") {
        return match decode_light_manifest(&bytes) {
            Ok(manifest) => Some(Document::Manifest(manifest)),
            Err(err) => {
                warn!(path = filename, error = %err, "failed to decode document manifest");
                None
            }
        };
    }
    let text = String::from_utf8_lossy(&bytes);
    Some(Document::Markdown(
        decode_markdown_document(&text, source, cache).await,
    ))
}
