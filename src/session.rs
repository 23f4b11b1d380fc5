//! A reader's view of one open document.
//!
//! The session owns the content source, the line payload cache and the store
//! handle, plus everything derived from them for the active document: the
//! flashcard listing and mapping, the override mapping and the popup. Derived
//! views are recomputed from the store after every write.

use crate::cache::DictCache;
use crate::data::{MorphemeFurigana, ScoreHit};
use crate::decode::{Document, LineView, fetch_line_dict, load_document};
use crate::flashcards::{
    FlashcardRecord, FlashcardsByLineAndMorpheme, Toggled, load_flashcards, reconcile,
    toggle_flashcard,
};
use crate::keys::flashcard_key;
use crate::overrides::{
    FuriganaOverrideRecord, FuriganaOverrides, OverrideChange, apply_override_edit, load_overrides,
};
use crate::popup::{HitView, Location, Popup, PopupError, PopupView, RubyChoice};
use crate::render::{RenderedLine, render_document};
use crate::source::ContentSource;
use crate::store::{DocumentStore, StoreError, StoreExport};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

#[derive(Debug)]
pub enum SessionError {
    NoDocument,
    NotInteractive { line_number: usize, morpheme_idx: usize },
    Popup(PopupError),
    Store(StoreError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::NoDocument => write!(f, "no document is open"),
            SessionError::NotInteractive {
                line_number,
                morpheme_idx,
            } => write!(
                f,
                "line {line_number} has no annotated morpheme {morpheme_idx}"
            ),
            SessionError::Popup(err) => write!(f, "{err}"),
            SessionError::Store(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Popup(err) => Some(err),
            SessionError::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<PopupError> for SessionError {
    fn from(value: PopupError) -> Self {
        SessionError::Popup(value)
    }
}

impl From<StoreError> for SessionError {
    fn from(value: StoreError) -> Self {
        SessionError::Store(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClickOutcome {
    Applied,
    /// A newer click started while this one was fetching.
    Superseded,
}

pub struct ReaderSession<S> {
    shared: Arc<SessionShared<S>>,
}

impl<S> Clone for ReaderSession<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct SessionShared<S> {
    source: Arc<S>,
    cache: Arc<DictCache>,
    store: DocumentStore,
    inner: RwLock<SessionState>,
}

#[derive(Default)]
struct SessionState {
    doc_name: Option<String>,
    document: Option<Document>,
    flashcards: Vec<FlashcardRecord>,
    flashcard_map: FlashcardsByLineAndMorpheme,
    overrides: FuriganaOverrides,
    popup: Popup,
}

impl SessionState {
    fn doc_name(&self) -> Result<&str, SessionError> {
        self.doc_name.as_deref().ok_or(SessionError::NoDocument)
    }

    fn line_furigana(&self, line_number: usize) -> Option<(String, Vec<MorphemeFurigana>)> {
        let lines = self.document.as_ref()?.lines();
        match lines.get(line_number)? {
            LineView::Annotated { hash, furigana, .. } => {
                Some((hash.to_string(), self.overrides.resolve(hash, furigana)))
            }
            LineView::Plain { .. } => None,
        }
    }

    fn generated_furigana(&self, line_hash: &str, morpheme_idx: usize) -> Option<MorphemeFurigana> {
        self.document.as_ref()?.lines().into_iter().find_map(|line| match line {
            LineView::Annotated { hash, furigana, .. } if hash == line_hash => {
                furigana.get(morpheme_idx).cloned()
            }
            _ => None,
        })
    }
}

impl<S: ContentSource> ReaderSession<S> {
    pub fn new(source: Arc<S>, store: DocumentStore, cache: Arc<DictCache>) -> Self {
        Self {
            shared: Arc::new(SessionShared {
                source,
                cache,
                store,
                inner: RwLock::new(SessionState::default()),
            }),
        }
    }

    pub fn store(&self) -> &DocumentStore {
        &self.shared.store
    }

    pub fn cache(&self) -> &DictCache {
        &self.shared.cache
    }

    pub fn doc_name(&self) -> Option<String> {
        self.shared.inner.read().doc_name.clone()
    }

    /// Makes `doc_name` the active document and loads it with its annotations.
    ///
    /// Returns false when the document itself could not be fetched or decoded;
    /// its annotations are still loaded so they can be listed.
    pub async fn open_document(&self, doc_name: &str) -> Result<bool, SessionError> {
        let store = &self.shared.store;
        let flashcards = load_flashcards(store, doc_name)?;
        let overrides = load_overrides(store, doc_name)?;
        {
            let mut guard = self.shared.inner.write();
            guard.flashcard_map = reconcile(&flashcards, doc_name);
            guard.flashcards = flashcards;
            guard.overrides = overrides;
            guard.doc_name = Some(doc_name.to_string());
            guard.document = None;
            guard.popup.reset();
        }

        let document = load_document(&self.shared.source, &self.shared.cache, doc_name).await;
        let loaded = document.is_some();
        let mut guard = self.shared.inner.write();
        if guard.doc_name.as_deref() != Some(doc_name) {
            debug!(doc = doc_name, "document switched while loading");
            return Ok(false);
        }
        if let Some(document) = document {
            info!(doc = doc_name, lines = document.len(), "opened document");
            guard.document = Some(document);
        }
        Ok(loaded)
    }

    pub fn refresh_flashcards(&self) -> Result<(), SessionError> {
        let doc_name = self.shared.inner.read().doc_name()?.to_string();
        let flashcards = load_flashcards(&self.shared.store, &doc_name)?;
        let mut guard = self.shared.inner.write();
        if guard.doc_name.as_deref() == Some(doc_name.as_str()) {
            guard.flashcard_map = reconcile(&flashcards, &doc_name);
            guard.flashcards = flashcards;
        }
        Ok(())
    }

    pub fn render(&self) -> Option<Vec<RenderedLine>> {
        let guard = self.shared.inner.read();
        let document = guard.document.as_ref()?;
        Some(render_document(
            document,
            &guard.flashcard_map,
            &guard.overrides,
        ))
    }

    pub fn flashcard_list(&self) -> Vec<FlashcardRecord> {
        self.shared.inner.read().flashcards.clone()
    }

    pub fn flashcard_map(&self) -> FlashcardsByLineAndMorpheme {
        self.shared.inner.read().flashcard_map.clone()
    }

    pub fn overrides(&self) -> FuriganaOverrides {
        self.shared.inner.read().overrides.clone()
    }

    /// Selects a morpheme and loads its dictionary hits.
    ///
    /// `furigana` is what the reader sees for that morpheme, overrides applied.
    /// A missing line payload leaves the popup with no hits.
    pub async fn click_morpheme(
        &self,
        line_hash: &str,
        line_number: usize,
        morpheme_idx: usize,
        furigana: MorphemeFurigana,
    ) -> Result<ClickOutcome, SessionError> {
        let (ticket, doc_name) = {
            let mut guard = self.shared.inner.write();
            let doc_name = guard.doc_name()?.to_string();
            (guard.popup.issue_ticket(), doc_name)
        };

        let dict = fetch_line_dict(self.shared.source.as_ref(), &self.shared.cache, line_hash).await;
        let hits = dict.map(|dict| dict.hits_at(morpheme_idx)).unwrap_or_default();
        let location = Location {
            doc_name,
            line_hash: line_hash.to_string(),
            line_number,
            morpheme_idx,
            furigana,
        };

        let mut guard = self.shared.inner.write();
        if guard.doc_name.as_deref() != Some(location.doc_name.as_str()) {
            return Ok(ClickOutcome::Superseded);
        }
        if guard.popup.select(ticket, location, hits) {
            Ok(ClickOutcome::Applied)
        } else {
            debug!(line = line_number, morpheme = morpheme_idx, "discarding superseded click");
            Ok(ClickOutcome::Superseded)
        }
    }

    pub async fn click_displayed(
        &self,
        line_number: usize,
        morpheme_idx: usize,
    ) -> Result<ClickOutcome, SessionError> {
        let not_interactive = SessionError::NotInteractive {
            line_number,
            morpheme_idx,
        };
        let (line_hash, furigana) = {
            let guard = self.shared.inner.read();
            guard.doc_name()?;
            let Some((hash, mut furigana)) = guard.line_furigana(line_number) else {
                return Err(not_interactive);
            };
            if morpheme_idx >= furigana.len() {
                return Err(not_interactive);
            }
            (hash, furigana.swap_remove(morpheme_idx))
        };
        self.click_morpheme(&line_hash, line_number, morpheme_idx, furigana)
            .await
    }

    pub fn close_popup(&self) {
        self.shared.inner.write().popup.close();
    }

    pub fn begin_edit(&self) -> Result<Vec<RubyChoice>, SessionError> {
        let mut guard = self.shared.inner.write();
        Ok(guard.popup.begin_edit()?.to_vec())
    }

    pub fn set_reading(&self, index: usize, reading: impl Into<String>) -> Result<(), SessionError> {
        self.shared.inner.write().popup.set_reading(index, reading)?;
        Ok(())
    }

    pub fn save_edit(&self) -> Result<FuriganaOverrideRecord, SessionError> {
        let (location, readings) = self.shared.inner.read().popup.pending_edit()?;
        let record = apply_override_edit(
            &self.shared.store,
            &location.doc_name,
            &location.line_hash,
            location.morpheme_idx,
            OverrideChange::Readings {
                current: &location.furigana,
                readings: &readings,
            },
        )?;

        let mut guard = self.shared.inner.write();
        let furigana = record
            .overrides
            .get(&location.morpheme_idx)
            .cloned()
            .unwrap_or_else(|| location.furigana.clone());
        if guard.doc_name.as_deref() == Some(location.doc_name.as_str()) {
            guard
                .overrides
                .set_line(record.line_hash.clone(), record.overrides.clone());
        }
        guard.popup.finish_edit(&location, furigana);
        Ok(record)
    }

    /// Drops the selected morpheme's override, restoring the generated furigana.
    pub fn remove_override(&self) -> Result<FuriganaOverrideRecord, SessionError> {
        let location = self.shared.inner.read().popup.selection()?.clone();
        let record = apply_override_edit(
            &self.shared.store,
            &location.doc_name,
            &location.line_hash,
            location.morpheme_idx,
            OverrideChange::Remove,
        )?;

        let mut guard = self.shared.inner.write();
        let furigana = guard
            .generated_furigana(&location.line_hash, location.morpheme_idx)
            .unwrap_or_else(|| location.furigana.clone());
        if guard.doc_name.as_deref() == Some(location.doc_name.as_str()) {
            guard
                .overrides
                .set_line(record.line_hash.clone(), record.overrides.clone());
        }
        guard.popup.finish_edit(&location, furigana);
        Ok(record)
    }

    pub fn hit_at(&self, group: usize, position: usize) -> Option<ScoreHit> {
        self.shared.inner.read().popup.hit_at(group, position).cloned()
    }

    /// Tags `hit` at the selected morpheme, or untags it if already tagged there.
    pub fn toggle_flashcard(&self, hit: &ScoreHit) -> Result<Toggled, SessionError> {
        let location = self.shared.inner.read().popup.selection()?.clone();
        let toggled = toggle_flashcard(&self.shared.store, &location.site(), hit, now_ms())?;
        debug!(
            word = %hit.word_id,
            added = toggled.added,
            "toggled flashcard"
        );
        self.refresh_flashcards()?;
        Ok(toggled)
    }

    pub fn popup_view(&self) -> Result<Option<PopupView>, SessionError> {
        let guard = self.shared.inner.read();
        let popup = &guard.popup;
        let Ok(location) = popup.selection() else {
            return Ok(None);
        };
        let store = &self.shared.store;
        let hits = popup
            .hits()
            .iter()
            .map(|group| {
                group
                    .iter()
                    .map(|hit| -> Result<HitView, StoreError> {
                        let key = flashcard_key(&location.doc_name, &hit.word_id);
                        let record = store.get::<FlashcardRecord>(&key)?;
                        Ok(HitView::new(hit, record.as_ref(), location))
                    })
                    .collect::<Result<Vec<_>, StoreError>>()
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        Ok(Some(PopupView {
            state: popup.state().clone(),
            location: location.clone(),
            hits,
        }))
    }

    pub fn export(&self) -> StoreExport {
        self.shared.store.export_all()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
