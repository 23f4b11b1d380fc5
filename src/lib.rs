//! Furigana reader with per-document flashcard tags and furigana corrections.
//!
//! Documents and their per-line analysis sidecars come from a static content
//! server ([`source`]). Reader annotations live in a local key-value store
//! ([`store`]) and are projected onto the document's lines and morphemes
//! ([`flashcards`], [`overrides`]) for rendering ([`render`]). A
//! [`ReaderSession`] ties these together for one open document.

pub mod cache;
pub mod config;
pub mod data;
pub mod decode;
pub mod flashcards;
pub mod keys;
pub mod overrides;
pub mod popup;
pub mod render;
pub mod session;
pub mod source;
pub mod store;
#[cfg(feature = "web")]
pub mod web;

pub use cache::DictCache;
pub use config::{ConfigError, ReaderConfig};
pub use data::{
    Dict, FuriganaUnit, LightManifest, LightweightLine, ManifestEntry, Morpheme, MorphemeFurigana,
    Run, RunIdx, ScoreHit,
};
pub use decode::{DecodeError, Document, decode_light_manifest, decode_line_dict};
pub use flashcards::{FlashcardRecord, FlashcardsByLineAndMorpheme, reconcile};
pub use keys::{KeyRange, flashcard_key, override_key};
pub use overrides::{FuriganaOverrideRecord, FuriganaOverrides, resolve_line_furigana};
pub use popup::{Popup, PopupState, PopupView};
pub use render::{RenderedLine, RenderedMorpheme};
pub use session::{ClickOutcome, ReaderSession, SessionError};
pub use source::{AnySource, ContentSource, DirSource, FetchError, HttpSource, MemorySource};
pub use store::{DocumentStore, StoreError, StoreExport};
