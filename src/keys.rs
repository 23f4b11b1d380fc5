//! Store keys for flashcard and furigana override records.
//!
//! Range scans rely on lexicographic key order: every key of one kind in one
//! document sorts between `prefix` and `prefix + SENTINEL`. Word identifiers
//! and line hashes must therefore never contain characters at or above
//! [`SENTINEL`]; this is not checked at runtime.

/// Upper-bound character appended to a prefix for range scans.
pub const SENTINEL: char = '\u{fe0f}';

pub fn flashcard_key(doc_name: &str, word_id: &str) -> String {
    format!("doc-{doc_name}/annotated-wordId-{word_id}")
}

pub fn override_key(doc_name: &str, line_hash: &str) -> String {
    format!("doc-{doc_name}/furigana-override-{line_hash}")
}

/// Inclusive start, exclusive end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub start: String,
    pub end: String,
}

impl KeyRange {
    pub fn with_prefix(prefix: String) -> Self {
        let mut end = prefix.clone();
        end.push(SENTINEL);
        Self { start: prefix, end }
    }

    /// All flashcard records of a document.
    pub fn flashcards(doc_name: &str) -> Self {
        Self::with_prefix(flashcard_key(doc_name, ""))
    }

    /// All furigana override records of a document.
    pub fn overrides(doc_name: &str) -> Self {
        Self::with_prefix(override_key(doc_name, ""))
    }

    pub fn contains(&self, key: &str) -> bool {
        key >= self.start.as_str() && key < self.end.as_str()
    }
}
