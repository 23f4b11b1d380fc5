//! Selection and popup state driven by morpheme clicks.
//!
//! `Idle` hides the popup. A click moves to `Selected` with the clicked
//! location and that morpheme's dictionary hits. From `Selected` the reader
//! can open the furigana editor (`Editing`) when the morpheme has ruby
//! segments; saving or removing returns to `Selected`. Closing returns to
//! `Idle` but keeps the last location.

use crate::data::{FuriganaUnit, MorphemeFurigana, Run, RunIdx, ScoreHit};
use crate::flashcards::{FlashcardRecord, MorphemeSite};
use crate::render::{HighlightSpan, highlight};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Location {
    pub doc_name: String,
    pub line_hash: String,
    pub line_number: usize,
    pub morpheme_idx: usize,
    /// Furigana as displayed at the time of the click, overrides applied.
    pub furigana: MorphemeFurigana,
}

impl Location {
    pub fn site(&self) -> MorphemeSite<'_> {
        MorphemeSite {
            doc_name: &self.doc_name,
            line_hash: &self.line_hash,
            line_number: self.line_number,
            morpheme_idx: self.morpheme_idx,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RubyChoice {
    pub ruby: String,
    pub rt: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PopupState {
    #[default]
    Idle,
    Selected,
    Editing { choices: Vec<RubyChoice> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PopupError {
    NoSelection,
    NothingToEdit,
    NotEditing,
    ReadingOutOfRange { index: usize, len: usize },
}

impl fmt::Display for PopupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PopupError::NoSelection => write!(f, "no morpheme is selected"),
            PopupError::NothingToEdit => write!(f, "the selected morpheme has no ruby segments"),
            PopupError::NotEditing => write!(f, "the furigana editor is not open"),
            PopupError::ReadingOutOfRange { index, len } => {
                write!(f, "reading {index} out of range, the morpheme has {len}")
            }
        }
    }
}

impl std::error::Error for PopupError {}

/// Ticket identifying one click; only the newest click may apply its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClickTicket(u64);

#[derive(Debug, Clone, Default)]
pub struct Popup {
    state: PopupState,
    location: Option<Location>,
    hits: Vec<Vec<ScoreHit>>,
    issued: u64,
}

impl Popup {
    pub fn state(&self) -> &PopupState {
        &self.state
    }

    pub fn is_visible(&self) -> bool {
        self.state != PopupState::Idle
    }

    pub fn location(&self) -> Option<&Location> {
        self.location.as_ref()
    }

    pub fn hits(&self) -> &[Vec<ScoreHit>] {
        &self.hits
    }

    /// Starts a click. Any click issued earlier becomes stale.
    pub fn issue_ticket(&mut self) -> ClickTicket {
        self.issued += 1;
        ClickTicket(self.issued)
    }

    /// Applies a click's result. Returns false, changing nothing, when a newer click was issued.
    pub fn select(&mut self, ticket: ClickTicket, location: Location, hits: Vec<Vec<ScoreHit>>) -> bool {
        if ticket.0 != self.issued {
            return false;
        }
        self.location = Some(location);
        self.hits = hits;
        self.state = PopupState::Selected;
        true
    }

    pub fn close(&mut self) {
        self.state = PopupState::Idle;
    }

    /// Hides the popup, forgets the selection and invalidates in-flight clicks.
    pub fn reset(&mut self) {
        self.state = PopupState::Idle;
        self.location = None;
        self.hits.clear();
        self.issued += 1;
    }

    pub fn selection(&self) -> Result<&Location, PopupError> {
        match (&self.state, &self.location) {
            (PopupState::Idle, _) | (_, None) => Err(PopupError::NoSelection),
            (_, Some(location)) => Ok(location),
        }
    }

    pub fn begin_edit(&mut self) -> Result<&[RubyChoice], PopupError> {
        let choices: Vec<RubyChoice> = self
            .selection()?
            .furigana
            .iter()
            .filter_map(|unit| match unit {
                FuriganaUnit::Ruby { ruby, rt } => Some(RubyChoice {
                    ruby: ruby.clone(),
                    rt: rt.clone(),
                }),
                FuriganaUnit::Plain(_) => None,
            })
            .collect();
        if choices.is_empty() {
            return Err(PopupError::NothingToEdit);
        }
        self.state = PopupState::Editing { choices };
        match &self.state {
            PopupState::Editing { choices } => Ok(choices),
            _ => Err(PopupError::NotEditing),
        }
    }

    pub fn set_reading(&mut self, index: usize, reading: impl Into<String>) -> Result<(), PopupError> {
        let PopupState::Editing { choices } = &mut self.state else {
            return Err(PopupError::NotEditing);
        };
        let len = choices.len();
        let choice = choices
            .get_mut(index)
            .ok_or(PopupError::ReadingOutOfRange { index, len })?;
        choice.rt = reading.into();
        Ok(())
    }

    pub fn pending_edit(&self) -> Result<(Location, Vec<String>), PopupError> {
        let PopupState::Editing { choices } = &self.state else {
            return Err(PopupError::NotEditing);
        };
        let location = self.location.clone().ok_or(PopupError::NoSelection)?;
        Ok((location, choices.iter().map(|choice| choice.rt.clone()).collect()))
    }

    /// Records a committed edit and returns to `Selected`.
    ///
    /// Ignored if the selection moved elsewhere while the edit was being written.
    pub fn finish_edit(&mut self, edited: &Location, furigana: MorphemeFurigana) {
        let Some(location) = self.location.as_mut() else {
            return;
        };
        if location.doc_name != edited.doc_name
            || location.line_hash != edited.line_hash
            || location.morpheme_idx != edited.morpheme_idx
        {
            return;
        }
        location.furigana = furigana;
        if matches!(self.state, PopupState::Editing { .. }) {
            self.state = PopupState::Selected;
        }
    }

    pub fn hit_at(&self, group: usize, position: usize) -> Option<&ScoreHit> {
        self.hits.get(group).and_then(|hits| hits.get(position))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HitView {
    pub word_id: String,
    pub summary: String,
    pub score: Option<f64>,
    pub run: Run,
    pub run_idx: RunIdx,
    pub highlight: Vec<HighlightSpan>,
    /// Already tagged at the selected morpheme; toggling removes it.
    pub tagged_here: bool,
    /// Tagged morphemes in the current document for this word.
    pub document_count: usize,
}

impl HitView {
    pub fn new(hit: &ScoreHit, record: Option<&FlashcardRecord>, location: &Location) -> Self {
        let site = location.site();
        Self {
            word_id: hit.word_id.clone(),
            summary: hit.summary.clone(),
            score: hit.score,
            run: hit.run.clone(),
            run_idx: hit.run_idx,
            highlight: highlight(&hit.run, &hit.summary),
            tagged_here: record.is_some_and(|record| record.has_location(&site)),
            document_count: record.map_or(0, |record| record.location_count(&location.doc_name)),
        }
    }

    pub fn action_label(&self) -> String {
        let action = if self.tagged_here {
            "REMOVE flashcard?"
        } else {
            "Add as flashcard"
        };
        if self.document_count > 0 {
            format!("{action} ({} total)", self.document_count)
        } else {
            action.to_string()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PopupView {
    pub state: PopupState,
    pub location: Location,
    pub hits: Vec<Vec<HitView>>,
}
