use crate::data::{FuriganaUnit, MorphemeFurigana, Run};
use crate::decode::{Document, LineView};
use crate::flashcards::FlashcardsByLineAndMorpheme;
use crate::overrides::FuriganaOverrides;
use serde::Serialize;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedMorpheme {
    pub index: usize,
    pub furigana: MorphemeFurigana,
    /// The reader replaced the generated furigana.
    pub overridden: bool,
    /// Tagged, or part of a tagged multi-morpheme expression.
    pub flashcard: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RenderedLine {
    Plain {
        line_number: usize,
        text: String,
    },
    Annotated {
        line_number: usize,
        hash: String,
        morphemes: Vec<RenderedMorpheme>,
        /// Distinct summaries of flashcards tagged on this line.
        summaries: Vec<String>,
    },
}

pub fn render_document(
    document: &Document,
    flashcards: &FlashcardsByLineAndMorpheme,
    overrides: &FuriganaOverrides,
) -> Vec<RenderedLine> {
    document
        .lines()
        .into_iter()
        .enumerate()
        .map(|(line_number, line)| render_line(line_number, line, flashcards, overrides))
        .collect()
}

pub fn render_line(
    line_number: usize,
    line: LineView<'_>,
    flashcards: &FlashcardsByLineAndMorpheme,
    overrides: &FuriganaOverrides,
) -> RenderedLine {
    match line {
        LineView::Plain { text } => RenderedLine::Plain {
            line_number,
            text: text.to_string(),
        },
        LineView::Annotated { hash, furigana, .. } => {
            let morphemes = overrides
                .resolve(hash, furigana)
                .into_iter()
                .enumerate()
                .map(|(index, furigana)| RenderedMorpheme {
                    index,
                    furigana,
                    overridden: overrides.is_overridden(hash, index),
                    flashcard: flashcards.covers(hash, index),
                })
                .collect();
            RenderedLine::Annotated {
                line_number,
                hash: hash.to_string(),
                morphemes,
                summaries: flashcards.line_summaries(hash),
            }
        }
    }
}

/// Inline ruby notation, e.g. `読(よ)む`.
pub fn inline_ruby(furigana: &[FuriganaUnit]) -> String {
    let mut out = String::new();
    for unit in furigana {
        match unit {
            FuriganaUnit::Plain(text) => out.push_str(text),
            FuriganaUnit::Ruby { ruby, rt } => {
                out.push_str(ruby);
                out.push('(');
                out.push_str(rt);
                out.push(')');
            }
        }
    }
    out
}

pub fn line_markdown(line: &RenderedLine) -> String {
    match line {
        RenderedLine::Plain { text, .. } => text.clone(),
        RenderedLine::Annotated { morphemes, .. } => morphemes
            .iter()
            .map(|morpheme| {
                let text = inline_ruby(&morpheme.furigana);
                if morpheme.flashcard {
                    format!("**{text}**")
                } else {
                    text
                }
            })
            .collect(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HighlightSpan {
    pub text: String,
    pub highlighted: bool,
}

/// Splits `summary` into runs of characters that do or do not occur in the matched text.
pub fn highlight(run: &Run, summary: &str) -> Vec<HighlightSpan> {
    let needle: HashSet<char> = run.matched().chars().collect();
    let mut spans: Vec<HighlightSpan> = Vec::new();
    for ch in summary.chars() {
        let highlighted = needle.contains(&ch);
        match spans.last_mut() {
            Some(span) if span.highlighted == highlighted => span.text.push(ch),
            _ => spans.push(HighlightSpan {
                text: ch.to_string(),
                highlighted,
            }),
        }
    }
    spans
}
