//! User corrections to generated furigana.

use crate::data::{FuriganaUnit, MorphemeFurigana};
use crate::keys::{KeyRange, override_key};
use crate::store::{DocumentStore, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub type LineOverrides = BTreeMap<usize, MorphemeFurigana>;

/// Persisted overrides for one line. An emptied record is left in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FuriganaOverrideRecord {
    pub line_hash: String,
    pub overrides: LineOverrides,
}

/// Returns each morpheme's override when one exists, else its generated furigana.
pub fn resolve_line_furigana(
    generated: &[MorphemeFurigana],
    overrides: &LineOverrides,
) -> Vec<MorphemeFurigana> {
    generated
        .iter()
        .enumerate()
        .map(|(idx, furigana)| overrides.get(&idx).unwrap_or(furigana).clone())
        .collect()
}

/// Replaces the reading of each ruby segment, in order, with the next of `readings`.
///
/// Plain segments are kept. Ruby segments beyond the supplied readings keep
/// their current reading; surplus readings are ignored.
pub fn rebuild_with_readings(current: &[FuriganaUnit], readings: &[String]) -> MorphemeFurigana {
    let mut readings = readings.iter();
    current
        .iter()
        .map(|unit| match unit {
            FuriganaUnit::Plain(_) => unit.clone(),
            FuriganaUnit::Ruby { ruby, rt } => FuriganaUnit::Ruby {
                ruby: ruby.clone(),
                rt: readings.next().unwrap_or(rt).clone(),
            },
        })
        .collect()
}

pub fn ruby_readings(furigana: &[FuriganaUnit]) -> Vec<String> {
    furigana
        .iter()
        .filter_map(|unit| match unit {
            FuriganaUnit::Ruby { rt, .. } => Some(rt.clone()),
            FuriganaUnit::Plain(_) => None,
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub enum OverrideChange<'a> {
    /// Store `current` with its ruby readings replaced by `readings`.
    Readings {
        current: &'a [FuriganaUnit],
        readings: &'a [String],
    },
    /// Drop the morpheme's override.
    Remove,
}

/// Merges one morpheme's edit into the line's override record.
///
/// Only the single record for `line_hash` is read and rewritten, so edits to
/// other morphemes of the same line are preserved.
pub fn apply_override_edit(
    store: &DocumentStore,
    doc_name: &str,
    line_hash: &str,
    morpheme_idx: usize,
    change: OverrideChange<'_>,
) -> Result<FuriganaOverrideRecord, StoreError> {
    let key = override_key(doc_name, line_hash);
    let upserted = store.upsert(&key, |mut record: FuriganaOverrideRecord| {
        record.line_hash = line_hash.to_string();
        match change {
            OverrideChange::Remove => {
                record.overrides.remove(&morpheme_idx);
            }
            OverrideChange::Readings { current, readings } => {
                record
                    .overrides
                    .insert(morpheme_idx, rebuild_with_readings(current, readings));
            }
        }
        record
    })?;
    Ok(upserted.doc)
}

#[derive(Debug, Clone, Default)]
pub struct FuriganaOverrides {
    lines: HashMap<String, LineOverrides>,
}

impl FuriganaOverrides {
    pub fn line(&self, line_hash: &str) -> Option<&LineOverrides> {
        self.lines.get(line_hash)
    }

    pub fn is_overridden(&self, line_hash: &str, morpheme_idx: usize) -> bool {
        self.line(line_hash)
            .is_some_and(|line| line.contains_key(&morpheme_idx))
    }

    pub fn set_line(&mut self, line_hash: impl Into<String>, overrides: LineOverrides) {
        self.lines.insert(line_hash.into(), overrides);
    }

    pub fn resolve(&self, line_hash: &str, generated: &[MorphemeFurigana]) -> Vec<MorphemeFurigana> {
        match self.line(line_hash) {
            Some(overrides) => resolve_line_furigana(generated, overrides),
            None => generated.to_vec(),
        }
    }
}

pub fn load_overrides(store: &DocumentStore, doc_name: &str) -> Result<FuriganaOverrides, StoreError> {
    let rows = store.range_query::<FuriganaOverrideRecord>(&KeyRange::overrides(doc_name))?;
    let lines = rows
        .into_iter()
        .map(|(_, record)| (record.line_hash, record.overrides))
        .collect();
    Ok(FuriganaOverrides { lines })
}
