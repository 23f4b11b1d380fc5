//! Flashcard records and their per-line, per-morpheme projection.

use crate::data::{RunIdx, ScoreHit};
use crate::keys::{KeyRange, flashcard_key};
use crate::store::{DocumentStore, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaggedMorpheme {
    pub timestamp: u64,
    pub run_idx: RunIdx,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineLocations {
    pub line_number: usize,
    pub morpheme_idxs: BTreeMap<usize, TaggedMorpheme>,
}

/// Persisted record of one word sense and every place the reader tagged it.
///
/// `locations` maps document name to line hash to the tagged morphemes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlashcardRecord {
    pub word_id: String,
    pub summary: String,
    pub locations: BTreeMap<String, BTreeMap<String, LineLocations>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MorphemeSite<'a> {
    pub doc_name: &'a str,
    pub line_hash: &'a str,
    pub line_number: usize,
    pub morpheme_idx: usize,
}

impl FlashcardRecord {
    pub fn has_location(&self, site: &MorphemeSite<'_>) -> bool {
        self.locations
            .get(site.doc_name)
            .and_then(|lines| lines.get(site.line_hash))
            .is_some_and(|line| line.morpheme_idxs.contains_key(&site.morpheme_idx))
    }

    pub fn location_count(&self, doc_name: &str) -> usize {
        self.locations
            .get(doc_name)
            .map(|lines| lines.values().map(|line| line.morpheme_idxs.len()).sum())
            .unwrap_or(0)
    }

    fn earliest(&self, doc_name: &str) -> (usize, usize) {
        let Some(lines) = self.locations.get(doc_name) else {
            return (usize::MAX, usize::MAX);
        };
        let line = lines
            .values()
            .map(|line| line.line_number)
            .min()
            .unwrap_or(usize::MAX);
        let morpheme = lines
            .values()
            .filter_map(|line| line.morpheme_idxs.keys().next().copied())
            .min()
            .unwrap_or(usize::MAX);
        (line, morpheme)
    }
}

/// Adds the site to the record if absent, removes it if present.
///
/// Lines and documents left without entries are pruned; the record itself always survives.
pub fn toggle_location(
    mut record: FlashcardRecord,
    site: &MorphemeSite<'_>,
    hit: &ScoreHit,
    timestamp: u64,
) -> FlashcardRecord {
    record.word_id = hit.word_id.clone();
    record.summary = hit.summary.clone();

    let lines = record.locations.entry(site.doc_name.to_string()).or_default();
    let line = lines
        .entry(site.line_hash.to_string())
        .or_insert_with(|| LineLocations {
            line_number: site.line_number,
            morpheme_idxs: BTreeMap::new(),
        });
    if line.morpheme_idxs.remove(&site.morpheme_idx).is_none() {
        line.morpheme_idxs.insert(
            site.morpheme_idx,
            TaggedMorpheme {
                timestamp,
                run_idx: hit.run_idx,
            },
        );
    }

    if line.morpheme_idxs.is_empty() {
        lines.remove(site.line_hash);
    }
    if lines.is_empty() {
        record.locations.remove(site.doc_name);
    }
    record
}

#[derive(Debug, Clone)]
pub struct Toggled {
    /// True when the site was added, false when it was removed.
    pub added: bool,
    pub record: FlashcardRecord,
}

pub fn toggle_flashcard(
    store: &DocumentStore,
    site: &MorphemeSite<'_>,
    hit: &ScoreHit,
    timestamp: u64,
) -> Result<Toggled, StoreError> {
    let key = flashcard_key(site.doc_name, &hit.word_id);
    let upserted = store.upsert(&key, |record: FlashcardRecord| {
        toggle_location(record, site, hit, timestamp)
    })?;
    Ok(Toggled {
        added: upserted.doc.has_location(site),
        record: upserted.doc,
    })
}

/// Flashcards tagged in `doc_name`, ordered for listing.
///
/// Records with no location left in the document are dropped. The rest sort by
/// earliest line number, then earliest morpheme index; ties keep key order.
pub fn sort_for_listing(records: Vec<FlashcardRecord>, doc_name: &str) -> Vec<FlashcardRecord> {
    let mut kept: Vec<_> = records
        .into_iter()
        .filter(|record| record.location_count(doc_name) > 0)
        .collect();
    kept.sort_by_key(|record| record.earliest(doc_name));
    kept
}

pub fn load_flashcards(
    store: &DocumentStore,
    doc_name: &str,
) -> Result<Vec<FlashcardRecord>, StoreError> {
    let rows = store.range_query::<FlashcardRecord>(&KeyRange::flashcards(doc_name))?;
    Ok(sort_for_listing(
        rows.into_iter().map(|(_, record)| record).collect(),
        doc_name,
    ))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaggedSense {
    pub word_id: String,
    pub summary: String,
    pub timestamp: u64,
    pub run_idx: RunIdx,
}

/// Morpheme index to the senses tagged there. An index with an empty list is
/// covered by a multi-morpheme tag that starts at an earlier index.
pub type LineFlashcards = BTreeMap<usize, Vec<TaggedSense>>;

#[derive(Debug, Clone, Default)]
pub struct FlashcardsByLineAndMorpheme {
    lines: HashMap<String, LineFlashcards>,
}

impl FlashcardsByLineAndMorpheme {
    pub fn line(&self, line_hash: &str) -> Option<&LineFlashcards> {
        self.lines.get(line_hash)
    }

    /// True when the morpheme is tagged or covered by a tagged run.
    pub fn covers(&self, line_hash: &str, morpheme_idx: usize) -> bool {
        self.line(line_hash)
            .is_some_and(|line| line.contains_key(&morpheme_idx))
    }

    pub fn senses_at(&self, line_hash: &str, morpheme_idx: usize) -> &[TaggedSense] {
        self.line(line_hash)
            .and_then(|line| line.get(&morpheme_idx))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn line_summaries(&self, line_hash: &str) -> Vec<String> {
        let Some(line) = self.line(line_hash) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        line.values()
            .flatten()
            .filter(|sense| seen.insert(sense.summary.as_str()))
            .map(|sense| sense.summary.clone())
            .collect()
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }
}

/// Projects `records` onto line hash and morpheme index for `doc_name`.
///
/// Senses sharing a morpheme keep record order. Every morpheme spanned by a
/// tagged run gets a key, so renderers can mark the whole expression.
pub fn reconcile(records: &[FlashcardRecord], doc_name: &str) -> FlashcardsByLineAndMorpheme {
    let mut lines: HashMap<String, LineFlashcards> = HashMap::new();
    for record in records {
        let Some(doc_lines) = record.locations.get(doc_name) else {
            continue;
        };
        for (line_hash, locations) in doc_lines {
            let line = lines.entry(line_hash.clone()).or_default();
            for (&morpheme_idx, tagged) in &locations.morpheme_idxs {
                line.entry(morpheme_idx).or_default().push(TaggedSense {
                    word_id: record.word_id.clone(),
                    summary: record.summary.clone(),
                    timestamp: tagged.timestamp,
                    run_idx: tagged.run_idx,
                });
            }
        }
    }

    for line in lines.values_mut() {
        expand_runs(line);
    }
    FlashcardsByLineAndMorpheme { lines }
}

/// Longest run, in morphemes, that expansion marks.
pub const MAX_RUN_SPAN: usize = 64;

fn expand_runs(line: &mut LineFlashcards) {
    let spans: Vec<(usize, usize)> = line
        .iter()
        .filter(|(_, senses)| !senses.is_empty())
        .map(|(&morpheme_idx, senses)| {
            let span = senses
                .iter()
                .map(|sense| sense.run_idx.len())
                .max()
                .unwrap_or(1)
                .max(1);
            (morpheme_idx, span)
        })
        .collect();
    for (morpheme_idx, span) in spans {
        for offset in 1..span.min(MAX_RUN_SPAN) {
            let Some(covered) = morpheme_idx.checked_add(offset) else {
                break;
            };
            line.entry(covered).or_default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Run;

    fn hit(word_id: &str, run_idx: RunIdx) -> ScoreHit {
        ScoreHit {
            word_id: word_id.to_string(),
            score: Some(1.0),
            search: word_id.to_string(),
            run: Run::Plain(word_id.to_string()),
            run_idx,
            summary: format!("summary of {word_id}"),
        }
    }

    fn site<'a>(line_hash: &'a str, line_number: usize, morpheme_idx: usize) -> MorphemeSite<'a> {
        MorphemeSite {
            doc_name: "doc",
            line_hash,
            line_number,
            morpheme_idx,
        }
    }

    fn tagged(word_id: &str, sites: &[(MorphemeSite<'_>, RunIdx)]) -> FlashcardRecord {
        sites
            .iter()
            .fold(FlashcardRecord::default(), |record, (site, run_idx)| {
                toggle_location(record, site, &hit(word_id, *run_idx), 7)
            })
    }

    #[test]
    fn multi_morpheme_run_covers_each_spanned_index() {
        let record = tagged("w", &[(site("L1", 0, 2), RunIdx(2, 4))]);
        let derived = reconcile(&[record], "doc");
        let line = derived.line("L1").unwrap();
        assert_eq!(line.keys().copied().collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(derived.senses_at("L1", 2).len(), 1);
        assert!(derived.senses_at("L1", 3).is_empty());
        assert!(derived.covers("L1", 3));
        assert!(!derived.covers("L1", 4));
    }

    #[test]
    fn widest_run_at_a_morpheme_sets_the_span() {
        let a = tagged("a", &[(site("L1", 0, 1), RunIdx(1, 2))]);
        let b = tagged("b", &[(site("L1", 0, 1), RunIdx(1, 4))]);
        let derived = reconcile(&[a, b], "doc");
        let senses: Vec<_> = derived
            .senses_at("L1", 1)
            .iter()
            .map(|sense| sense.word_id.as_str())
            .collect();
        assert_eq!(senses, vec!["a", "b"]);
        for idx in 1..4 {
            assert!(derived.covers("L1", idx), "index {idx}");
        }
        assert!(!derived.covers("L1", 4));
    }

    #[test]
    fn oversized_runs_expand_to_the_cap() {
        let record = tagged("w", &[(site("L1", 0, 1), RunIdx(0, 2_000_000))]);
        let derived = reconcile(&[record], "doc");
        let line = derived.line("L1").unwrap();
        assert_eq!(line.len(), MAX_RUN_SPAN);
        assert_eq!(line.keys().next_back().copied(), Some(MAX_RUN_SPAN));
    }

    #[test]
    fn expansion_stops_at_the_largest_index() {
        let record = tagged("w", &[(site("L1", 0, usize::MAX - 1), RunIdx(0, 3))]);
        let derived = reconcile(&[record], "doc");
        let keys: Vec<usize> = derived.line("L1").unwrap().keys().copied().collect();
        assert_eq!(keys, vec![usize::MAX - 1, usize::MAX]);
    }

    #[test]
    fn expansion_keeps_existing_tags() {
        let long = tagged("long", &[(site("L1", 0, 0), RunIdx(0, 3))]);
        let inner = tagged("inner", &[(site("L1", 0, 1), RunIdx(1, 2))]);
        let derived = reconcile(&[long, inner], "doc");
        assert_eq!(derived.senses_at("L1", 1)[0].word_id, "inner");
        assert!(derived.covers("L1", 2));
    }

    #[test]
    fn every_referenced_location_is_a_key() {
        let records = vec![
            tagged(
                "a",
                &[
                    (site("L1", 0, 0), RunIdx(0, 1)),
                    (site("L2", 3, 5), RunIdx(5, 5)),
                    (site("L3", 4, 9), RunIdx(9, 12)),
                ],
            ),
            tagged("b", &[(site("L2", 3, 1), RunIdx(1, 3))]),
        ];
        let derived = reconcile(&records, "doc");
        for record in &records {
            for (line_hash, line) in &record.locations["doc"] {
                for idx in line.morpheme_idxs.keys() {
                    assert!(derived.covers(line_hash, *idx), "{line_hash}/{idx}");
                }
            }
        }
        assert_eq!(derived.line_count(), 3);
    }

    #[test]
    fn other_documents_are_ignored() {
        let mut record = tagged("a", &[(site("L1", 0, 0), RunIdx(0, 1))]);
        let other = MorphemeSite {
            doc_name: "other",
            ..site("L9", 0, 0)
        };
        record = toggle_location(record, &other, &hit("a", RunIdx(0, 1)), 9);
        let derived = reconcile(&[record], "doc");
        assert!(derived.line("L9").is_none());
    }

    #[test]
    fn double_toggle_restores_prior_locations() {
        let before = tagged("w", &[(site("L1", 0, 0), RunIdx(0, 1))]);
        let spot = site("L1", 0, 3);
        let added = toggle_location(before.clone(), &spot, &hit("w", RunIdx(3, 4)), 11);
        assert!(added.has_location(&spot));
        let removed = toggle_location(added, &spot, &hit("w", RunIdx(3, 4)), 12);
        assert_eq!(removed, before);
    }

    #[test]
    fn removing_the_last_location_keeps_an_empty_record() {
        let spot = site("L1", 0, 0);
        let record = tagged("w", &[(spot, RunIdx(0, 1))]);
        let record = toggle_location(record, &spot, &hit("w", RunIdx(0, 1)), 8);
        assert!(record.locations.is_empty());
        assert_eq!(record.word_id, "w");
        assert_eq!(record.location_count("doc"), 0);
    }

    #[test]
    fn listing_sorts_by_earliest_line_then_morpheme() {
        let late = tagged("late", &[(site("L9", 9, 0), RunIdx(0, 1))]);
        let early_right = tagged("early-right", &[(site("L2", 2, 6), RunIdx(6, 7))]);
        let early_left = tagged(
            "early-left",
            &[
                (site("L2", 2, 4), RunIdx(4, 5)),
                (site("L7", 7, 1), RunIdx(1, 2)),
            ],
        );
        let tie = tagged("tie", &[(site("L2", 2, 6), RunIdx(6, 8))]);
        let empty = FlashcardRecord {
            word_id: "empty".into(),
            ..FlashcardRecord::default()
        };
        let sorted = sort_for_listing(vec![late, early_right, empty, early_left, tie], "doc");
        let order: Vec<_> = sorted.iter().map(|record| record.word_id.as_str()).collect();
        assert_eq!(order, vec!["early-left", "early-right", "tie", "late"]);
    }

    #[test]
    fn line_summaries_are_distinct_and_ordered() {
        let a = tagged("a", &[(site("L1", 0, 3), RunIdx(3, 4)), (site("L1", 0, 0), RunIdx(0, 1))]);
        let b = tagged("b", &[(site("L1", 0, 1), RunIdx(1, 2))]);
        let derived = reconcile(&[a, b], "doc");
        assert_eq!(
            derived.line_summaries("L1"),
            vec!["summary of a".to_string(), "summary of b".to_string()]
        );
        assert!(derived.line_summaries("nope").is_empty());
    }

    #[test]
    fn store_round_trip_toggles_and_lists() {
        let store = DocumentStore::in_memory();
        let spot = site("L1", 1, 2);
        let word = hit("1358280", RunIdx(2, 4));

        let first = toggle_flashcard(&store, &spot, &word, 100).unwrap();
        assert!(first.added);
        let listed = load_flashcards(&store, "doc").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].word_id, "1358280");
        assert_eq!(
            listed[0].locations["doc"]["L1"].morpheme_idxs[&2].run_idx,
            RunIdx(2, 4)
        );

        let second = toggle_flashcard(&store, &spot, &word, 200).unwrap();
        assert!(!second.added);
        assert!(load_flashcards(&store, "doc").unwrap().is_empty());
        let kept: FlashcardRecord = store
            .get(&flashcard_key("doc", "1358280"))
            .unwrap()
            .unwrap();
        assert!(kept.locations.is_empty());
    }

    #[test]
    fn records_serialize_with_string_morpheme_keys() {
        let record = tagged("w", &[(site("L1", 4, 2), RunIdx(2, 3))]);
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["wordId"], "w");
        assert_eq!(value["locations"]["doc"]["L1"]["lineNumber"], 4);
        assert_eq!(
            value["locations"]["doc"]["L1"]["morphemeIdxs"]["2"]["runIdx"],
            serde_json::json!([2, 3])
        );
        let back: FlashcardRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }
}
