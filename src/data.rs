use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::marker::PhantomData;

/// One analysed morpheme of a line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Morpheme {
    pub literal: String,
    pub pronunciation: String,
    pub lemma_reading: String,
    pub lemma: String,
    pub part_of_speech: Vec<String>,
    pub inflection_type: Option<Vec<String>>,
    pub inflection: Option<Vec<String>>,
}

/// A single furigana segment: either text that needs no reading or a ruby pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FuriganaUnit {
    Plain(String),
    Ruby { ruby: String, rt: String },
}

impl FuriganaUnit {
    pub fn ruby(base: impl Into<String>, reading: impl Into<String>) -> Self {
        FuriganaUnit::Ruby {
            ruby: base.into(),
            rt: reading.into(),
        }
    }

    pub fn is_ruby(&self) -> bool {
        matches!(self, FuriganaUnit::Ruby { .. })
    }

    /// Base text shown on the line, without the reading.
    pub fn base(&self) -> &str {
        match self {
            FuriganaUnit::Plain(text) => text,
            FuriganaUnit::Ruby { ruby, .. } => ruby,
        }
    }
}

#[derive(Deserialize)]
struct RubyPair {
    ruby: String,
    rt: String,
}

impl<'de> Deserialize<'de> for FuriganaUnit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(StringOrObject::new(
            "a string or a {ruby, rt} object",
            FuriganaUnit::Plain,
            |pair: RubyPair| FuriganaUnit::Ruby {
                ruby: pair.ruby,
                rt: pair.rt,
            },
        ))
    }
}

/// Furigana for one morpheme; a morpheme may render as several segments.
pub type MorphemeFurigana = Vec<FuriganaUnit>;

/// The text a dictionary hit matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Run {
    Plain(String),
    Cloze {
        left: String,
        cloze: String,
        right: String,
    },
}

impl Run {
    /// The matched span itself, without cloze context.
    pub fn matched(&self) -> &str {
        match self {
            Run::Plain(text) => text,
            Run::Cloze { cloze, .. } => cloze,
        }
    }
}

#[derive(Deserialize)]
struct ClozeParts {
    left: String,
    cloze: String,
    right: String,
}

impl<'de> Deserialize<'de> for Run {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(StringOrObject::new(
            "a string or a {left, cloze, right} object",
            Run::Plain,
            |parts: ClozeParts| Run::Cloze {
                left: parts.left,
                cloze: parts.cloze,
                right: parts.right,
            },
        ))
    }
}

/// Accepts a bare string or a struct-shaped object; a malformed object fails
/// with its own field error.
struct StringOrObject<T, O, P, M> {
    expecting: &'static str,
    plain: P,
    object: M,
    marker: PhantomData<fn(O) -> T>,
}

impl<T, O, P, M> StringOrObject<T, O, P, M> {
    fn new(expecting: &'static str, plain: P, object: M) -> Self {
        Self {
            expecting,
            plain,
            object,
            marker: PhantomData,
        }
    }
}

impl<'de, T, O, P, M> Visitor<'de> for StringOrObject<T, O, P, M>
where
    O: Deserialize<'de>,
    P: FnOnce(String) -> T,
    M: FnOnce(O) -> T,
{
    type Value = T;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.expecting)
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<T, E> {
        Ok((self.plain)(value.to_owned()))
    }

    fn visit_string<E: de::Error>(self, value: String) -> Result<T, E> {
        Ok((self.plain)(value))
    }

    fn visit_map<A: MapAccess<'de>>(self, map: A) -> Result<T, A::Error> {
        let object = O::deserialize(de::value::MapAccessDeserializer::new(map))?;
        Ok((self.object)(object))
    }
}

/// Half-open `[start, end)` range of morpheme indices covered by a match.
///
/// Serialized as a two-element array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunIdx(pub usize, pub usize);

impl RunIdx {
    pub fn start(&self) -> usize {
        self.0
    }

    pub fn end(&self) -> usize {
        self.1
    }

    /// Number of morphemes covered. A reversed range counts as empty.
    pub fn len(&self) -> usize {
        self.1.saturating_sub(self.0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, morpheme_idx: usize) -> bool {
        morpheme_idx >= self.0 && morpheme_idx < self.1
    }
}

/// A dictionary match produced by the offline analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreHit {
    pub word_id: String,
    /// `None` stands for an infinite score; the producer cannot encode infinity in JSON.
    pub score: Option<f64>,
    pub search: String,
    pub run: Run,
    pub run_idx: RunIdx,
    pub summary: String,
}

/// Full analysis of one line, fetched from its sidecar file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dict {
    pub line: String,
    pub furigana: Vec<MorphemeFurigana>,
    pub bunsetsus: Vec<Vec<Morpheme>>,
    /// Indexed by morpheme; each entry groups hits sharing a headword and match boundary.
    pub dict_hits: Vec<Vec<Vec<ScoreHit>>>,
}

impl Dict {
    /// Hit groups starting at `morpheme_idx`, empty when the index is out of range.
    pub fn hits_at(&self, morpheme_idx: usize) -> Vec<Vec<ScoreHit>> {
        self.dict_hits.get(morpheme_idx).cloned().unwrap_or_default()
    }
}

/// An annotated line in a lightweight manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightweightLine {
    pub line: String,
    pub hash: String,
    pub furigana: Vec<MorphemeFurigana>,
}

/// One entry of a lightweight manifest: plain text (headers and the like) or an annotated line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ManifestEntry {
    Plain(String),
    Line(LightweightLine),
}

pub type LightManifest = Vec<ManifestEntry>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn furigana_units_accept_both_shapes() {
        let units: MorphemeFurigana =
            serde_json::from_value(json!([{"ruby": "読", "rt": "よ"}, "む"])).unwrap();
        assert_eq!(
            units,
            vec![FuriganaUnit::ruby("読", "よ"), FuriganaUnit::Plain("む".into())]
        );
        assert!(units[0].is_ruby());
        assert_eq!(units[1].base(), "む");
    }

    #[test]
    fn score_hit_accepts_null_score_and_cloze_run() {
        let hit: ScoreHit = serde_json::from_value(json!({
            "wordId": "1358280",
            "score": null,
            "search": "食べる",
            "run": {"left": "", "cloze": "食べ", "right": "る"},
            "runIdx": [1, 3],
            "summary": "食べる たべる eat",
        }))
        .unwrap();
        assert_eq!(hit.score, None);
        assert_eq!(hit.run.matched(), "食べ");
        assert_eq!(hit.run_idx, RunIdx(1, 3));
        assert_eq!(hit.run_idx.len(), 2);
        assert!(hit.run_idx.contains(2));
        assert!(!hit.run_idx.contains(3));
    }

    #[test]
    fn reversed_run_idx_is_empty() {
        assert!(RunIdx(4, 2).is_empty());
        assert_eq!(RunIdx(4, 2).len(), 0);
    }

    #[test]
    fn hits_at_defaults_to_empty() {
        let dict = Dict {
            line: "本".into(),
            furigana: vec![vec![FuriganaUnit::Plain("本".into())]],
            bunsetsus: Vec::new(),
            dict_hits: Vec::new(),
        };
        assert!(dict.hits_at(0).is_empty());
        assert!(dict.hits_at(7).is_empty());
    }

    #[test]
    fn malformed_ruby_names_the_missing_field() {
        let err = serde_json::from_value::<MorphemeFurigana>(json!([{"ruby": "読"}])).unwrap_err();
        assert!(err.to_string().contains("missing field `rt`"), "{err}");

        let err = serde_json::from_value::<Run>(json!({"left": "", "cloze": 3, "right": ""}))
            .unwrap_err();
        assert!(err.to_string().contains("expected a string"), "{err}");

        assert!(serde_json::from_value::<FuriganaUnit>(json!(7)).is_err());
    }
}
