//! Embedded pattern catalog (`config/patterns.toml`).

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

static CATALOG: Lazy<Catalog> = Lazy::new(|| {
    let raw = include_str!("../../config/patterns.toml");
    toml::from_str::<Catalog>(raw).expect("valid pattern catalog")
});

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatternDef {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub description: String,
    pub keywords: Vec<String>,
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SentimentLexicon {
    pub positive: Vec<String>,
    pub negative: Vec<String>,
    pub negators: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Catalog {
    patterns: Vec<PatternDef>,
    #[serde(default)]
    sentiment: SentimentLexicon,
}

pub fn patterns() -> &'static [PatternDef] {
    &CATALOG.patterns
}

pub fn sentiment_lexicon() -> &'static SentimentLexicon {
    &CATALOG.sentiment
}

/// Lowercased word tokens; apostrophes stay inside words ("i'll", "can't").
pub fn tokenize(s: &str) -> Vec<String> {
    s.replace('\u{2019}', "'")
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .map(|t| t.trim_matches('\''))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}
