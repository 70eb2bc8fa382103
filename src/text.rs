//! Built-in text capabilities.
//!
//! These implementations need no model server, so the binary works end to
//! end out of the box. Production deployments replace [`ExtractiveSummarizer`]
//! (and usually the detector) with adapters around real models by building a
//! custom [`Capabilities`](crate::pipeline::Capabilities).

use std::collections::{HashMap, HashSet};

use anyhow::{bail, Result};
use async_trait::async_trait;

use synopsis_core::capability::{
    EncodedText, Encoder, LanguageDetector, Postprocessor, Preprocessor, Summarizer,
};
use synopsis_core::chunk::split_text;
use synopsis_core::models::{DetectedLanguage, Params};
use synopsis_core::params::param_f64;

/// Normalizes whitespace and strips control characters.
///
/// Paragraphs (separated by blank lines) are kept; line breaks inside a
/// paragraph become single spaces. The output is a fixed point: running it
/// through again returns the same text.
#[derive(Debug, Default, Clone, Copy)]
pub struct WhitespacePreprocessor;

impl WhitespacePreprocessor {
    pub fn normalize(text: &str) -> String {
        let text = text.replace("\r\n", "\n").replace('\r', "\n");
        let text: String = text
            .chars()
            .filter(|c| c.is_whitespace() || !c.is_control())
            .collect();

        let mut paragraphs = Vec::new();
        let mut words: Vec<&str> = Vec::new();
        for line in text.lines() {
            if line.trim().is_empty() {
                if !words.is_empty() {
                    paragraphs.push(words.join(" "));
                    words.clear();
                }
                continue;
            }
            words.extend(line.split_whitespace());
        }
        if !words.is_empty() {
            paragraphs.push(words.join(" "));
        }
        paragraphs.join("\n\n")
    }
}

#[async_trait]
impl Preprocessor for WhitespacePreprocessor {
    async fn preprocess(&self, text: &str) -> Result<String> {
        Ok(Self::normalize(text))
    }
}

/// Splits text into paragraph-aligned chunks under a token budget.
#[derive(Debug, Clone, Copy)]
pub struct ChunkEncoder {
    max_tokens: usize,
}

impl ChunkEncoder {
    pub fn new(max_tokens: usize) -> Self {
        Self { max_tokens }
    }
}

#[async_trait]
impl Encoder for ChunkEncoder {
    async fn encode(&self, text: &str) -> Result<EncodedText> {
        Ok(EncodedText {
            chunks: split_text(text, self.max_tokens),
        })
    }
}

/// Frequency-scored extractive summarizer.
///
/// Each chunk is summarized on its own by picking its highest-scoring
/// sentences until the chunk's share of `relative_max_length` is used up,
/// and never less than `relative_min_length`. Sentences keep their original
/// order.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExtractiveSummarizer;

#[async_trait]
impl Summarizer for ExtractiveSummarizer {
    async fn summarize(&self, encoded: &EncodedText, params: &Params) -> Result<String> {
        let max_ratio = param_f64(params, "relative_max_length", 0.4);
        let min_ratio = param_f64(params, "relative_min_length", 0.1);

        let parts: Vec<String> = encoded
            .chunks
            .iter()
            .map(|chunk| extract(&chunk.text, min_ratio, max_ratio))
            .filter(|s| !s.is_empty())
            .collect();
        if parts.is_empty() {
            bail!("nothing to summarize: encoded text is empty");
        }
        Ok(parts.join(" "))
    }
}

fn extract(text: &str, min_ratio: f64, max_ratio: f64) -> String {
    let sentences = split_sentences(text);
    if sentences.is_empty() {
        return String::new();
    }

    let total_chars = text.chars().count() as f64;
    let max_chars = (total_chars * max_ratio).ceil() as usize;
    let min_chars = (total_chars * min_ratio).ceil() as usize;

    let mut freq: HashMap<String, usize> = HashMap::new();
    for sentence in &sentences {
        for word in content_words(sentence) {
            *freq.entry(word).or_default() += 1;
        }
    }

    let scores: Vec<f64> = sentences
        .iter()
        .map(|s| {
            let words = content_words(s);
            if words.is_empty() {
                return 0.0;
            }
            let sum: usize = words.iter().map(|w| freq.get(w).copied().unwrap_or(0)).sum();
            sum as f64 / words.len() as f64
        })
        .collect();

    let mut ranked: Vec<usize> = (0..sentences.len()).collect();
    ranked.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));

    let mut chosen = Vec::new();
    let mut used = 0;
    for idx in ranked {
        let len = sentences[idx].chars().count();
        if !chosen.is_empty() && used + len > max_chars && used >= min_chars {
            continue;
        }
        chosen.push(idx);
        used += len;
        if used >= max_chars {
            break;
        }
    }
    chosen.sort_unstable();

    chosen
        .into_iter()
        .map(|i| sentences[i])
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split at `.`, `!` or `?` followed by whitespace.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        if let Some(&(next_idx, next)) = chars.peek() {
            if next.is_whitespace() {
                let sentence = text[start..i + c.len_utf8()].trim();
                if !sentence.is_empty() {
                    out.push(sentence);
                }
                start = next_idx;
            }
        }
    }
    let rest = text[start..].trim();
    if !rest.is_empty() {
        out.push(rest);
    }
    out
}

/// Lowercased words long enough to carry meaning.
fn content_words(sentence: &str) -> Vec<String> {
    sentence
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > 3)
        .map(str::to_lowercase)
        .collect()
}

/// Tidies raw summarizer output into readable sentences.
///
/// Collapses whitespace, removes spaces before punctuation, capitalizes the
/// first letter of every sentence and makes sure the text ends with
/// terminal punctuation.
#[derive(Debug, Default, Clone, Copy)]
pub struct SentencePostprocessor;

impl SentencePostprocessor {
    pub fn tidy(text: &str) -> String {
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        let mut spaced = String::with_capacity(collapsed.len());
        let mut chars = collapsed.chars().peekable();
        while let Some(c) = chars.next() {
            if c == ' ' && matches!(chars.peek(), Some('.' | ',' | ';' | ':' | '!' | '?')) {
                continue;
            }
            spaced.push(c);
        }

        let mut out = String::with_capacity(spaced.len() + 1);
        let mut capitalize = true;
        let mut prev = ' ';
        for c in spaced.chars() {
            if capitalize && c.is_alphabetic() {
                out.extend(c.to_uppercase());
                capitalize = false;
            } else {
                if c.is_alphanumeric() {
                    capitalize = false;
                }
                if c == ' ' && matches!(prev, '.' | '!' | '?') {
                    capitalize = true;
                }
                out.push(c);
            }
            prev = c;
        }

        if let Some(last) = out.chars().last() {
            if !matches!(last, '.' | '!' | '?' | '"' | '\'' | ')') {
                out.push('.');
            }
        }
        out
    }
}

#[async_trait]
impl Postprocessor for SentencePostprocessor {
    async fn postprocess(&self, text: &str) -> Result<String> {
        Ok(Self::tidy(text))
    }
}

const STOPWORDS: &[(&str, &[&str])] = &[
    (
        "en",
        &[
            "the", "and", "of", "to", "is", "in", "that", "it", "was", "for", "with", "as", "are",
            "this", "be", "have", "from", "by", "which", "not", "they", "but",
        ],
    ),
    (
        "es",
        &[
            "el", "la", "los", "las", "de", "que", "y", "en", "es", "por", "con", "para", "una",
            "del", "se", "no", "su", "al", "lo", "como", "pero", "más",
        ],
    ),
    (
        "fr",
        &[
            "le", "la", "les", "des", "et", "est", "que", "une", "dans", "pour", "pas", "qui",
            "sur", "au", "avec", "ce", "il", "sont", "du", "ne", "mais",
        ],
    ),
    (
        "de",
        &[
            "der", "die", "das", "und", "ist", "nicht", "ein", "eine", "zu", "den", "mit", "von",
            "sich", "auf", "für", "dem", "des", "im", "auch", "es", "sind",
        ],
    ),
    (
        "it",
        &[
            "il", "di", "che", "è", "per", "una", "non", "sono", "della", "gli", "le", "con",
            "del", "si", "questo", "come", "ma", "anche", "nel",
        ],
    ),
    (
        "pt",
        &[
            "o", "os", "as", "de", "que", "não", "uma", "para", "com", "por", "mais", "se", "do",
            "da", "dos", "em", "é", "ao", "como", "mas",
        ],
    ),
];

/// Hits needed before a detection is trusted at face value.
const MIN_CONFIDENT_HITS: f64 = 3.0;

/// Detects the language of a text from stop-word frequencies.
///
/// Confidence is the winning language's share of all stop-word hits, scaled
/// down for texts with very few hits. Text without a single known stop word
/// is reported as `"und"` (undetermined) with confidence 0.
pub struct StopwordDetector {
    languages: Vec<(&'static str, HashSet<&'static str>)>,
}

impl StopwordDetector {
    pub fn new() -> Self {
        Self {
            languages: STOPWORDS
                .iter()
                .map(|(lang, words)| (*lang, words.iter().copied().collect()))
                .collect(),
        }
    }

    pub fn detect_sync(&self, text: &str) -> DetectedLanguage {
        let words: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();

        let hits: Vec<usize> = self
            .languages
            .iter()
            .map(|(_, set)| words.iter().filter(|w| set.contains(w.as_str())).count())
            .collect();
        let total: usize = hits.iter().sum();

        let best = hits
            .iter()
            .enumerate()
            .max_by(|(ia, a), (ib, b)| a.cmp(b).then(ib.cmp(ia)))
            .map(|(i, &n)| (i, n));

        match best {
            Some((idx, n)) if n > 0 => {
                let share = n as f64 / total as f64;
                let coverage = (n as f64 / MIN_CONFIDENT_HITS).min(1.0);
                DetectedLanguage {
                    language: self.languages[idx].0.to_string(),
                    confidence: round2(share * coverage),
                }
            }
            _ => DetectedLanguage {
                language: "und".to_string(),
                confidence: 0.0,
            },
        }
    }
}

impl Default for StopwordDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LanguageDetector for StopwordDetector {
    async fn detect(&self, text: &str) -> Result<DetectedLanguage> {
        Ok(self.detect_sync(text))
    }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}
