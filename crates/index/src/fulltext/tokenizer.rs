//! Text analysis for the inverted index.
//!
//! Pipeline: UAX#29 word boundaries → strip possessives → remove non-alpha
//!           → lowercase → filter short tokens → remove stopwords → light stem

use unicode_segmentation::UnicodeSegmentation;

/// Standard English stopwords (Lucene's default set).
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into", "is", "it",
    "no", "not", "of", "on", "or", "such", "that", "the", "their", "then", "there", "these",
    "they", "this", "to", "was", "will", "with",
];

#[inline]
fn is_stopword(token: &str) -> bool {
    // Linear scan is fast for ~33 entries.
    STOPWORDS.contains(&token)
}

/// Strip English possessive suffix (`'s` / `\u{2019}s`).
#[inline]
fn strip_possessive(word: &str) -> &str {
    word.strip_suffix("'s")
        .or_else(|| word.strip_suffix("\u{2019}s"))
        .unwrap_or(word)
}

/// Light suffix stemmer.
///
/// Deliberately weaker than a full Porter stemmer: only plural and the most
/// common verbal suffixes, applied once. Index and query sides run the same
/// rules, which is all ranking stability needs.
pub fn stem(token: &str) -> String {
    let t = token;
    if t.len() > 4 && t.ends_with("ies") {
        let mut s = t[..t.len() - 3].to_string();
        s.push('y');
        return s;
    }
    if t.len() > 5 && t.ends_with("sses") {
        return t[..t.len() - 2].to_string();
    }
    if t.len() > 4 && t.ends_with("ing") {
        return t[..t.len() - 3].to_string();
    }
    if t.len() > 3 && t.ends_with("ed") {
        return t[..t.len() - 2].to_string();
    }
    if t.len() > 3 && t.ends_with("es") && !t.ends_with("ss") {
        return t[..t.len() - 2].to_string();
    }
    if t.len() > 3 && t.ends_with('s') && !t.ends_with("ss") && !t.ends_with("us") {
        return t[..t.len() - 1].to_string();
    }
    t.to_string()
}

/// Tokenize text into searchable terms.
pub fn tokenize(text: &str) -> Vec<String> {
    text.unicode_words()
        .map(strip_possessive)
        .map(|w| {
            w.chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
        })
        .map(|w| w.to_lowercase())
        .filter(|s| s.len() >= 2)
        .filter(|s| !is_stopword(s))
        .map(|s| stem(&s))
        .collect()
}

/// Tokenize and deduplicate, preserving first-seen order. Query side.
pub fn tokenize_unique(text: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    tokenize(text)
        .into_iter()
        .filter(|t| seen.insert(t.clone()))
        .collect()
}
