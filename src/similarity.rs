//! Text similarity and normalization for track matching.
//!
//! All comparisons run on trimmed, lower-cased text. [`ratio`] is the
//! InDel-normalised similarity (`2·LCS / (|a|+|b|)`, 0–100, rounded), and
//! [`similarity`] layers two adjustments on top of it:
//!
//! - **typo boost**: strings longer than 5 characters that are at most 2 edits
//!   apart score at least 95;
//! - **label guard**: strings that are the same except for short tokens
//!   (`Part 1` / `Part 2`, `Artist A` / `Artist B`) name different items and
//!   are capped at [`LABEL_MISMATCH_CAP`].
//!
//! Shorthand such as `2` / `to` or `u` / `you` is handled by
//! [`normalize_substitutions`], which rewrites the short form to the long one
//! on word boundaries so both sides compare in the same vocabulary.

use std::sync::OnceLock;

use regex::Regex;

/// Symmetric shorthand pairs (short, long).
pub const SUBSTITUTIONS: [(&str, &str); 7] = [
    ("2nite", "tonight"),
    ("4eva", "forever"),
    ("2", "to"),
    ("4", "for"),
    ("ur", "your"),
    ("u", "you"),
    ("r", "are"),
];

pub const TYPO_BOOST_SCORE: f64 = 95.0;
pub const TYPO_MAX_EDITS: usize = 2;
pub const TYPO_MIN_LEN: usize = 5;
pub const LABEL_MISMATCH_CAP: f64 = 50.0;
const LABEL_TOKEN_MAX_LEN: usize = 2;

struct Replacement {
    pattern: Regex,
    from: &'static str,
    to: &'static str,
}

/// Word-boundary patterns for both directions of every pair.
fn replacements() -> &'static [Replacement] {
    static CELL: OnceLock<Vec<Replacement>> = OnceLock::new();
    CELL.get_or_init(|| {
        let mut out = Vec::with_capacity(SUBSTITUTIONS.len() * 2);
        for (short, long) in SUBSTITUTIONS {
            for (from, to) in [(short, long), (long, short)] {
                let pattern = Regex::new(&format!(r"(?i)\b{}\b", regex::escape(from)))
                    .expect("static substitution pattern");
                out.push(Replacement { pattern, from, to });
            }
        }
        out
    })
}

fn artist_separator() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    CELL.get_or_init(|| {
        Regex::new(r"(?i)\s*(?:\bfeat\.|\bft\.|,|&|\band\b)\s*").expect("static artist pattern")
    })
}

pub fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Rewrite shorthand to its long form (`be nice 2 me` → `be nice to me`).
pub fn normalize_substitutions(s: &str) -> String {
    let mut out = normalize(s);
    for r in replacements().iter().filter(|r| r.from.len() < r.to.len()) {
        out = r.pattern.replace_all(&out, r.to).into_owned();
    }
    out
}

/// Title spellings to query with: the original first, then every distinct
/// whole-string and word-boundary substitution, in both directions.
pub fn title_variants(title: &str) -> Vec<String> {
    let original = title.trim().to_string();
    let mut variants = vec![original.clone()];
    let lowered = normalize(&original);

    let mut push = |candidate: String| {
        let key = normalize(&candidate);
        if !candidate.is_empty() && !variants.iter().any(|v| normalize(v) == key) {
            variants.push(candidate);
        }
    };

    for r in replacements() {
        if lowered == r.from {
            push(r.to.to_string());
        }
        if r.pattern.is_match(&original) {
            push(r.pattern.replace_all(&original, r.to).into_owned());
        }
    }
    variants
}

/// Artist strings to try: primary first, then each featured artist, then
/// the full original string as the exact fallback.
pub fn split_artists(artist: &str) -> Vec<String> {
    let full = artist.trim().to_string();
    let mut out: Vec<String> = Vec::new();
    for part in artist_separator().split(&full) {
        let part = part.trim();
        if !part.is_empty() && !out.iter().any(|p| p.eq_ignore_ascii_case(part)) {
            out.push(part.to_string());
        }
    }
    if !full.is_empty() && !out.iter().any(|p| p.eq_ignore_ascii_case(&full)) {
        out.push(full);
    }
    out
}

fn lcs_len(a: &[char], b: &[char]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let mut prev = vec![0usize; b.len() + 1];
    let mut cur = vec![0usize; b.len() + 1];
    for ca in a {
        for (j, cb) in b.iter().enumerate() {
            cur[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                cur[j].max(prev[j + 1])
            };
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

/// InDel similarity of the normalized strings, 0–100 rounded to an integer.
pub fn ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = normalize(a).chars().collect();
    let b: Vec<char> = normalize(b).chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 100.0;
    }
    let lcs = lcs_len(&a, &b);
    (200.0 * lcs as f64 / total as f64).round()
}

/// True when `a` and `b` look like the same text with a small typo.
pub fn is_typo(a: &str, b: &str) -> bool {
    let (a, b) = (normalize(a), normalize(b));
    a.chars().count() > TYPO_MIN_LEN
        && b.chars().count() > TYPO_MIN_LEN
        && strsim::levenshtein(&a, &b) <= TYPO_MAX_EDITS
}

/// Raise `score` to the typo floor when [`is_typo`] holds.
pub fn typo_boost(a: &str, b: &str, score: f64) -> f64 {
    if is_typo(a, b) {
        score.max(TYPO_BOOST_SCORE)
    } else {
        score
    }
}

/// True when the strings share their token layout but differ in one or more
/// short tokens that are not shorthand for each other.
pub fn is_label_mismatch(a: &str, b: &str) -> bool {
    let (a, b) = (normalize(a), normalize(b));
    let ta: Vec<&str> = a.split_whitespace().collect();
    let tb: Vec<&str> = b.split_whitespace().collect();
    if ta.len() != tb.len() {
        return false;
    }
    let mut differing = ta.iter().zip(tb.iter()).filter(|(x, y)| x != y).peekable();
    if differing.peek().is_none() {
        return false;
    }
    differing.all(|(x, y)| {
        x.chars().count() <= LABEL_TOKEN_MAX_LEN
            && y.chars().count() <= LABEL_TOKEN_MAX_LEN
            && normalize_substitutions(x) != normalize_substitutions(y)
    })
}

/// Ratio with the label guard and typo boost applied.
pub fn similarity(a: &str, b: &str) -> f64 {
    if is_label_mismatch(a, b) {
        return ratio(a, b).min(LABEL_MISMATCH_CAP);
    }
    typo_boost(a, b, ratio(a, b))
}

/// Similarity after rewriting shorthand on both sides.
pub fn substituted_similarity(a: &str, b: &str) -> f64 {
    similarity(&normalize_substitutions(a), &normalize_substitutions(b))
}

/// Either title contains the other, raw or after shorthand rewriting.
pub fn titles_overlap(a: &str, b: &str) -> bool {
    let contains_either =
        |x: &str, y: &str| !x.is_empty() && !y.is_empty() && (x.contains(y) || y.contains(x));
    contains_either(&normalize(a), &normalize(b))
        || contains_either(&normalize_substitutions(a), &normalize_substitutions(b))
}
