//! Identifier validation and name suggestions.
//!
//! Table and column names are interpolated into generated SQL, so every
//! name is checked once when metadata is built. Unknown names found later
//! get "did you mean" suggestions by edit distance.

use std::collections::HashSet;
use std::sync::LazyLock;

/// SQL keywords that cannot be used as bare table or column names.
pub static RESERVED_WORDS: LazyLock<HashSet<&str>> = LazyLock::new(|| {
    [
        "all", "and", "as", "begin", "by", "check", "column", "commit", "create", "default",
        "delete", "distinct", "drop", "from", "group", "having", "in", "index", "insert", "into",
        "is", "join", "key", "limit", "not", "null", "on", "or", "order", "primary", "references",
        "rollback", "select", "set", "table", "transaction", "union", "unique", "update", "values",
        "where",
    ]
    .into_iter()
    .collect()
});

/// Validate a table or column name.
///
/// Accepts ASCII letters, digits and underscores, not starting with a digit,
/// and not a reserved word. Returns the reason on failure.
pub fn validate_identifier(name: &str) -> Result<(), String> {
    let Some(first) = name.chars().next() else {
        return Err("identifier must not be empty".to_string());
    };

    if first.is_ascii_digit() {
        return Err(format!("identifier '{name}' must not start with a digit"));
    }

    if let Some(bad) = name.chars().find(|c| !(c.is_ascii_alphanumeric() || *c == '_')) {
        return Err(format!("identifier '{name}' contains invalid character '{bad}'"));
    }

    if RESERVED_WORDS.contains(name.to_lowercase().as_str()) {
        return Err(format!("identifier '{name}' is a reserved SQL word"));
    }

    Ok(())
}

// ── Levenshtein distance ─────────────────────────────────────

/// Compute the Levenshtein edit distance between two strings.
pub fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let a_len = a.len();
    let b_len = b.len();

    if a_len == 0 {
        return b_len;
    }
    if b_len == 0 {
        return a_len;
    }

    // Use single-row optimization (O(min(m,n)) space)
    let mut prev: Vec<usize> = (0..=b_len).collect();
    let mut curr = vec![0; b_len + 1];

    for i in 1..=a_len {
        curr[0] = i;
        for j in 1..=b_len {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1) // deletion
                .min(curr[j - 1] + 1) // insertion
                .min(prev[j - 1] + cost); // substitution
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b_len]
}

/// Find known names similar to the searched one.
///
/// Returns up to `max` suggestions with edit distance ≤ 3,
/// sorted by distance then alphabetically.
pub fn find_similar_names<'a, I>(searched: &str, known: I, max: usize) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut candidates: Vec<(usize, &str)> = known
        .into_iter()
        .map(|name| (levenshtein_distance(searched, name), name))
        .filter(|(dist, _)| *dist <= 3)
        .collect();

    candidates.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));

    candidates
        .into_iter()
        .take(max)
        .map(|(_, name)| name.to_string())
        .collect()
}
