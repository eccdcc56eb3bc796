//! Query-term highlighting within chunk text.

use std::collections::BTreeSet;

use serde::Serialize;

const QUERY_STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "is", "it", "of", "on",
    "or", "the", "to", "with",
];

/// A sentence or line of a chunk that matches the query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Highlight {
    /// Byte offsets into the chunk content.
    pub start: usize,
    pub end: usize,
    pub text: String,
    /// Fraction of distinct query terms present in the segment.
    pub score: f32,
}

/// Up to `limit` segments of `content` that share terms with `query`, best
/// first; ties keep document order.
#[must_use]
pub fn highlights(content: &str, query: &str, limit: usize) -> Vec<Highlight> {
    let terms = query_terms(query);
    if terms.is_empty() || limit == 0 {
        return Vec::new();
    }

    #[allow(clippy::cast_precision_loss)]
    let total = terms.len() as f32;

    let mut scored: Vec<Highlight> = segments(content)
        .into_iter()
        .filter_map(|(start, end)| {
            let text = &content[start..end];
            let words = words(text);
            let hits = terms.iter().filter(|t| words.contains(*t)).count();
            #[allow(clippy::cast_precision_loss)]
            let score = hits as f32 / total;
            (hits > 0).then(|| Highlight {
                start,
                end,
                text: text.to_string(),
                score,
            })
        })
        .collect();

    scored.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.start.cmp(&b.start)));
    scored.truncate(limit);
    scored
}

fn words(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn query_terms(query: &str) -> BTreeSet<String> {
    words(query)
        .into_iter()
        .filter(|w| !QUERY_STOPWORDS.contains(&w.as_str()))
        .collect()
}

/// Byte spans of sentences and lines, trimmed of surrounding whitespace.
fn segments(content: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0;
    let mut chars = content.char_indices().peekable();

    while let Some((idx, c)) = chars.next() {
        let boundary = match c {
            '\n' => Some(idx),
            '.' | '!' | '?' => match chars.peek() {
                Some((_, next)) if next.is_whitespace() => Some(idx + c.len_utf8()),
                None => Some(idx + c.len_utf8()),
                _ => None,
            },
            _ => None,
        };
        if let Some(end) = boundary {
            push_trimmed(content, start, end, &mut spans);
            start = end;
        }
    }
    push_trimmed(content, start, content.len(), &mut spans);

    spans
}

fn push_trimmed(content: &str, start: usize, end: usize, spans: &mut Vec<(usize, usize)>) {
    let raw = &content[start..end];
    let lead = raw.len() - raw.trim_start().len();
    let trimmed = raw.trim();
    if !trimmed.is_empty() {
        spans.push((start + lead, start + lead + trimmed.len()));
    }
}
