//! Citation rewriting and quote snippet/context assembly.
//!
//! The finalizer model marks claims with `[[quote:<chunk_id>]]`
//! placeholders. This module rewrites them into user-facing `[k]` markers
//! (first-appearance order, deduplicated, unknown ids stripped), bounds
//! snippets at sentence boundaries, and locates snippets inside the full
//! page text to capture surrounding context.

use std::sync::LazyLock;

use regex::Regex;
use unicode_segmentation::UnicodeSegmentation;
use uuid::Uuid;

/// A snippet starting within this many chars of the page start suppresses
/// `context_before`; symmetrically for the page end and `context_after`.
const EDGE_SUPPRESS_CHARS: usize = 80;

/// Prefix lengths tried when the full snippet is not found verbatim.
const PREFIX_FALLBACK_CHARS: [usize; 3] = [80, 60, 40];

/// Minimum length of an ellipsis-split segment worth searching for.
const MIN_SEGMENT_CHARS: usize = 20;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    // The pattern is fixed; tests cover it.
    Regex::new(r"\[\[quote:([^\]]*)\]\]").unwrap_or_else(|_| unreachable!())
});

/// Result of rewriting citation placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrittenAnswer {
    /// Answer text with `[k]` markers.
    pub text: String,
    /// Cited chunk ids in marker order; `ordered_chunk_ids[k-1]` backs `[k]`.
    pub ordered_chunk_ids: Vec<Uuid>,
}

/// Rewrites `[[quote:<chunk_id>]]` placeholders into `[k]` markers.
///
/// Placeholders are scanned in source order and deduplicated by first
/// appearance; only ids present in `offered` are accepted, everything
/// else is stripped. When the text contains no placeholder at all but
/// evidence was offered, `[1]…[N]` markers for the offered chunks are
/// appended so the answer still carries its citations.
#[must_use]
pub fn rewrite_citations(final_answer: &str, offered: &[Uuid]) -> RewrittenAnswer {
    let mut ordered: Vec<Uuid> = Vec::new();
    let mut saw_placeholder = false;

    let text = PLACEHOLDER
        .replace_all(final_answer, |captures: &regex::Captures<'_>| {
            saw_placeholder = true;
            let raw = captures.get(1).map_or("", |m| m.as_str()).trim();
            let Ok(id) = Uuid::parse_str(raw) else {
                return String::new();
            };
            if !offered.contains(&id) {
                return String::new();
            }
            let order = ordered.iter().position(|&o| o == id).unwrap_or_else(|| {
                ordered.push(id);
                ordered.len() - 1
            });
            format!("[{}]", order + 1)
        })
        .into_owned();

    if !saw_placeholder && !offered.is_empty() {
        let mut text = text.trim_end().to_string();
        text.push(' ');
        for (index, id) in offered.iter().enumerate() {
            text.push_str(&format!("[{}]", index + 1));
            ordered.push(*id);
        }
        return RewrittenAnswer {
            text,
            ordered_chunk_ids: ordered,
        };
    }

    RewrittenAnswer {
        text,
        ordered_chunk_ids: ordered,
    }
}

/// Trims chunk content to a sentence-bounded excerpt of at most
/// `max_chars` characters. When even the first sentence exceeds the cap,
/// it is cut at a character boundary.
#[must_use]
pub fn sentence_snippet(content: &str, max_chars: usize) -> String {
    let trimmed = content.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }

    let mut snippet = String::new();
    let mut used = 0usize;
    for sentence in trimmed.unicode_sentences() {
        let len = sentence.chars().count();
        if used + len > max_chars {
            break;
        }
        snippet.push_str(sentence);
        used += len;
    }

    if snippet.trim().is_empty() {
        return trimmed.chars().take(max_chars).collect::<String>().trim_end().to_string();
    }
    snippet.trim_end().to_string()
}

/// Context captured around a located snippet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnippetContext {
    /// Page text immediately before the snippet, when not at the edge.
    pub before: Option<String>,
    /// Page text immediately after the snippet, when not at the edge.
    pub after: Option<String>,
}

/// Locates `snippet` inside `page` and captures up to `context_chars` of
/// text on each side.
///
/// Location ladder: exact match, then 80/60/40-char snippet prefixes,
/// then ellipsis-split segments of at least 20 chars. `None` when nothing
/// matches. Context on a side is suppressed when the matched text sits
/// within [`EDGE_SUPPRESS_CHARS`] of that page edge.
#[must_use]
pub fn page_context(page: &str, snippet: &str, context_chars: usize) -> Option<SnippetContext> {
    let (start, matched_len) = find_in_page(page, snippet)?;
    let end = start + matched_len;

    let chars_before = page[..start].chars().count();
    let chars_after = page[end..].chars().count();

    let before = if chars_before < EDGE_SUPPRESS_CHARS {
        None
    } else {
        let text: String = page[..start]
            .chars()
            .rev()
            .take(context_chars)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        Some(text.trim_start().to_string())
    };

    let after = if chars_after < EDGE_SUPPRESS_CHARS {
        None
    } else {
        let text: String = page[end..].chars().take(context_chars).collect();
        Some(text.trim_end().to_string())
    };

    Some(SnippetContext { before, after })
}

/// Byte offset and length of the best snippet match in the page.
fn find_in_page(page: &str, snippet: &str) -> Option<(usize, usize)> {
    let needle = snippet.trim();
    if needle.is_empty() {
        return None;
    }

    if let Some(pos) = page.find(needle) {
        return Some((pos, needle.len()));
    }

    for prefix_chars in PREFIX_FALLBACK_CHARS {
        let prefix: String = needle.chars().take(prefix_chars).collect();
        if prefix.chars().count() < prefix_chars {
            // Snippet shorter than this rung; exact match already failed.
            continue;
        }
        if let Some(pos) = page.find(prefix.as_str()) {
            return Some((pos, prefix.len()));
        }
    }

    for segment in needle.split(['…']).flat_map(|part| part.split("...")) {
        let segment = segment.trim();
        if segment.chars().count() < MIN_SEGMENT_CHARS {
            continue;
        }
        if let Some(pos) = page.find(segment) {
            return Some((pos, segment.len()));
        }
    }

    None
}
