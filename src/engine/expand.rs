//! Corpus expander: ranks non-indexed discovered links and emits a page
//! suggestion.
//!
//! Candidates come from the link store, queried per subquery and merged
//! with min-distance dedup, then re-ranked by a lightweight term-match
//! preference: links whose URL, anchor, or derived title contains a
//! content token of the user's question go first, preserving distance
//! order within each partition.

use std::collections::HashMap;
use std::sync::Arc;

use percent_encoding::percent_decode_str;
use uuid::Uuid;

use super::embedding::Embedder;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::model::{DiscoveredLink, Page, PageSuggestion};
use crate::store::Datastore;

/// Recent subqueries folded into the expansion query set.
const MAX_RECENT_SUBQUERIES: usize = 3;

/// Question tokens ignored by the term-match preference.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "did", "do", "does", "for", "from", "had",
    "has", "have", "how", "in", "is", "it", "its", "of", "on", "or", "that", "the", "their",
    "this", "to", "was", "were", "what", "when", "where", "which", "who", "why", "will", "with",
];

/// A ranked link candidate, ready to offer to the decider or the user.
#[derive(Debug, Clone)]
pub struct LinkCandidate {
    /// The underlying discovered link.
    pub link: DiscoveredLink,
    /// Display title: anchor text, or derived from the URL.
    pub title: String,
}

impl LinkCandidate {
    /// Converts the candidate into the suggestion shape persisted on
    /// assistant messages, resolving the discovering page's title.
    #[must_use]
    pub fn into_suggestion(self, page_by_id: &HashMap<Uuid, Page>) -> PageSuggestion {
        let from_page_title = self
            .link
            .from_page_id
            .and_then(|id| page_by_id.get(&id))
            .map(|page| page.title.clone());
        PageSuggestion {
            url: self.link.to_url,
            title: self.title,
            snippet: self.link.snippet,
            source_id: self.link.source_id,
            from_page_title,
        }
    }
}

/// Ranks discovered links against the user's question and recent queries.
pub struct CorpusExpander<'a> {
    store: &'a Arc<dyn Datastore>,
    embedder: &'a Arc<dyn Embedder>,
    config: &'a EngineConfig,
}

impl<'a> CorpusExpander<'a> {
    /// Creates an expander borrowing the engine's collaborators.
    #[must_use]
    pub const fn new(
        store: &'a Arc<dyn Datastore>,
        embedder: &'a Arc<dyn Embedder>,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            config,
        }
    }

    /// Produces ranked link candidates for the given sources.
    ///
    /// Embeds the user message plus up to three recent subqueries, queries
    /// the link store per query, merges with min-distance dedup, and
    /// re-ranks by term-match preference. At most
    /// `link_candidate_cap` candidates are returned.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] on embedding or store failures.
    pub async fn candidates(
        &self,
        source_ids: &[Uuid],
        user_message: &str,
        recent_subqueries: &[String],
    ) -> Result<Vec<LinkCandidate>, EngineError> {
        if source_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut queries: Vec<String> = vec![user_message.to_string()];
        for query in recent_subqueries.iter().take(MAX_RECENT_SUBQUERIES) {
            if !queries.contains(query) {
                queries.push(query.clone());
            }
        }

        let embeddings = self.embedder.embed(&queries).await?;

        // Merge per-query results, keeping the minimum-distance instance
        // of each URL.
        let mut merged: HashMap<String, DiscoveredLink> = HashMap::new();
        for embedding in &embeddings {
            let hits = self
                .store
                .match_discovered_links(embedding, source_ids, self.config.match_links_per_query)
                .await?;
            for hit in hits {
                let keep_existing = merged.get(&hit.to_url).is_some_and(|existing| {
                    existing.distance.unwrap_or(1.0) <= hit.distance.unwrap_or(1.0)
                });
                if !keep_existing {
                    merged.insert(hit.to_url.clone(), hit);
                }
            }
        }

        let mut links: Vec<DiscoveredLink> = merged.into_values().collect();
        links.sort_by(|a, b| {
            a.distance
                .unwrap_or(1.0)
                .total_cmp(&b.distance.unwrap_or(1.0))
        });

        let candidates = rank_by_term_match(links, user_message);
        Ok(candidates
            .into_iter()
            .take(self.config.link_candidate_cap)
            .collect())
    }
}

/// Partitions candidates into term-matching and non-matching groups,
/// matching first, preserving distance order within each partition.
#[must_use]
pub fn rank_by_term_match(links: Vec<DiscoveredLink>, user_query: &str) -> Vec<LinkCandidate> {
    let tokens = content_tokens(user_query);

    let mut matching: Vec<LinkCandidate> = Vec::new();
    let mut rest: Vec<LinkCandidate> = Vec::new();
    for link in links {
        let title = display_title(&link);
        let haystack = format!("{} {} {}", link.to_url, link.anchor_text, title).to_lowercase();
        let is_match = tokens.iter().any(|token| haystack.contains(token));
        let candidate = LinkCandidate { link, title };
        if is_match {
            matching.push(candidate);
        } else {
            rest.push(candidate);
        }
    }
    matching.extend(rest);
    matching
}

/// Stopword-filtered lowercase tokens of the question.
fn content_tokens(query: &str) -> Vec<String> {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(str::to_lowercase)
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// Anchor text when non-empty, else a title derived from the URL.
fn display_title(link: &DiscoveredLink) -> String {
    let anchor = link.anchor_text.trim();
    if anchor.is_empty() {
        derive_title_from_url(&link.to_url)
    } else {
        anchor.to_string()
    }
}

/// Derives a display title from the last non-empty path segment of a URL:
/// percent-decoded, underscores replaced with spaces. When every segment
/// is empty the input URL is returned verbatim.
#[must_use]
pub fn derive_title_from_url(url: &str) -> String {
    let without_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    let without_query = without_scheme
        .split_once(['?', '#'])
        .map_or(without_scheme, |(path, _)| path);

    without_query
        .split('/')
        .skip(1) // host
        .filter(|segment| !segment.is_empty())
        .last()
        .map_or_else(
            || url.to_string(),
            |segment| {
                percent_decode_str(segment)
                    .decode_utf8()
                    .map(|decoded| decoded.replace('_', " "))
                    .unwrap_or_else(|_| segment.replace('_', " "))
            },
        )
}
