//! Engine configuration with builder pattern and environment variable support.
//!
//! Configuration is resolved in order: explicit values → environment variables → defaults.

use std::path::PathBuf;
use std::time::Duration;

/// Default maximum reasoning iterations per run.
const DEFAULT_MAX_ITERATIONS: u32 = 6;
/// Default maximum subqueries executed in a single iteration.
const DEFAULT_MAX_SUBQUERIES_PER_ITER: usize = 30;
/// Default maximum subqueries executed across a whole run.
const DEFAULT_MAX_TOTAL_SUBQUERIES: usize = 60;
/// Default maximum corpus-expansion suggestions per thread of questioning.
const DEFAULT_MAX_EXPANSIONS: u32 = 2;
/// Default stagnation threshold: a run stalls when the item delta per
/// iteration drops to this value or below.
const DEFAULT_STAGNATION_THRESHOLD: i64 = 0;
/// Default top-K chunks requested per subquery.
const DEFAULT_MATCH_CHUNKS_PER_QUERY: usize = 12;
/// Default cap on the merged chunk set per iteration.
const DEFAULT_MATCH_CHUNKS_MERGED_CAP: usize = 45;
/// Default top-K discovered links requested per expansion query.
const DEFAULT_MATCH_LINKS_PER_QUERY: usize = 12;
/// Default number of link candidates offered to the decider.
const DEFAULT_LINK_CANDIDATE_CAP: usize = 10;
/// Default cap on evidence chunks offered to the final-answer call.
const DEFAULT_FINAL_ANSWER_CHUNKS_CAP: usize = 24;
/// Default maximum characters for a generated quote snippet.
const DEFAULT_QUOTE_SNIPPET_MAX_CHARS: usize = 280;
/// Default characters of page context captured around a quote.
const DEFAULT_PAGE_CONTEXT_CHARS: usize = 350;
/// Default number of recent conversation messages shown to the decider.
const DEFAULT_LAST_MESSAGES_COUNT: usize = 10;
/// Default LLM request timeout in seconds.
const DEFAULT_LLM_TIMEOUT_SECS: u64 = 90;

/// Configuration for the reasoning engine.
///
/// Budget constants are process-wide and immutable after startup; each
/// request-scoped pipeline reads them but never mutates them.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// LLM provider name (e.g., "openai").
    pub provider: String,
    /// API key for the provider. Absent when only local fakes are in use.
    pub api_key: Option<String>,
    /// Optional base URL override (for proxies or compatible APIs).
    pub base_url: Option<String>,
    /// Model for the planner call.
    pub planner_model: String,
    /// Model for the per-iteration extract/decide call.
    pub extractor_model: String,
    /// Model for the final-answer call.
    pub finalizer_model: String,
    /// Embedding model identifier.
    pub embedding_model: String,
    /// Maximum reasoning iterations per run.
    pub max_iterations: u32,
    /// Maximum subqueries executed in a single iteration.
    pub max_subqueries_per_iter: usize,
    /// Maximum subqueries executed across a whole run.
    pub max_total_subqueries: usize,
    /// Maximum corpus-expansion suggestions per thread of questioning.
    pub max_expansions: u32,
    /// Item delta at or below which an iteration counts as stagnant.
    pub stagnation_threshold: i64,
    /// Top-K chunks requested per subquery.
    pub match_chunks_per_query: usize,
    /// Cap on the merged chunk set admitted per iteration.
    pub match_chunks_merged_cap: usize,
    /// Top-K discovered links requested per expansion query.
    pub match_links_per_query: usize,
    /// Number of link candidates offered to the decider in dynamic mode.
    pub link_candidate_cap: usize,
    /// Cap on evidence chunks offered to the final-answer call.
    pub final_answer_chunks_cap: usize,
    /// Maximum characters for a generated quote snippet.
    pub quote_snippet_max_chars: usize,
    /// Characters of page context captured around a located quote.
    pub page_context_chars: usize,
    /// Recent conversation messages included in the decider prompt.
    pub last_messages_count: usize,
    /// Whether per-slot fill status is attached to progress events.
    pub include_fill_status_by_slot: bool,
    /// Request timeout applied to every LLM and embedding call.
    pub llm_timeout: Duration,
    /// Directory containing prompt template overrides.
    pub prompt_dir: Option<PathBuf>,
}

impl EngineConfig {
    /// Creates a new builder for `EngineConfig`.
    #[must_use]
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Creates configuration from environment variables with defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self::builder().from_env().build()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Builder for [`EngineConfig`].
#[derive(Debug, Clone, Default)]
pub struct EngineConfigBuilder {
    provider: Option<String>,
    api_key: Option<String>,
    base_url: Option<String>,
    planner_model: Option<String>,
    extractor_model: Option<String>,
    finalizer_model: Option<String>,
    embedding_model: Option<String>,
    max_iterations: Option<u32>,
    max_subqueries_per_iter: Option<usize>,
    max_total_subqueries: Option<usize>,
    max_expansions: Option<u32>,
    stagnation_threshold: Option<i64>,
    match_chunks_per_query: Option<usize>,
    match_chunks_merged_cap: Option<usize>,
    match_links_per_query: Option<usize>,
    link_candidate_cap: Option<usize>,
    final_answer_chunks_cap: Option<usize>,
    quote_snippet_max_chars: Option<usize>,
    page_context_chars: Option<usize>,
    last_messages_count: Option<usize>,
    include_fill_status_by_slot: Option<bool>,
    llm_timeout: Option<Duration>,
    prompt_dir: Option<PathBuf>,
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl EngineConfigBuilder {
    /// Populates unset fields from environment variables.
    #[must_use]
    pub fn from_env(mut self) -> Self {
        if self.provider.is_none() {
            self.provider = std::env::var("QUARRY_PROVIDER").ok();
        }
        if self.api_key.is_none() {
            self.api_key = std::env::var("QUARRY_API_KEY")
                .or_else(|_| std::env::var("OPENAI_API_KEY"))
                .ok();
        }
        if self.base_url.is_none() {
            self.base_url = std::env::var("QUARRY_BASE_URL")
                .or_else(|_| std::env::var("OPENAI_BASE_URL"))
                .ok();
        }
        if self.planner_model.is_none() {
            self.planner_model = std::env::var("QUARRY_PLANNER_MODEL").ok();
        }
        if self.extractor_model.is_none() {
            self.extractor_model = std::env::var("QUARRY_EXTRACTOR_MODEL").ok();
        }
        if self.finalizer_model.is_none() {
            self.finalizer_model = std::env::var("QUARRY_FINALIZER_MODEL").ok();
        }
        if self.embedding_model.is_none() {
            self.embedding_model = std::env::var("QUARRY_EMBEDDING_MODEL").ok();
        }
        if self.max_iterations.is_none() {
            self.max_iterations = env_parse("QUARRY_MAX_ITERATIONS");
        }
        if self.max_subqueries_per_iter.is_none() {
            self.max_subqueries_per_iter = env_parse("QUARRY_MAX_SUBQUERIES_PER_ITER");
        }
        if self.max_total_subqueries.is_none() {
            self.max_total_subqueries = env_parse("QUARRY_MAX_TOTAL_SUBQUERIES");
        }
        if self.max_expansions.is_none() {
            self.max_expansions = env_parse("QUARRY_MAX_EXPANSIONS");
        }
        if self.llm_timeout.is_none() {
            self.llm_timeout = env_parse("QUARRY_LLM_TIMEOUT_SECS").map(Duration::from_secs);
        }
        if self.prompt_dir.is_none() {
            self.prompt_dir = std::env::var("QUARRY_PROMPT_DIR").ok().map(PathBuf::from);
        }
        self
    }

    /// Sets the LLM provider name.
    #[must_use]
    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// Sets the API key.
    #[must_use]
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Sets the base URL override.
    #[must_use]
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Sets the planner model.
    #[must_use]
    pub fn planner_model(mut self, model: impl Into<String>) -> Self {
        self.planner_model = Some(model.into());
        self
    }

    /// Sets the extractor model.
    #[must_use]
    pub fn extractor_model(mut self, model: impl Into<String>) -> Self {
        self.extractor_model = Some(model.into());
        self
    }

    /// Sets the finalizer model.
    #[must_use]
    pub fn finalizer_model(mut self, model: impl Into<String>) -> Self {
        self.finalizer_model = Some(model.into());
        self
    }

    /// Sets the embedding model.
    #[must_use]
    pub fn embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = Some(model.into());
        self
    }

    /// Sets the maximum reasoning iterations.
    #[must_use]
    pub const fn max_iterations(mut self, n: u32) -> Self {
        self.max_iterations = Some(n);
        self
    }

    /// Sets the per-iteration subquery budget.
    #[must_use]
    pub const fn max_subqueries_per_iter(mut self, n: usize) -> Self {
        self.max_subqueries_per_iter = Some(n);
        self
    }

    /// Sets the whole-run subquery budget.
    #[must_use]
    pub const fn max_total_subqueries(mut self, n: usize) -> Self {
        self.max_total_subqueries = Some(n);
        self
    }

    /// Sets the maximum corpus expansions.
    #[must_use]
    pub const fn max_expansions(mut self, n: u32) -> Self {
        self.max_expansions = Some(n);
        self
    }

    /// Sets the stagnation threshold.
    #[must_use]
    pub const fn stagnation_threshold(mut self, n: i64) -> Self {
        self.stagnation_threshold = Some(n);
        self
    }

    /// Sets the per-query chunk match count.
    #[must_use]
    pub const fn match_chunks_per_query(mut self, n: usize) -> Self {
        self.match_chunks_per_query = Some(n);
        self
    }

    /// Sets the merged chunk cap per iteration.
    #[must_use]
    pub const fn match_chunks_merged_cap(mut self, n: usize) -> Self {
        self.match_chunks_merged_cap = Some(n);
        self
    }

    /// Sets the per-query link match count.
    #[must_use]
    pub const fn match_links_per_query(mut self, n: usize) -> Self {
        self.match_links_per_query = Some(n);
        self
    }

    /// Sets the number of link candidates offered to the decider.
    #[must_use]
    pub const fn link_candidate_cap(mut self, n: usize) -> Self {
        self.link_candidate_cap = Some(n);
        self
    }

    /// Sets the final-answer evidence cap.
    #[must_use]
    pub const fn final_answer_chunks_cap(mut self, n: usize) -> Self {
        self.final_answer_chunks_cap = Some(n);
        self
    }

    /// Sets the quote snippet character cap.
    #[must_use]
    pub const fn quote_snippet_max_chars(mut self, n: usize) -> Self {
        self.quote_snippet_max_chars = Some(n);
        self
    }

    /// Sets the page context character window.
    #[must_use]
    pub const fn page_context_chars(mut self, n: usize) -> Self {
        self.page_context_chars = Some(n);
        self
    }

    /// Sets the number of recent messages shown to the decider.
    #[must_use]
    pub const fn last_messages_count(mut self, n: usize) -> Self {
        self.last_messages_count = Some(n);
        self
    }

    /// Sets whether fill status per slot is attached to progress events.
    #[must_use]
    pub const fn include_fill_status_by_slot(mut self, on: bool) -> Self {
        self.include_fill_status_by_slot = Some(on);
        self
    }

    /// Sets the LLM request timeout.
    #[must_use]
    pub const fn llm_timeout(mut self, timeout: Duration) -> Self {
        self.llm_timeout = Some(timeout);
        self
    }

    /// Sets the prompt template directory.
    #[must_use]
    pub fn prompt_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.prompt_dir = Some(dir.into());
        self
    }

    /// Builds the [`EngineConfig`].
    #[must_use]
    pub fn build(self) -> EngineConfig {
        EngineConfig {
            provider: self.provider.unwrap_or_else(|| "openai".to_string()),
            api_key: self.api_key,
            base_url: self.base_url,
            planner_model: self
                .planner_model
                .unwrap_or_else(|| "gpt-5.2-2025-12-11".to_string()),
            extractor_model: self
                .extractor_model
                .unwrap_or_else(|| "gpt-5-mini-2025-08-07".to_string()),
            finalizer_model: self
                .finalizer_model
                .unwrap_or_else(|| "gpt-5.2-2025-12-11".to_string()),
            embedding_model: self
                .embedding_model
                .unwrap_or_else(|| "text-embedding-3-small".to_string()),
            max_iterations: self.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS),
            max_subqueries_per_iter: self
                .max_subqueries_per_iter
                .unwrap_or(DEFAULT_MAX_SUBQUERIES_PER_ITER),
            max_total_subqueries: self
                .max_total_subqueries
                .unwrap_or(DEFAULT_MAX_TOTAL_SUBQUERIES),
            max_expansions: self.max_expansions.unwrap_or(DEFAULT_MAX_EXPANSIONS),
            stagnation_threshold: self
                .stagnation_threshold
                .unwrap_or(DEFAULT_STAGNATION_THRESHOLD),
            match_chunks_per_query: self
                .match_chunks_per_query
                .unwrap_or(DEFAULT_MATCH_CHUNKS_PER_QUERY),
            match_chunks_merged_cap: self
                .match_chunks_merged_cap
                .unwrap_or(DEFAULT_MATCH_CHUNKS_MERGED_CAP),
            match_links_per_query: self
                .match_links_per_query
                .unwrap_or(DEFAULT_MATCH_LINKS_PER_QUERY),
            link_candidate_cap: self.link_candidate_cap.unwrap_or(DEFAULT_LINK_CANDIDATE_CAP),
            final_answer_chunks_cap: self
                .final_answer_chunks_cap
                .unwrap_or(DEFAULT_FINAL_ANSWER_CHUNKS_CAP),
            quote_snippet_max_chars: self
                .quote_snippet_max_chars
                .unwrap_or(DEFAULT_QUOTE_SNIPPET_MAX_CHARS),
            page_context_chars: self.page_context_chars.unwrap_or(DEFAULT_PAGE_CONTEXT_CHARS),
            last_messages_count: self
                .last_messages_count
                .unwrap_or(DEFAULT_LAST_MESSAGES_COUNT),
            include_fill_status_by_slot: self.include_fill_status_by_slot.unwrap_or(true),
            llm_timeout: self
                .llm_timeout
                .unwrap_or(Duration::from_secs(DEFAULT_LLM_TIMEOUT_SECS)),
            prompt_dir: self.prompt_dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = EngineConfig::builder().build();
        assert_eq!(config.provider, "openai");
        assert!(config.api_key.is_none());
        assert_eq!(config.max_iterations, 6);
        assert_eq!(config.max_subqueries_per_iter, 30);
        assert_eq!(config.max_total_subqueries, 60);
        assert_eq!(config.max_expansions, 2);
        assert_eq!(config.stagnation_threshold, 0);
        assert_eq!(config.match_chunks_per_query, 12);
        assert_eq!(config.match_chunks_merged_cap, 45);
        assert_eq!(config.quote_snippet_max_chars, 280);
        assert_eq!(config.page_context_chars, 350);
        assert_eq!(config.last_messages_count, 10);
        assert!(config.include_fill_status_by_slot);
    }

    #[test]
    fn test_builder_custom_values() {
        let config = EngineConfig::builder()
            .api_key("key")
            .provider("custom")
            .planner_model("m1")
            .max_iterations(3)
            .max_total_subqueries(12)
            .llm_timeout(Duration::from_secs(5))
            .build();
        assert_eq!(config.provider, "custom");
        assert_eq!(config.api_key.as_deref(), Some("key"));
        assert_eq!(config.planner_model, "m1");
        assert_eq!(config.max_iterations, 3);
        assert_eq!(config.max_total_subqueries, 12);
        assert_eq!(config.llm_timeout, Duration::from_secs(5));
    }
}
