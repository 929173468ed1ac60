//! The iteration controller: drives the retrieve → extract → decide loop.
//!
//! The controller, not the model, enforces termination: iteration and
//! subquery budgets, per-slot gating, stagnation detection, the
//! zero-completeness give-up, and the expansion allowance. Every run ends
//! in exactly one terminal: an answer with citations, a clarify message,
//! an expand-corpus stub, the no-evidence sentence, or a fatal error
//! line.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use super::completeness::{fill_status_by_slot, is_stagnant, overall_score};
use super::context::{AskRequest, NO_PAGES_MESSAGE, RunContext, load_run_context};
use super::embedding::Embedder;
use super::events::{
    DoneEvent, EngineEvent, EventSink, PlanSubqueryView, PlanView, QuoteOut, SlotView, StepEvent,
    SubqueryView, ThoughtProcess, ThoughtStep,
};
use super::expand::{CorpusExpander, LinkCandidate};
use super::extractor::{ClaimDef, ExtractOutput, ExtractorAgent, NextAction};
use super::finalizer::build_final_answer;
use super::planner::{PlanAction, PlannerAgent, SubqueryDef};
use super::prompt::{
    ExtractorContext, PromptSet, SlotLine, build_extractor_prompt, build_planner_prompt,
};
use super::provider::LlmProvider;
use super::select::fair_merge;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::model::{
    Chunk, PageSuggestion, QueryStrategy, Quote, ReasoningStep, Slot, SlotItem, SlotKind,
    StepAction, SubqueryRecord,
};
use crate::store::{Datastore, NewAssistantMessage};

/// The stock sentence when a run ends with zero supporting evidence.
const NO_EVIDENCE_MESSAGE: &str =
    "I couldn't find supporting evidence for this in the indexed pages.";

/// Hard-stop reason when two iterations pass without new items.
const STAGNATION_REASON: &str = "No new claims (stagnation)";

/// The request-scoped reasoning pipeline.
///
/// One instance serves many requests; each [`ReasoningEngine::run`] call
/// is an independent pipeline with no shared mutable state beyond the
/// datastore.
pub struct ReasoningEngine {
    store: Arc<dyn Datastore>,
    provider: Arc<dyn LlmProvider>,
    embedder: Arc<dyn Embedder>,
    config: EngineConfig,
    prompts: PromptSet,
}

/// Per-run mutable state the loop threads through its iterations.
struct RunState {
    slots: Vec<Slot>,
    pool: Vec<Chunk>,
    pool_ids: HashSet<Uuid>,
    executed: HashSet<(String, String)>,
    pending: Vec<SubqueryDef>,
    total_subqueries: usize,
    expansion_count: u32,
    previous_total_items: u64,
    thought: ThoughtProcess,
    question: String,
}

impl RunState {
    fn total_items(&self) -> u64 {
        self.slots
            .iter()
            .map(|s| u64::from(s.current_item_count))
            .sum()
    }

    fn add_chunks(&mut self, chunks: impl IntoIterator<Item = Chunk>) {
        for chunk in chunks {
            if self.pool_ids.insert(chunk.id) {
                self.pool.push(chunk);
            }
        }
    }

    fn slot_by_name(&self, name: &str) -> Option<&Slot> {
        self.slots.iter().find(|s| s.name == name)
    }

    /// The most recent queries of the run, newest first, for the
    /// expander. `extra` carries the current step's queries, which are
    /// not yet folded into the thought trace.
    fn recent_queries(&self, extra: &[SubqueryDef]) -> Vec<String> {
        extra
            .iter()
            .rev()
            .map(|sq| sq.query.clone())
            .chain(
                self.thought
                    .steps
                    .iter()
                    .rev()
                    .flat_map(|step| step.subqueries.iter().rev())
                    .map(|sq| sq.query.clone()),
            )
            .take(3)
            .collect()
    }
}

impl ReasoningEngine {
    /// Creates an engine over its collaborators. Prompt templates are
    /// resolved once, at construction.
    #[must_use]
    pub fn new(
        store: Arc<dyn Datastore>,
        provider: Arc<dyn LlmProvider>,
        embedder: Arc<dyn Embedder>,
        config: EngineConfig,
    ) -> Self {
        let prompts = PromptSet::load(config.prompt_dir.as_deref());
        Self {
            store,
            provider,
            embedder,
            config,
            prompts,
        }
    }

    /// Runs one reasoning pipeline, streaming progress into `events`.
    ///
    /// Every failure mode ends the stream with a single `{error}` line;
    /// everything else ends with `{done}`.
    pub async fn run(&self, request: AskRequest, events: EventSink) {
        if let Err(err) = self.run_inner(&request, &events).await {
            tracing::warn!(error = %err, "reasoning run failed");
            events
                .emit(EngineEvent::Error {
                    error: err.to_string(),
                })
                .await;
        }
    }

    async fn run_inner(
        &self,
        request: &AskRequest,
        events: &EventSink,
    ) -> Result<(), EngineError> {
        let run = load_run_context(&self.store, request).await?;

        if run.pages.is_empty() {
            return self.finish_no_pages(&run, events).await;
        }

        let Some(mut state) = self.plan_run(&run, request, events).await? else {
            // The planner chose clarify; the run already terminated.
            return Ok(());
        };

        for iteration in 1..=self.config.max_iterations {
            let step_queries = self.gate_subqueries(&mut state);
            let retrieved_counts = self.retrieve(&run, &mut state, &step_queries).await?;
            self.record_step_subqueries(&run, iteration, &step_queries, &state)
                .await;

            let candidates = self
                .offer_candidates(&run, &state, request, &step_queries)
                .await;
            let extract = self.extract(&run, &state, &candidates).await?;

            let accepted = self.record_claims(&state, &extract.claims).await?;
            self.bookkeep_slots(&run, &mut state, &step_queries, &extract)
                .await?;

            let completeness = overall_score(&state.slots);
            let action = step_action(extract.next_action);

            self.persist_step(&run, iteration, action, &extract.why, completeness)
                .await;
            push_thought_step(
                &mut state,
                iteration,
                action,
                &extract,
                &step_queries,
                &retrieved_counts,
                accepted,
                completeness,
            );
            self.emit_progress(events, &state, iteration, action, &extract, accepted, completeness)
                .await;

            match extract.next_action {
                NextAction::Answer => {
                    return self.finish_answer(&run, request, &mut state, events).await;
                }
                NextAction::Clarify => {
                    return self
                        .finish_clarify(&run, request, &mut state, &extract, events)
                        .await;
                }
                NextAction::ExpandCorpus => {
                    match self
                        .handle_expand(&run, request, &mut state, &extract, &candidates, events)
                        .await?
                    {
                        ExpandOutcome::Terminated => return Ok(()),
                        ExpandOutcome::OverriddenToRetrieve => {}
                    }
                }
                NextAction::Retrieve => {
                    let current_total = state.total_items();
                    if state.total_subqueries >= self.config.max_total_subqueries {
                        return self
                            .hard_stop(&run, request, &mut state, events, "Subquery budget exhausted")
                            .await;
                    }
                    if iteration >= 2
                        && is_stagnant(
                            current_total,
                            state.previous_total_items,
                            self.config.stagnation_threshold,
                        )
                    {
                        return self
                            .hard_stop(&run, request, &mut state, events, STAGNATION_REASON)
                            .await;
                    }
                    if completeness <= 0.0 {
                        return self
                            .hard_stop(
                                &run,
                                request,
                                &mut state,
                                events,
                                "No supporting evidence found",
                            )
                            .await;
                    }
                    state.previous_total_items = current_total;
                    state.pending = extract.subqueries;
                }
            }
        }

        self.hard_stop(&run, request, &mut state, events, "Iteration budget exhausted")
            .await
    }

    // ── planning ──────────────────────────────────────────────────────

    /// Plans the run (or rehydrates a previous plan in append mode),
    /// persists the slot graph, and emits the plan event. Returns `None`
    /// when the planner chose clarify and the run already terminated.
    async fn plan_run(
        &self,
        run: &RunContext,
        request: &AskRequest,
        events: &EventSink,
    ) -> Result<Option<RunState>, EngineError> {
        let question = request.user_message.clone();

        if let Some(rehydrated) = run.rehydrated.as_ref().filter(|r| !r.slots.is_empty()) {
            let slots = rehydrated.slots.clone();
            let pending = subquery_defs(&rehydrated.initial_subqueries, &slots);
            let plan_reason = "Re-running the plan against the expanded corpus".to_string();
            let state = init_state(run, slots, pending, plan_reason.clone(), question);
            events
                .emit(EngineEvent::Plan {
                    plan: plan_view(&state.slots, &state.pending, "retrieve", &plan_reason),
                })
                .await;
            return Ok(Some(state));
        }

        let planner = PlannerAgent::new(&self.config, self.prompts.planner.clone());
        let page_titles: Vec<String> = run.pages.iter().map(|p| p.title.clone()).collect();
        let user_msg = build_planner_prompt(&question, &page_titles);
        let (plan, _response) = planner
            .plan(&*self.provider, &user_msg, &question, self.config.llm_timeout)
            .await?;

        self.persist_step(run, 0, StepAction::Plan, &plan.why, 0.0).await;

        if plan.action == PlanAction::Clarify {
            let questions = if plan.questions.is_empty() {
                vec![plan.why.clone()]
            } else {
                plan.questions.clone()
            };
            events
                .emit(EngineEvent::Plan {
                    plan: plan_view(&[], &[], "clarify", &plan.why),
                })
                .await;
            let mut thought = ThoughtProcess {
                plan_reason: plan.why.clone(),
                ..ThoughtProcess::default()
            };
            thought.clarify_questions.clone_from(&questions);
            self.terminate_clarify(run, request, thought, questions, events)
                .await?;
            return Ok(None);
        }

        let (slots, records) = plan.materialize(run.root_message_id);
        for slot in &slots {
            self.store.insert_slot(slot).await?;
        }
        self.store
            .insert_subqueries(run.root_message_id, 0, &records)
            .await?;

        let pending = subquery_defs(&records, &slots);
        let state = init_state(run, slots, pending, plan.why.clone(), question);
        events
            .emit(EngineEvent::Plan {
                plan: plan_view(&state.slots, &state.pending, plan.action.as_str(), &plan.why),
            })
            .await;
        Ok(Some(state))
    }

    // ── the loop's stages ─────────────────────────────────────────────

    /// Filters the pending subqueries down to the ones still worth
    /// running, then truncates to the remaining budgets.
    fn gate_subqueries(&self, state: &mut RunState) -> Vec<SubqueryDef> {
        let pending = std::mem::take(&mut state.pending);
        let mut gated: Vec<SubqueryDef> = Vec::new();

        for subquery in pending {
            let Some(slot) = state.slot_by_name(&subquery.slot) else {
                tracing::warn!(slot = %subquery.slot, "dropping subquery for unknown slot");
                continue;
            };
            if slot.finished_querying || slot.is_satisfied() {
                continue;
            }
            if let Some(parent_id) = slot.depends_on_slot_id {
                let parent_items = state
                    .slots
                    .iter()
                    .find(|s| s.id == parent_id)
                    .map_or(0, |s| s.current_item_count);
                if parent_items == 0 {
                    continue;
                }
            }
            let key = (subquery.slot.clone(), subquery.query.clone());
            if state.executed.contains(&key) {
                continue;
            }
            if gated
                .iter()
                .any(|g| g.slot == subquery.slot && g.query == subquery.query)
            {
                continue;
            }
            gated.push(subquery);
        }

        let per_iter = self.config.max_subqueries_per_iter;
        let remaining_total = self
            .config
            .max_total_subqueries
            .saturating_sub(state.total_subqueries);
        gated.truncate(per_iter.min(remaining_total));
        gated
    }

    /// Embeds and matches chunks for every subquery, merges them under
    /// the fair-allocation cap, and folds the result plus the lead chunks
    /// into the evidence pool. Returns the per-query hit counts.
    async fn retrieve(
        &self,
        run: &RunContext,
        state: &mut RunState,
        step_queries: &[SubqueryDef],
    ) -> Result<Vec<usize>, EngineError> {
        state.add_chunks(run.lead_chunks.iter().cloned());

        if step_queries.is_empty() {
            return Ok(Vec::new());
        }

        let texts: Vec<String> = step_queries.iter().map(|sq| sq.query.clone()).collect();
        let embeddings = self.embedder.embed(&texts).await?;

        let page_ids = run.page_ids();
        let mut per_query: Vec<Vec<Chunk>> = Vec::with_capacity(embeddings.len());
        for embedding in &embeddings {
            let hits = self
                .store
                .match_chunks(embedding, &page_ids, self.config.match_chunks_per_query)
                .await?;
            per_query.push(hits);
        }
        let counts: Vec<usize> = per_query.iter().map(Vec::len).collect();

        let merged = fair_merge(&per_query, self.config.match_chunks_merged_cap);
        state.add_chunks(merged);

        for subquery in step_queries {
            state
                .executed
                .insert((subquery.slot.clone(), subquery.query.clone()));
        }
        state.total_subqueries += step_queries.len();

        Ok(counts)
    }

    /// Persists the subqueries one iteration actually executed.
    async fn record_step_subqueries(
        &self,
        run: &RunContext,
        iteration: u32,
        step_queries: &[SubqueryDef],
        state: &RunState,
    ) {
        if step_queries.is_empty() {
            return;
        }
        let id_by_name: HashMap<&str, Uuid> =
            state.slots.iter().map(|s| (s.name.as_str(), s.id)).collect();
        let records: Vec<SubqueryRecord> = step_queries
            .iter()
            .map(|sq| SubqueryRecord {
                slot_id: id_by_name.get(sq.slot.as_str()).copied(),
                query_text: sq.query.clone(),
                strategy: sq.strategy,
            })
            .collect();
        if let Err(err) = self
            .store
            .insert_subqueries(run.root_message_id, iteration, &records)
            .await
        {
            // Trace only; never affects user-visible state.
            tracing::warn!(error = %err, "subquery trace insert failed");
        }
    }

    /// Fetches link candidates for the decider when the conversation is
    /// in dynamic-source mode. Failures degrade to no candidates.
    async fn offer_candidates(
        &self,
        run: &RunContext,
        state: &RunState,
        request: &AskRequest,
        step_queries: &[SubqueryDef],
    ) -> Vec<LinkCandidate> {
        if !run.conversation.dynamic_sources {
            return Vec::new();
        }
        let expander = CorpusExpander::new(&self.store, &self.embedder, &self.config);
        match expander
            .candidates(
                &run.source_ids(),
                &request.user_message,
                &state.recent_queries(step_queries),
            )
            .await
        {
            Ok(candidates) => candidates,
            Err(err) => {
                tracing::warn!(error = %err, "link candidate fetch failed; offering none");
                Vec::new()
            }
        }
    }

    /// Runs the extract/decide call with the current slot and evidence
    /// state.
    async fn extract(
        &self,
        run: &RunContext,
        state: &RunState,
        candidates: &[LinkCandidate],
    ) -> Result<ExtractOutput, EngineError> {
        let slot_state = self.structured_state(&state.slots).await?;

        let slot_name_by_id: HashMap<Uuid, &str> = state
            .slots
            .iter()
            .map(|s| (s.id, s.name.as_str()))
            .collect();
        let slot_lines: Vec<SlotLine> = state
            .slots
            .iter()
            .map(|slot| SlotLine {
                name: slot.name.clone(),
                kind: slot.kind.as_str(),
                description: slot.description.clone(),
                target: slot.target_item_count,
                count: slot.current_item_count,
                depends_on: slot
                    .depends_on_slot_id
                    .and_then(|id| slot_name_by_id.get(&id).map(|&n| n.to_string())),
            })
            .collect();

        let finished: Vec<String> = state
            .slots
            .iter()
            .filter(|s| s.finished_querying)
            .map(|s| s.name.clone())
            .collect();
        let broad: Vec<String> = state
            .slots
            .iter()
            .filter(|s| s.is_broad())
            .map(|s| s.name.clone())
            .collect();
        let previous_attempts: Vec<String> = state
            .slots
            .iter()
            .filter(|s| !s.is_satisfied() && s.attempt_count > 0 && !s.last_queries.is_empty())
            .map(|s| format!("{}: {}", s.name, s.last_queries.join(" | ")))
            .collect();

        let history = self
            .store
            .recent_messages(run.conversation.id, self.config.last_messages_count)
            .await?
            .into_iter()
            .filter(|m| !m.content.is_empty())
            .map(|m| format!("{}: {}", m.role.as_str(), m.content))
            .collect();

        let context = ExtractorContext {
            question: state.question.clone(),
            history,
            slots: slot_lines,
            finished_slots: finished,
            broad_slots: broad,
            slot_state,
            previous_attempts,
            candidate_pages: candidates
                .iter()
                .map(|c| c.clone().into_suggestion(&run.page_by_id))
                .collect(),
        };

        let agent = ExtractorAgent::new(&self.config, self.prompts.extractor.clone());
        let user_msg = build_extractor_prompt(&context, &state.pool);
        let evidence_ids: Vec<Uuid> = state.pool.iter().map(|c| c.id).collect();
        let (output, _response) = agent
            .execute_and_parse(
                &*self.provider,
                &user_msg,
                &evidence_ids,
                self.config.llm_timeout,
            )
            .await?;
        Ok(output)
    }

    /// The structured slot state handed to the extractor and finalizer:
    /// `{slot_name: {type, items: [{key?, value}]}}`.
    async fn structured_state(&self, slots: &[Slot]) -> Result<Value, EngineError> {
        let mut state = serde_json::Map::new();
        for slot in slots {
            let items = self.store.slot_items(slot.id).await?;
            let rendered: Vec<Value> = items
                .iter()
                .map(|item| {
                    let mut entry = serde_json::Map::new();
                    if let Some(key) = &item.key {
                        entry.insert("key".to_string(), Value::String(key.clone()));
                    }
                    entry.insert("value".to_string(), item.value.clone());
                    Value::Object(entry)
                })
                .collect();
            state.insert(
                slot.name.clone(),
                serde_json::json!({
                    "type": slot.kind.as_str(),
                    "items": rendered,
                }),
            );
        }
        Ok(Value::Object(state))
    }

    /// Records accepted claims, enforcing mapping-key admissibility.
    /// Returns the number of claims that survived.
    async fn record_claims(
        &self,
        state: &RunState,
        claims: &[ClaimDef],
    ) -> Result<usize, EngineError> {
        let allowed_keys = self.allowed_mapping_keys(&state.slots).await?;

        let mut accepted = 0usize;
        for claim in claims {
            let Some(slot) = state.slot_by_name(&claim.slot) else {
                tracing::warn!(slot = %claim.slot, "dropping claim for unknown slot");
                continue;
            };

            let key = match slot.kind {
                SlotKind::Mapping => {
                    let Some(key) = claim.key.as_deref() else {
                        tracing::debug!(slot = %slot.name, "dropping mapping claim without key");
                        continue;
                    };
                    let admissible = allowed_keys
                        .get(&slot.id)
                        .is_some_and(|keys| keys.iter().any(|k| k == key));
                    if !admissible {
                        tracing::debug!(slot = %slot.name, key, "dropping mapping claim with inadmissible key");
                        continue;
                    }
                    Some(key.to_string())
                }
                SlotKind::Scalar | SlotKind::List => None,
            };

            let item = SlotItem {
                id: Uuid::new_v4(),
                slot_id: slot.id,
                key,
                value: claim.value.clone(),
                confidence: claim.confidence,
                complete: true,
            };
            let item_id = self.store.upsert_slot_item(&item).await?;
            for chunk_id in &claim.chunk_ids {
                self.store.upsert_claim_evidence(item_id, *chunk_id).await?;
            }
            accepted += 1;
        }
        Ok(accepted)
    }

    /// Admissible mapping keys: for each mapping slot, the current values
    /// of its parent list, recomputed every step.
    async fn allowed_mapping_keys(
        &self,
        slots: &[Slot],
    ) -> Result<HashMap<Uuid, Vec<String>>, EngineError> {
        let mut allowed: HashMap<Uuid, Vec<String>> = HashMap::new();
        for slot in slots.iter().filter(|s| s.kind == SlotKind::Mapping) {
            let Some(parent_id) = slot.depends_on_slot_id else {
                continue;
            };
            let parent_items = self.store.slot_items(parent_id).await?;
            allowed.insert(
                slot.id,
                parent_items
                    .iter()
                    .map(|item| value_as_key(&item.value))
                    .collect(),
            );
        }
        Ok(allowed)
    }

    /// Refreshes slot counts and updates attempts/finished flags for the
    /// slots that had subqueries this step.
    async fn bookkeep_slots(
        &self,
        run: &RunContext,
        state: &mut RunState,
        step_queries: &[SubqueryDef],
        extract: &ExtractOutput,
    ) -> Result<(), EngineError> {
        let previous_counts: HashMap<Uuid, u32> = state
            .slots
            .iter()
            .map(|s| (s.id, s.current_item_count))
            .collect();
        let was_broad: HashSet<String> = state
            .slots
            .iter()
            .filter(|s| s.is_broad())
            .map(|s| s.name.clone())
            .collect();

        state.slots = self.store.list_slots(run.root_message_id).await?;

        for asserted in &extract.broad_completed {
            if !was_broad.contains(asserted) {
                // Advisory only: the decider cannot finish a slot that was
                // not in its broad pass this step.
                tracing::warn!(slot = %asserted, "ignoring broad-completion assertion for non-broad slot");
            }
        }

        let mut queries_by_slot: HashMap<&str, Vec<String>> = HashMap::new();
        for subquery in step_queries {
            queries_by_slot
                .entry(subquery.slot.as_str())
                .or_default()
                .push(subquery.query.clone());
        }

        for (slot_name, queries) in queries_by_slot {
            let Some(slot) = state.slots.iter().find(|s| s.name == slot_name) else {
                continue;
            };
            let asserted_complete = was_broad.contains(slot_name)
                && extract.broad_completed.iter().any(|n| n == slot_name);
            let count_unchanged = previous_counts
                .get(&slot.id)
                .is_some_and(|&before| before == slot.current_item_count);
            let finished = asserted_complete || count_unchanged;
            self.store
                .update_slot_attempt(slot.id, &queries, finished)
                .await?;
        }

        // Reload once more so attempt counts and finished flags are fresh.
        state.slots = self.store.list_slots(run.root_message_id).await?;
        Ok(())
    }

    // ── progress plumbing ─────────────────────────────────────────────

    async fn persist_step(
        &self,
        run: &RunContext,
        iteration: u32,
        action: StepAction,
        why: &str,
        completeness: f32,
    ) {
        let step = ReasoningStep {
            root_message_id: run.root_message_id,
            iteration,
            action,
            why: why.to_string(),
            completeness_score: completeness,
        };
        if let Err(err) = self.store.upsert_reasoning_step(&step).await {
            tracing::warn!(error = %err, "reasoning step insert failed");
        }
        if let Err(err) = self
            .store
            .append_run_log(run.root_message_id, iteration, action, why, completeness)
            .await
        {
            // Diagnostics only; never affects user-visible state.
            tracing::warn!(error = %err, "run log insert failed");
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn emit_progress(
        &self,
        events: &EventSink,
        state: &RunState,
        iteration: u32,
        action: StepAction,
        extract: &ExtractOutput,
        accepted_claims: usize,
        completeness: f32,
    ) {
        let fill = if self.config.include_fill_status_by_slot {
            Some(fill_status_by_slot(&state.slots))
        } else {
            None
        };
        events
            .emit(EngineEvent::Step(StepEvent {
                step: iteration,
                total_steps: self.config.max_iterations,
                iter: iteration,
                action: action.as_str().to_string(),
                label: step_label(action).to_string(),
                why: (!extract.why.is_empty()).then(|| extract.why.clone()),
                quotes_found: state.pool.len(),
                claims: accepted_claims,
                completeness,
                fill_status_by_slot: fill,
            }))
            .await;
        events
            .emit(EngineEvent::Thought {
                thought_process: state.thought.clone(),
            })
            .await;
    }

    // ── terminals ─────────────────────────────────────────────────────

    async fn finish_no_pages(
        &self,
        run: &RunContext,
        events: &EventSink,
    ) -> Result<(), EngineError> {
        self.store
            .insert_assistant_message(NewAssistantMessage {
                conversation_id: run.conversation.id,
                content: NO_PAGES_MESSAGE.to_string(),
                thought_process: None,
                suggested_page: None,
                scraped_page_display: None,
                follows_message_id: run.follows_message_id,
            })
            .await?;
        events
            .emit(EngineEvent::Done(DoneEvent {
                done: true,
                message: NO_PAGES_MESSAGE.to_string(),
                quotes: Vec::new(),
                suggested_page: None,
                suggested_title: None,
                thought_process: None,
            }))
            .await;
        Ok(())
    }

    async fn finish_answer(
        &self,
        run: &RunContext,
        request: &AskRequest,
        state: &mut RunState,
        events: &EventSink,
    ) -> Result<(), EngineError> {
        let slot_state = self.structured_state(&state.slots).await?;
        let thought_value = serde_json::to_value(&state.thought).unwrap_or(Value::Null);
        let built = build_final_answer(
            &self.store,
            &*self.provider,
            &self.config,
            self.prompts.finalizer.clone(),
            run,
            &state.question,
            &slot_state,
            &state.pool,
            thought_value,
            request.scraped_page_display.clone(),
        )
        .await?;

        events
            .emit(EngineEvent::Done(DoneEvent {
                done: true,
                message: built.message.content.clone(),
                quotes: quotes_out(&built.quotes, run),
                suggested_page: None,
                suggested_title: None,
                thought_process: Some(state.thought.clone()),
            }))
            .await;
        Ok(())
    }

    async fn finish_clarify(
        &self,
        run: &RunContext,
        request: &AskRequest,
        state: &mut RunState,
        extract: &ExtractOutput,
        events: &EventSink,
    ) -> Result<(), EngineError> {
        let questions = if extract.questions.is_empty() {
            vec!["Could you clarify what you are looking for?".to_string()]
        } else {
            extract.questions.clone()
        };
        state.thought.clarify_questions.clone_from(&questions);
        let thought = state.thought.clone();
        self.terminate_clarify(run, request, thought, questions, events)
            .await
    }

    async fn terminate_clarify(
        &self,
        run: &RunContext,
        request: &AskRequest,
        thought: ThoughtProcess,
        questions: Vec<String>,
        events: &EventSink,
    ) -> Result<(), EngineError> {
        let content = questions.join("\n");
        self.store
            .insert_assistant_message(NewAssistantMessage {
                conversation_id: run.conversation.id,
                content: content.clone(),
                thought_process: Some(serde_json::to_value(&thought).unwrap_or(Value::Null)),
                suggested_page: None,
                scraped_page_display: request.scraped_page_display.clone(),
                follows_message_id: run.follows_message_id,
            })
            .await?;

        events
            .emit(EngineEvent::Clarify {
                clarify: true,
                questions,
            })
            .await;
        events
            .emit(EngineEvent::Done(DoneEvent {
                done: true,
                message: content,
                quotes: Vec::new(),
                suggested_page: None,
                suggested_title: None,
                thought_process: Some(thought),
            }))
            .await;
        Ok(())
    }

    /// Handles the expand-corpus decision per the override rules.
    async fn handle_expand(
        &self,
        run: &RunContext,
        request: &AskRequest,
        state: &mut RunState,
        extract: &ExtractOutput,
        candidates: &[LinkCandidate],
        events: &EventSink,
    ) -> Result<ExpandOutcome, EngineError> {
        // A dependent slot with unfilled items under a non-empty parent
        // means retrieval still has obvious work; expansion is premature.
        if let Some(fallbacks) = self.dependent_gap_fallbacks(state).await? {
            tracing::debug!("overriding expand_corpus: dependent slots still have gaps");
            state.previous_total_items = state.total_items();
            state.pending = fallbacks;
            return Ok(ExpandOutcome::OverriddenToRetrieve);
        }

        if state.expansion_count >= self.config.max_expansions {
            state.thought.partial_answer_note =
                Some("Expansion budget exhausted; answering with the evidence at hand".to_string());
            self.finish_answer(run, request, state, events).await?;
            return Ok(ExpandOutcome::Terminated);
        }

        let picked = self
            .pick_candidate(run, request, state, candidates, extract.suggested_page_index)
            .await;
        let Some(suggestion) = picked else {
            // Nothing to suggest; close out like a retrieve hard stop.
            self.hard_stop(run, request, state, events, "No expansion candidates found")
                .await?;
            return Ok(ExpandOutcome::Terminated);
        };

        state.expansion_count += 1;
        state.thought.expand_corpus_reason = Some(if extract.why.is_empty() {
            "The indexed pages are unlikely to contain this".to_string()
        } else {
            extract.why.clone()
        });

        let content = format!(
            "The indexed pages don't seem to cover this. Adding \"{}\" to the corpus could help. Want me to include it and try again?",
            suggestion.title
        );
        self.store
            .insert_assistant_message(NewAssistantMessage {
                conversation_id: run.conversation.id,
                content: content.clone(),
                thought_process: Some(serde_json::to_value(&state.thought).unwrap_or(Value::Null)),
                suggested_page: Some(serde_json::to_value(&suggestion).unwrap_or(Value::Null)),
                scraped_page_display: request.scraped_page_display.clone(),
                follows_message_id: run.follows_message_id,
            })
            .await?;

        events
            .emit(EngineEvent::Done(DoneEvent {
                done: true,
                message: content,
                quotes: Vec::new(),
                suggested_title: Some(suggestion.title.clone()),
                suggested_page: Some(suggestion),
                thought_process: Some(state.thought.clone()),
            }))
            .await;
        Ok(ExpandOutcome::Terminated)
    }

    /// When a dependent slot still has unfilled items under a non-empty
    /// parent, synthesises targeted fallback subqueries from the slot
    /// description and the missing keys.
    async fn dependent_gap_fallbacks(
        &self,
        state: &RunState,
    ) -> Result<Option<Vec<SubqueryDef>>, EngineError> {
        let mut fallbacks: Vec<SubqueryDef> = Vec::new();
        for slot in &state.slots {
            let Some(parent_id) = slot.depends_on_slot_id else {
                continue;
            };
            if slot.finished_querying || slot.is_satisfied() {
                continue;
            }
            let parent_items = self.store.slot_items(parent_id).await?;
            if parent_items.is_empty() {
                continue;
            }
            let own_items = self.store.slot_items(slot.id).await?;
            for parent_item in &parent_items {
                let key = value_as_key(&parent_item.value);
                let held = own_items
                    .iter()
                    .filter(|item| item.key.as_deref() == Some(key.as_str()))
                    .count();
                if held < slot.items_per_key as usize {
                    fallbacks.push(SubqueryDef {
                        slot: slot.name.clone(),
                        query: format!("{key} {}", slot.description),
                        strategy: QueryStrategy::Targeted,
                    });
                }
            }
        }
        Ok((!fallbacks.is_empty()).then_some(fallbacks))
    }

    /// Resolves the suggested page: the decider's 1-based pick into the
    /// offered candidates (out of range falls back to the first), or a
    /// fresh candidate fetch when none were offered.
    async fn pick_candidate(
        &self,
        run: &RunContext,
        request: &AskRequest,
        state: &RunState,
        offered: &[LinkCandidate],
        suggested_index: Option<usize>,
    ) -> Option<PageSuggestion> {
        let pick_from = |candidates: &[LinkCandidate]| -> Option<PageSuggestion> {
            if candidates.is_empty() {
                return None;
            }
            let index = suggested_index
                .filter(|&i| i >= 1 && i <= candidates.len())
                .unwrap_or(1);
            candidates
                .get(index - 1)
                .map(|c| c.clone().into_suggestion(&run.page_by_id))
        };

        if !offered.is_empty() {
            return pick_from(offered);
        }

        let expander = CorpusExpander::new(&self.store, &self.embedder, &self.config);
        match expander
            .candidates(
                &run.source_ids(),
                &request.user_message,
                &state.recent_queries(&[]),
            )
            .await
        {
            Ok(candidates) => pick_from(&candidates),
            Err(err) => {
                tracing::warn!(error = %err, "candidate fetch for suggestion failed");
                None
            }
        }
    }

    /// The hard-stop terminal: attach a suggestion in dynamic mode,
    /// otherwise answer from partial evidence, or emit the stock
    /// no-evidence sentence when nothing was found.
    async fn hard_stop(
        &self,
        run: &RunContext,
        request: &AskRequest,
        state: &mut RunState,
        events: &EventSink,
        reason: &str,
    ) -> Result<(), EngineError> {
        state.thought.hard_stop_reason = Some(reason.to_string());
        events
            .emit(EngineEvent::Thought {
                thought_process: state.thought.clone(),
            })
            .await;

        if run.conversation.dynamic_sources && state.expansion_count < self.config.max_expansions {
            let picked = self.pick_candidate(run, request, state, &[], None).await;
            if let Some(suggestion) = picked {
                state.expansion_count += 1;
                let content = format!(
                    "I couldn't find enough in the indexed pages. Adding \"{}\" could help. Want me to include it and try again?",
                    suggestion.title
                );
                self.store
                    .insert_assistant_message(NewAssistantMessage {
                        conversation_id: run.conversation.id,
                        content: content.clone(),
                        thought_process: Some(
                            serde_json::to_value(&state.thought).unwrap_or(Value::Null),
                        ),
                        suggested_page: Some(
                            serde_json::to_value(&suggestion).unwrap_or(Value::Null),
                        ),
                        scraped_page_display: request.scraped_page_display.clone(),
                        follows_message_id: run.follows_message_id,
                    })
                    .await?;
                events
                    .emit(EngineEvent::Done(DoneEvent {
                        done: true,
                        message: content,
                        quotes: Vec::new(),
                        suggested_title: Some(suggestion.title.clone()),
                        suggested_page: Some(suggestion),
                        thought_process: Some(state.thought.clone()),
                    }))
                    .await;
                return Ok(());
            }
        }

        if overall_score(&state.slots) > 0.0 {
            state.thought.partial_answer_note = Some(format!("Stopped early: {reason}"));
            return self.finish_answer(run, request, state, events).await;
        }

        self.store
            .insert_assistant_message(NewAssistantMessage {
                conversation_id: run.conversation.id,
                content: NO_EVIDENCE_MESSAGE.to_string(),
                thought_process: Some(serde_json::to_value(&state.thought).unwrap_or(Value::Null)),
                suggested_page: None,
                scraped_page_display: request.scraped_page_display.clone(),
                follows_message_id: run.follows_message_id,
            })
            .await?;
        events
            .emit(EngineEvent::Done(DoneEvent {
                done: true,
                message: NO_EVIDENCE_MESSAGE.to_string(),
                quotes: Vec::new(),
                suggested_page: None,
                suggested_title: None,
                thought_process: Some(state.thought.clone()),
            }))
            .await;
        Ok(())
    }
}

fn init_state(
    run: &RunContext,
    slots: Vec<Slot>,
    pending: Vec<SubqueryDef>,
    plan_reason: String,
    question: String,
) -> RunState {
    let previous_total_items = slots.iter().map(|s| u64::from(s.current_item_count)).sum();
    let thought = ThoughtProcess {
        slots: slot_views(&slots),
        plan_reason,
        ..ThoughtProcess::default()
    };
    RunState {
        slots,
        pool: Vec::new(),
        pool_ids: HashSet::new(),
        executed: HashSet::new(),
        pending,
        total_subqueries: 0,
        expansion_count: run.expansion_count,
        previous_total_items,
        thought,
        question,
    }
}

/// Outcome of the expand-corpus branch.
enum ExpandOutcome {
    /// The run ended (stub persisted or forced answer).
    Terminated,
    /// Retrieval still had obvious gaps; the loop continues.
    OverriddenToRetrieve,
}

const fn step_action(next: NextAction) -> StepAction {
    match next {
        NextAction::Retrieve => StepAction::Retrieve,
        NextAction::Answer => StepAction::Answer,
        NextAction::ExpandCorpus => StepAction::ExpandCorpus,
        NextAction::Clarify => StepAction::Clarify,
    }
}

const fn step_label(action: StepAction) -> &'static str {
    match action {
        StepAction::Plan => "Planning",
        StepAction::Retrieve => "Searching the corpus",
        StepAction::Answer => "Writing the answer",
        StepAction::ExpandCorpus => "Suggesting a new page",
        StepAction::Clarify => "Asking for clarification",
    }
}

/// Renders a slot item value as a mapping key: strings verbatim,
/// everything else as compact JSON.
fn value_as_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn slot_views(slots: &[Slot]) -> Vec<SlotView> {
    let name_by_id: HashMap<Uuid, &str> = slots.iter().map(|s| (s.id, s.name.as_str())).collect();
    slots
        .iter()
        .map(|slot| SlotView {
            name: slot.name.clone(),
            kind: slot.kind.as_str().to_string(),
            description: slot.description.clone(),
            required: slot.required,
            target_item_count: slot.target_item_count,
            depends_on: slot
                .depends_on_slot_id
                .and_then(|id| name_by_id.get(&id).map(|&n| n.to_string())),
        })
        .collect()
}

fn plan_view(slots: &[Slot], pending: &[SubqueryDef], action: &str, why: &str) -> PlanView {
    PlanView {
        action: action.to_string(),
        why: why.to_string(),
        slots: slot_views(slots),
        subqueries: pending
            .iter()
            .map(|sq| PlanSubqueryView {
                slot: sq.slot.clone(),
                query: sq.query.clone(),
                strategy: sq.strategy.as_str().to_string(),
            })
            .collect(),
    }
}

/// Converts persisted subquery records back into pending defs, resolving
/// slot ids to names.
fn subquery_defs(records: &[SubqueryRecord], slots: &[Slot]) -> Vec<SubqueryDef> {
    let name_by_id: HashMap<Uuid, &str> = slots.iter().map(|s| (s.id, s.name.as_str())).collect();
    records
        .iter()
        .filter_map(|record| {
            let slot_id = record.slot_id?;
            name_by_id.get(&slot_id).map(|&name| SubqueryDef {
                slot: name.to_string(),
                query: record.query_text.clone(),
                strategy: record.strategy,
            })
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn push_thought_step(
    state: &mut RunState,
    iteration: u32,
    action: StepAction,
    extract: &ExtractOutput,
    step_queries: &[SubqueryDef],
    retrieved_counts: &[usize],
    accepted_claims: usize,
    completeness: f32,
) {
    if extract.parse_error {
        state
            .thought
            .extraction_gaps
            .push(format!("Iteration {iteration}: extractor output was unparseable"));
    }
    let subqueries = step_queries
        .iter()
        .enumerate()
        .map(|(index, sq)| SubqueryView {
            slot: sq.slot.clone(),
            query: sq.query.clone(),
            chunks_found: retrieved_counts.get(index).copied().unwrap_or(0),
        })
        .collect();
    state.thought.steps.push(ThoughtStep {
        iter: iteration,
        action: action.as_str().to_string(),
        why: extract.why.clone(),
        subqueries,
        claims: accepted_claims,
        completeness,
        fill_status: fill_status_by_slot(&state.slots),
    });
}

fn quotes_out(quotes: &[Quote], run: &RunContext) -> Vec<QuoteOut> {
    quotes
        .iter()
        .map(|quote| {
            let source_id = run
                .page_by_id
                .get(&quote.page_id)
                .map_or_else(Uuid::nil, |p| p.source_id);
            QuoteOut::from_quote(quote, source_id)
        })
        .collect()
}
