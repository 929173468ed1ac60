//! Planner: one LLM call turning the question into a slot graph plus
//! initial subqueries.
//!
//! The raw model output goes through strict normalisation before anything
//! is persisted: mapping slots must name a list parent or are discarded,
//! targets are only read for the slot types that carry them, and
//! subqueries for dependent slots are dropped (their keys are synthesised
//! later, once the dependency fills). A parse failure falls back to a
//! single-scalar plan so the loop always has something to run.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use super::coerce;
use super::provider::LlmProvider;
use super::traits::{Agent, AgentResponse};
use crate::config::EngineConfig;
use crate::model::{QueryStrategy, Slot, SlotKind, SubqueryRecord};

/// Maximum tokens for the planner response.
const PLANNER_MAX_TOKENS: u32 = 1024;

/// Longest question text reused verbatim as the fallback subquery.
const FALLBACK_QUERY_MAX_CHARS: usize = 300;

/// First action chosen by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanAction {
    /// Start retrieving against the corpus.
    Retrieve,
    /// Ask the user before spending retrieval budget.
    Clarify,
}

impl PlanAction {
    /// Stable string form used in events.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Retrieve => "retrieve",
            Self::Clarify => "clarify",
        }
    }
}

/// Slot shape as planned, before persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotDefKind {
    /// Exactly one value sought.
    Scalar,
    /// An ordered set with an optional target count (0 = open-ended).
    List {
        /// Items sought, 0 when open-ended.
        target: u32,
    },
    /// Per-key values keyed by a parent list slot.
    Mapping {
        /// Name of the parent list slot.
        depends_on: String,
        /// Values sought per parent key, at least 1.
        items_per_key: u32,
    },
}

/// One planned slot.
#[derive(Debug, Clone)]
pub struct SlotDef {
    /// Short snake_case name, unique within the plan.
    pub name: String,
    /// Human description of what fills the slot.
    pub description: String,
    /// Slot shape.
    pub kind: SlotDefKind,
    /// Whether the slot counts toward overall completeness.
    pub required: bool,
}

/// One planned subquery.
#[derive(Debug, Clone)]
pub struct SubqueryDef {
    /// Slot the subquery serves.
    pub slot: String,
    /// Query text.
    pub query: String,
    /// Retrieval strategy.
    pub strategy: QueryStrategy,
}

/// Normalised planner output.
#[derive(Debug, Clone)]
pub struct PlanOutput {
    /// First action.
    pub action: PlanAction,
    /// Short rationale surfaced to the UI.
    pub why: String,
    /// Planned slots, post-normalisation.
    pub slots: Vec<SlotDef>,
    /// Initial subqueries for dependency-free slots.
    pub subqueries: Vec<SubqueryDef>,
    /// Clarifying questions when `action` is `Clarify`.
    pub questions: Vec<String>,
}

impl PlanOutput {
    /// The fallback plan: a single scalar slot answered by the question
    /// itself, truncated.
    #[must_use]
    pub fn fallback(question: &str) -> Self {
        let truncated: String = question.chars().take(FALLBACK_QUERY_MAX_CHARS).collect();
        Self {
            action: PlanAction::Retrieve,
            why: "Searching the corpus for a direct answer".to_string(),
            slots: vec![SlotDef {
                name: "answer".to_string(),
                description: "direct answer to the question".to_string(),
                kind: SlotDefKind::Scalar,
                required: true,
            }],
            subqueries: vec![SubqueryDef {
                slot: "answer".to_string(),
                query: truncated,
                strategy: QueryStrategy::Targeted,
            }],
            questions: Vec::new(),
        }
    }

    /// Materialises the plan into persistable slots and subquery records,
    /// minting ids and resolving `depends_on` names in a second pass.
    ///
    /// Mapping targets become `parent.target * items_per_key`. Subqueries
    /// naming unknown slots are dropped.
    #[must_use]
    pub fn materialize(&self, root_message_id: Uuid) -> (Vec<Slot>, Vec<SubqueryRecord>) {
        let mut slots: Vec<Slot> = self
            .slots
            .iter()
            .map(|def| {
                let (kind, target, items_per_key) = match &def.kind {
                    SlotDefKind::Scalar => (SlotKind::Scalar, 0, 1),
                    SlotDefKind::List { target } => (SlotKind::List, *target, 1),
                    SlotDefKind::Mapping { items_per_key, .. } => {
                        (SlotKind::Mapping, 0, (*items_per_key).max(1))
                    }
                };
                Slot {
                    id: Uuid::new_v4(),
                    root_message_id,
                    name: def.name.clone(),
                    description: def.description.clone(),
                    kind,
                    required: def.required,
                    depends_on_slot_id: None,
                    target_item_count: target,
                    items_per_key,
                    current_item_count: 0,
                    attempt_count: 0,
                    finished_querying: false,
                    last_queries: Vec::new(),
                }
            })
            .collect();

        // Second pass: resolve dependency names and derive mapping targets.
        for index in 0..slots.len() {
            if let SlotDefKind::Mapping { depends_on, .. } = &self.slots[index].kind {
                let parent = slots
                    .iter()
                    .find(|s| &s.name == depends_on)
                    .map(|s| (s.id, s.target_item_count));
                if let Some((parent_id, parent_target)) = parent {
                    slots[index].depends_on_slot_id = Some(parent_id);
                    slots[index].target_item_count =
                        parent_target * slots[index].items_per_key;
                }
            }
        }

        let records = self
            .subqueries
            .iter()
            .filter_map(|sq| {
                slots.iter().find(|s| s.name == sq.slot).map_or_else(
                    || {
                        tracing::warn!(slot = %sq.slot, "dropping subquery for unknown slot");
                        None
                    },
                    |slot| {
                        Some(SubqueryRecord {
                            slot_id: Some(slot.id),
                            query_text: sq.query.clone(),
                            strategy: sq.strategy,
                        })
                    },
                )
            })
            .collect();

        (slots, records)
    }
}

/// Agent that plans the slot graph for a question.
pub struct PlannerAgent {
    model: String,
    system_prompt: String,
}

impl PlannerAgent {
    /// Creates a new planner agent with the given configuration and
    /// system prompt.
    #[must_use]
    pub fn new(config: &EngineConfig, system_prompt: String) -> Self {
        Self {
            model: config.planner_model.clone(),
            system_prompt,
        }
    }

    /// Executes the planner and normalises its output, falling back to
    /// the single-scalar plan on any parse failure.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::EngineError`] only on transport failures;
    /// malformed model output never fails the call.
    pub async fn plan(
        &self,
        provider: &dyn LlmProvider,
        user_msg: &str,
        question: &str,
        deadline: Duration,
    ) -> Result<(PlanOutput, AgentResponse), crate::error::EngineError> {
        let response = self.execute(provider, user_msg, deadline).await?;
        let plan = parse_plan(&response.content).unwrap_or_else(|| {
            tracing::warn!("planner output unparseable; using fallback plan");
            PlanOutput::fallback(question)
        });
        Ok((plan, response))
    }
}

#[async_trait]
impl Agent for PlannerAgent {
    fn name(&self) -> &'static str {
        "planner"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    fn max_tokens(&self) -> u32 {
        PLANNER_MAX_TOKENS
    }
}

/// Parses and normalises raw planner output. `None` when the content is
/// not a JSON object with a usable slot list.
#[must_use]
pub fn parse_plan(content: &str) -> Option<PlanOutput> {
    let value: Value = serde_json::from_str(coerce::strip_code_fences(content)).ok()?;
    if !value.is_object() {
        return None;
    }

    // Initial `answer`/`expand_corpus` are not permitted; anything but an
    // explicit clarify plans a retrieval round.
    let action = match coerce::field_str(&value, "action").as_deref() {
        Some("clarify") => PlanAction::Clarify,
        _ => PlanAction::Retrieve,
    };
    let why = coerce::field_str(&value, "why").unwrap_or_default();
    let questions = coerce::field_string_array(&value, "questions");

    let mut slots: Vec<SlotDef> = Vec::new();
    for raw in coerce::field_array(&value, "slots") {
        let Some(name) = coerce::field_str(raw, "name") else {
            continue;
        };
        if slots.iter().any(|s| s.name == name) {
            continue;
        }
        let description = coerce::field_str(raw, "description").unwrap_or_default();
        let required = coerce::field_bool(raw, "required").unwrap_or(true);
        let kind_str = coerce::field_str(raw, "type")
            .or_else(|| coerce::field_str(raw, "kind"))
            .unwrap_or_else(|| "scalar".to_string());
        let depends_on = coerce::field_str(raw, "dependsOn")
            .or_else(|| coerce::field_str(raw, "depends_on"));

        let kind = match kind_str.as_str() {
            "list" => SlotDefKind::List {
                target: coerce::field_u32(raw, "target_item_count").unwrap_or(0),
            },
            "mapping" => {
                // A mapping must name its parent list; otherwise discard.
                let Some(parent) = depends_on else {
                    tracing::warn!(slot = %name, "dropping mapping slot without dependsOn");
                    continue;
                };
                SlotDefKind::Mapping {
                    depends_on: parent,
                    items_per_key: coerce::field_u32(raw, "items_per_key").unwrap_or(1).max(1),
                }
            }
            _ => SlotDefKind::Scalar,
        };

        slots.push(SlotDef {
            name,
            description,
            kind,
            required,
        });
    }

    // Mappings whose named parent is not a list slot in this plan are
    // discarded too.
    let list_names: Vec<String> = slots
        .iter()
        .filter(|s| matches!(s.kind, SlotDefKind::List { .. }))
        .map(|s| s.name.clone())
        .collect();
    slots.retain(|slot| match &slot.kind {
        SlotDefKind::Mapping { depends_on, .. } => {
            let keep = list_names.contains(depends_on);
            if !keep {
                tracing::warn!(slot = %slot.name, parent = %depends_on, "dropping mapping slot with non-list parent");
            }
            keep
        }
        _ => true,
    });

    if slots.is_empty() && action == PlanAction::Retrieve {
        return None;
    }

    let dependent: Vec<&str> = slots
        .iter()
        .filter_map(|s| match &s.kind {
            SlotDefKind::Mapping { .. } => Some(s.name.as_str()),
            _ => None,
        })
        .collect();

    let mut subqueries: Vec<SubqueryDef> = Vec::new();
    for raw in coerce::field_array(&value, "subqueries") {
        let Some(slot) = coerce::field_str(raw, "slot") else {
            continue;
        };
        let Some(query) = coerce::field_str(raw, "query") else {
            continue;
        };
        // Dependent slots get their queries synthesised after the parent
        // fills; initial ones are discarded.
        if dependent.contains(&slot.as_str()) {
            continue;
        }
        let strategy = match coerce::field_str(raw, "strategy").as_deref() {
            Some("broad") => QueryStrategy::Broad,
            _ => QueryStrategy::Targeted,
        };
        subqueries.push(SubqueryDef {
            slot,
            query,
            strategy,
        });
    }

    Some(PlanOutput {
        action,
        why,
        slots,
        subqueries,
        questions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plan_basic() {
        let json = r#"{
            "action": "retrieve",
            "why": "corpus likely covers it",
            "slots": [
                {"name": "birth_year", "description": "year of birth", "type": "scalar", "required": true}
            ],
            "subqueries": [
                {"slot": "birth_year", "query": "Joe Biden birth year", "strategy": "targeted"}
            ]
        }"#;
        let plan = parse_plan(json).unwrap_or_else(|| unreachable!());
        assert_eq!(plan.action, PlanAction::Retrieve);
        assert_eq!(plan.slots.len(), 1);
        assert_eq!(plan.subqueries.len(), 1);
        assert_eq!(plan.slots[0].kind, SlotDefKind::Scalar);
    }

    #[test]
    fn test_parse_plan_mapping_rules() {
        let json = r#"{
            "action": "retrieve",
            "slots": [
                {"name": "offices", "type": "list", "target_item_count": 3},
                {"name": "elections", "type": "mapping", "dependsOn": "offices", "items_per_key": 1},
                {"name": "orphan", "type": "mapping", "items_per_key": 1},
                {"name": "bad_parent", "type": "mapping", "dependsOn": "missing"}
            ],
            "subqueries": [
                {"slot": "offices", "query": "offices held", "strategy": "broad"},
                {"slot": "elections", "query": "premature per-key query"}
            ]
        }"#;
        let plan = parse_plan(json).unwrap_or_else(|| unreachable!());
        let names: Vec<&str> = plan.slots.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["offices", "elections"]);
        // The dependent slot's premature subquery is dropped.
        assert_eq!(plan.subqueries.len(), 1);
        assert_eq!(plan.subqueries[0].slot, "offices");
        assert_eq!(plan.subqueries[0].strategy, QueryStrategy::Broad);
    }

    #[test]
    fn test_parse_plan_invalid_falls_through() {
        assert!(parse_plan("not json").is_none());
        assert!(parse_plan("[1, 2]").is_none());
        assert!(parse_plan(r#"{"action": "retrieve", "slots": []}"#).is_none());
    }

    #[test]
    fn test_parse_plan_code_fenced() {
        let json = "```json\n{\"action\": \"clarify\", \"questions\": [\"which X?\"], \"slots\": []}\n```";
        let plan = parse_plan(json).unwrap_or_else(|| unreachable!());
        assert_eq!(plan.action, PlanAction::Clarify);
        assert_eq!(plan.questions, vec!["which X?".to_string()]);
    }

    #[test]
    fn test_parse_plan_rejects_initial_answer_action() {
        let json = r#"{"action": "answer", "slots": [{"name": "a", "type": "scalar"}]}"#;
        let plan = parse_plan(json).unwrap_or_else(|| unreachable!());
        assert_eq!(plan.action, PlanAction::Retrieve);
    }

    #[test]
    fn test_fallback_plan() {
        let long_question = "x".repeat(500);
        let plan = PlanOutput::fallback(&long_question);
        assert_eq!(plan.slots.len(), 1);
        assert_eq!(plan.slots[0].name, "answer");
        assert_eq!(plan.subqueries.len(), 1);
        assert_eq!(plan.subqueries[0].query.chars().count(), 300);
    }

    #[test]
    fn test_materialize_resolves_dependencies() {
        let json = r#"{
            "action": "retrieve",
            "slots": [
                {"name": "offices", "type": "list", "target_item_count": 3},
                {"name": "elections", "type": "mapping", "dependsOn": "offices", "items_per_key": 2}
            ],
            "subqueries": [
                {"slot": "offices", "query": "offices held", "strategy": "broad"},
                {"slot": "ghost", "query": "dropped"}
            ]
        }"#;
        let plan = parse_plan(json).unwrap_or_else(|| unreachable!());
        let root = Uuid::new_v4();
        let (slots, records) = plan.materialize(root);

        assert_eq!(slots.len(), 2);
        let offices = &slots[0];
        let elections = &slots[1];
        assert_eq!(elections.depends_on_slot_id, Some(offices.id));
        // parent target 3 × items_per_key 2
        assert_eq!(elections.target_item_count, 6);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].slot_id, Some(offices.id));
    }

    #[test]
    fn test_duplicate_slot_names_keep_first() {
        let json = r#"{
            "action": "retrieve",
            "slots": [
                {"name": "a", "type": "scalar", "description": "first"},
                {"name": "a", "type": "list", "description": "second"}
            ]
        }"#;
        let plan = parse_plan(json).unwrap_or_else(|| unreachable!());
        assert_eq!(plan.slots.len(), 1);
        assert_eq!(plan.slots[0].description, "first");
    }
}
