//! End-to-end pipeline scenarios against an in-memory corpus, a scripted
//! LLM provider, and the deterministic hash embedder.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use common::{ScriptedProvider, TestCorpus, ask, citation_markers, done_event, run_collect};
use quarry_rs::model::MessageRole;
use quarry_rs::store::Datastore;

fn planner_scalar(slot: &str, query: &str) -> String {
    json!({
        "action": "retrieve",
        "why": "the corpus should cover this directly",
        "slots": [
            {"name": slot, "description": "direct answer", "type": "scalar", "required": true}
        ],
        "subqueries": [
            {"slot": slot, "query": query, "strategy": "targeted"}
        ]
    })
    .to_string()
}

async fn latest_assistant_message(corpus: &TestCorpus) -> quarry_rs::model::Message {
    corpus
        .store
        .recent_messages(corpus.conversation_id, 10)
        .await
        .unwrap()
        .into_iter()
        .filter(|m| m.role == MessageRole::Assistant)
        .next_back()
        .expect("an assistant message should be persisted")
}

// ── S1: scalar, one round ─────────────────────────────────────────────

#[tokio::test]
async fn scalar_question_answered_in_one_round() {
    let corpus = TestCorpus::new(false);
    let c1 = corpus.add_chunk("Joseph Robinette Biden Jr. was born November 20, 1942, in Scranton.");
    let pad = "Early-life background text. ".repeat(20);
    corpus
        .store
        .set_page_content(
            corpus.page_id,
            &format!("{pad}He was born November 20, 1942, in Scranton.{pad}"),
        )
        .unwrap();
    let root = corpus.user_message("What year was Joe Biden born?");

    let provider = Arc::new(ScriptedProvider::new(vec![
        planner_scalar("birth_year", "Joe Biden birth year"),
        json!({
            "claims": [
                {"slot": "birth_year", "value": 1942, "confidence": 0.95,
                 "chunkIds": [c1.to_string()]}
            ],
            "next_action": "answer",
            "why": "the birth date is stated verbatim"
        })
        .to_string(),
        json!({
            "final_answer": format!("Joe Biden was born in 1942. [[quote:{c1}]]"),
            "cited_snippets": {c1.to_string(): "born November 20, 1942"}
        })
        .to_string(),
    ]));

    let events = run_collect(
        &corpus,
        provider.clone(),
        ask(&corpus, root, "What year was Joe Biden born?"),
    )
    .await;
    assert_eq!(provider.remaining(), 0);

    // First line is the plan.
    let plan = events[0].get("plan").expect("plan line first");
    assert_eq!(plan.get("action").and_then(|v| v.as_str()), Some("retrieve"));
    assert_eq!(plan.get("slots").and_then(|v| v.as_array()).map(Vec::len), Some(1));

    let done = done_event(&events);
    assert_eq!(
        done.get("message").and_then(|v| v.as_str()),
        Some("Joe Biden was born in 1942. [1]")
    );
    assert_eq!(
        done.get("quotes").and_then(|v| v.as_array()).map(Vec::len),
        Some(1)
    );

    let message = latest_assistant_message(&corpus).await;
    let quotes = corpus.store.quotes_for_message(message.id).await.unwrap();
    assert_eq!(quotes.len(), 1);
    assert_eq!(quotes[0].citation_order, 1);
    assert_eq!(quotes[0].chunk_id, c1);
    assert_eq!(quotes[0].snippet, "born November 20, 1942");
    // The snippet sits mid-page, so both context sides are captured.
    assert!(quotes[0].context_before.is_some());
    assert!(quotes[0].context_after.is_some());
}

// ── S2: list with target, two rounds ──────────────────────────────────

#[tokio::test]
async fn list_slot_fills_over_two_rounds() {
    let corpus = TestCorpus::new(false);
    let c1 = corpus.add_chunk("He served as a Senator from Delaware for 36 years.");
    let c2 = corpus.add_chunk("He served as the 47th Vice President under Obama.");
    let c3 = corpus.add_chunk("He became the 46th President of the United States.");
    let root = corpus.user_message("Give me the top 3 offices he held");

    let provider = Arc::new(ScriptedProvider::new(vec![
        json!({
            "action": "retrieve",
            "why": "sweep for offices",
            "slots": [
                {"name": "offices", "description": "offices held", "type": "list",
                 "required": true, "target_item_count": 3}
            ],
            "subqueries": [
                {"slot": "offices", "query": "offices held", "strategy": "broad"}
            ]
        })
        .to_string(),
        json!({
            "claims": [
                {"slot": "offices", "value": "Senator", "confidence": 0.9,
                 "chunkIds": [c1.to_string()]},
                {"slot": "offices", "value": "Vice President", "confidence": 0.9,
                 "chunkIds": [c2.to_string()]}
            ],
            "next_action": "retrieve",
            "why": "two of three found",
            "subqueries": [
                {"slot": "offices", "query": "other federal offices held", "strategy": "targeted"}
            ]
        })
        .to_string(),
        json!({
            "claims": [
                {"slot": "offices", "value": "President", "confidence": 0.95,
                 "chunkIds": [c3.to_string()]}
            ],
            "next_action": "answer",
            "why": "all three offices found"
        })
        .to_string(),
        json!({
            "final_answer": format!(
                "He was a Senator [[quote:{c1}]], Vice President [[quote:{c2}]], and President [[quote:{c3}]]."
            ),
            "cited_snippets": {
                c1.to_string(): "Senator from Delaware",
                c2.to_string(): "47th Vice President",
                c3.to_string(): "46th President"
            }
        })
        .to_string(),
    ]));

    let events = run_collect(
        &corpus,
        provider.clone(),
        ask(&corpus, root, "Give me the top 3 offices he held"),
    )
    .await;
    assert_eq!(provider.remaining(), 0);

    // After round one: 2 of 3 → completeness ≈ 0.67.
    let step1 = events
        .iter()
        .find(|e| e.get("step").is_some())
        .expect("step line");
    let completeness = step1.get("completeness").and_then(|v| v.as_f64()).unwrap();
    assert!((completeness - 2.0 / 3.0).abs() < 1e-4);
    assert_eq!(step1.get("action").and_then(|v| v.as_str()), Some("retrieve"));

    let done = done_event(&events);
    let message = done.get("message").and_then(|v| v.as_str()).unwrap();
    assert_eq!(citation_markers(message), vec![1, 2, 3]);

    let persisted = latest_assistant_message(&corpus).await;
    let quotes = corpus.store.quotes_for_message(persisted.id).await.unwrap();
    assert_eq!(quotes.len(), 3);
    assert_eq!(
        quotes.iter().map(|q| q.citation_order).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(quotes[0].chunk_id, c1);
    assert_eq!(quotes[2].chunk_id, c3);
}

// ── S3: mapping depends on list ───────────────────────────────────────

#[tokio::test]
async fn mapping_slot_waits_for_its_parent_list() {
    let corpus = TestCorpus::new(false);
    let c1 = corpus.add_chunk("Office one: Senator from Delaware.");
    let c2 = corpus.add_chunk("Office two: Vice President of the United States.");
    let c3 = corpus.add_chunk("Office three: President of the United States.");
    let e1 = corpus.add_chunk("He was first elected to the Senate in 1972.");
    let e2 = corpus.add_chunk("He was elected Vice President in 2008.");
    let e3 = corpus.add_chunk("He was elected President in 2020.");
    let root = corpus.user_message("For each office he held, when was he first elected?");

    let provider = Arc::new(ScriptedProvider::new(vec![
        json!({
            "action": "retrieve",
            "why": "find offices, then per-office election years",
            "slots": [
                {"name": "offices", "description": "offices held", "type": "list",
                 "required": true, "target_item_count": 3},
                {"name": "elections", "description": "year first elected to the office",
                 "type": "mapping", "required": true, "dependsOn": "offices",
                 "items_per_key": 1}
            ],
            "subqueries": [
                {"slot": "offices", "query": "offices held", "strategy": "broad"},
                {"slot": "elections", "query": "premature, must be dropped", "strategy": "targeted"}
            ]
        })
        .to_string(),
        json!({
            "claims": [
                {"slot": "offices", "value": "Senator", "confidence": 0.9, "chunkIds": [c1.to_string()]},
                {"slot": "offices", "value": "Vice President", "confidence": 0.9, "chunkIds": [c2.to_string()]},
                {"slot": "offices", "value": "President", "confidence": 0.9, "chunkIds": [c3.to_string()]}
            ],
            "next_action": "retrieve",
            "why": "offices filled; now the election years",
            "subqueries": [
                {"slot": "elections", "query": "Senator first elected year", "strategy": "targeted"},
                {"slot": "elections", "query": "Vice President elected year", "strategy": "targeted"},
                {"slot": "elections", "query": "President elected year", "strategy": "targeted"}
            ]
        })
        .to_string(),
        json!({
            "claims": [
                {"slot": "elections", "key": "Senator", "value": 1972, "confidence": 0.9,
                 "chunkIds": [e1.to_string()]},
                {"slot": "elections", "key": "Vice President", "value": 2008, "confidence": 0.9,
                 "chunkIds": [e2.to_string()]},
                {"slot": "elections", "key": "President", "value": 2020, "confidence": 0.9,
                 "chunkIds": [e3.to_string()]},
                {"slot": "elections", "key": "Pope", "value": 1, "confidence": 0.9,
                 "chunkIds": [e1.to_string()]}
            ],
            "next_action": "answer",
            "why": "every office has its election year"
        })
        .to_string(),
        json!({
            "final_answer": format!(
                "Senator [[quote:{c1}]] first elected 1972 [[quote:{e1}]]; \
                 Vice President [[quote:{c2}]] elected 2008 [[quote:{e2}]]; \
                 President [[quote:{c3}]] elected 2020 [[quote:{e3}]]."
            ),
            "cited_snippets": {}
        })
        .to_string(),
    ]));

    let events = run_collect(
        &corpus,
        provider.clone(),
        ask(&corpus, root, "For each office he held, when was he first elected?"),
    )
    .await;
    assert_eq!(provider.remaining(), 0);

    // Plan: the mapping's target derives from the parent target.
    let plan = events[0].get("plan").unwrap();
    let slots = plan.get("slots").and_then(|v| v.as_array()).unwrap();
    let elections = slots
        .iter()
        .find(|s| s.get("name").and_then(|v| v.as_str()) == Some("elections"))
        .unwrap();
    assert_eq!(
        elections.get("targetItemCount").and_then(serde_json::Value::as_u64),
        Some(3)
    );
    // The planner's premature mapping subquery was discarded.
    let planned = plan.get("subqueries").and_then(|v| v.as_array()).unwrap();
    assert!(
        planned
            .iter()
            .all(|sq| sq.get("slot").and_then(|v| v.as_str()) == Some("offices"))
    );

    // Iteration 1 ran only office subqueries (dependency gating).
    let thought = events
        .iter()
        .rev()
        .find_map(|e| e.get("thoughtProcess"))
        .unwrap();
    let steps = thought.get("steps").and_then(|v| v.as_array()).unwrap();
    let step1_queries = steps[0].get("subqueries").and_then(|v| v.as_array()).unwrap();
    assert!(
        step1_queries
            .iter()
            .all(|sq| sq.get("slot").and_then(|v| v.as_str()) == Some("offices"))
    );

    let done = done_event(&events);
    let message = done.get("message").and_then(|v| v.as_str()).unwrap();
    assert_eq!(citation_markers(message), vec![1, 2, 3, 4, 5, 6]);

    let persisted = latest_assistant_message(&corpus).await;
    let quotes = corpus.store.quotes_for_message(persisted.id).await.unwrap();
    assert_eq!(quotes.len(), 6);

    // The inadmissible "Pope" key never became a slot item.
    let slots = corpus.store.list_slots(root).await.unwrap();
    let elections_slot = slots.iter().find(|s| s.name == "elections").unwrap();
    assert_eq!(elections_slot.current_item_count, 3);
}

// ── S4: expand corpus in dynamic mode ─────────────────────────────────

#[tokio::test]
async fn expand_corpus_suggests_term_matching_link() {
    let corpus = TestCorpus::new(true);
    corpus.add_chunk("This page covers something entirely unrelated.");
    corpus.add_link(
        "https://en.test.org/Senate_career_of_Joe_Biden",
        "Senate career",
        "His years in the chamber",
    );
    corpus.add_link(
        "https://en.test.org/Completely_other_topic",
        "Other topic",
        "Nothing to do with it",
    );
    let root = corpus.user_message("When did Biden join the Senate?");

    let provider = Arc::new(ScriptedProvider::new(vec![
        planner_scalar("join_year", "Biden joined the Senate year"),
        json!({
            "claims": [],
            "next_action": "expand_corpus",
            "why": "the indexed pages do not cover his Senate years",
            "suggested_page_index": 1
        })
        .to_string(),
    ]));

    let events = run_collect(
        &corpus,
        provider.clone(),
        ask(&corpus, root, "When did Biden join the Senate?"),
    )
    .await;
    assert_eq!(provider.remaining(), 0);

    let done = done_event(&events);
    let suggested = done.get("suggestedPage").expect("a suggested page");
    // Term-match partitioning puts the "Senate" link first.
    assert_eq!(
        suggested.get("url").and_then(|v| v.as_str()),
        Some("https://en.test.org/Senate_career_of_Joe_Biden")
    );
    assert_eq!(
        done.get("suggestedTitle").and_then(|v| v.as_str()),
        Some("Senate career")
    );
    assert_eq!(
        done.get("quotes").and_then(|v| v.as_array()).map(Vec::len),
        Some(0)
    );

    let stub = latest_assistant_message(&corpus).await;
    assert!(stub.suggested_page.is_some());
    assert!(stub.thought_process.is_some());
}

// ── S5: hard stop from stagnation ─────────────────────────────────────

#[tokio::test]
async fn stagnation_hard_stops_with_partial_answer() {
    let corpus = TestCorpus::new(false);
    let c1 = corpus.add_chunk("Only one of the offices is documented: Senator.");
    let root = corpus.user_message("List the top 3 offices he held");

    let provider = Arc::new(ScriptedProvider::new(vec![
        json!({
            "action": "retrieve",
            "why": "sweep for offices",
            "slots": [
                {"name": "offices", "description": "offices held", "type": "list",
                 "required": true, "target_item_count": 3}
            ],
            "subqueries": [{"slot": "offices", "query": "offices held", "strategy": "broad"}]
        })
        .to_string(),
        json!({
            "claims": [
                {"slot": "offices", "value": "Senator", "confidence": 0.8,
                 "chunkIds": [c1.to_string()]}
            ],
            "next_action": "retrieve",
            "why": "only one found so far",
            "subqueries": [{"slot": "offices", "query": "vice presidency", "strategy": "targeted"}]
        })
        .to_string(),
        json!({
            "claims": [],
            "next_action": "retrieve",
            "why": "nothing new surfaced",
            "subqueries": [{"slot": "offices", "query": "presidency", "strategy": "targeted"}]
        })
        .to_string(),
        json!({
            "final_answer": format!("Only the Senate seat is documented. [[quote:{c1}]]"),
            "cited_snippets": {c1.to_string(): "Senator"}
        })
        .to_string(),
    ]));

    let events = run_collect(
        &corpus,
        provider.clone(),
        ask(&corpus, root, "List the top 3 offices he held"),
    )
    .await;
    assert_eq!(provider.remaining(), 0);

    let done = done_event(&events);
    let thought = done.get("thoughtProcess").unwrap();
    assert_eq!(
        thought.get("hardStopReason").and_then(|v| v.as_str()),
        Some("No new claims (stagnation)")
    );
    assert!(thought.get("partialAnswerNote").is_some());

    let message = done.get("message").and_then(|v| v.as_str()).unwrap();
    assert_eq!(citation_markers(message), vec![1]);

    let persisted = latest_assistant_message(&corpus).await;
    let stored_thought = persisted.thought_process.unwrap();
    assert_eq!(
        stored_thought.get("hardStopReason").and_then(|v| v.as_str()),
        Some("No new claims (stagnation)")
    );
}

// ── S6: append mode after adding the suggested page ───────────────────

#[tokio::test]
async fn append_mode_rehydrates_and_threads_the_reply() {
    let corpus = TestCorpus::new(true);
    corpus.add_chunk("This page covers something entirely unrelated.");
    corpus.add_link(
        "https://en.test.org/Senate_career_of_Joe_Biden",
        "Senate career",
        "His years in the chamber",
    );
    let root = corpus.user_message("When did Biden join the Senate?");

    // First run ends in an expand-corpus stub.
    let provider = Arc::new(ScriptedProvider::new(vec![
        planner_scalar("join_year", "Biden joined the Senate year"),
        json!({
            "claims": [],
            "next_action": "expand_corpus",
            "why": "the indexed pages do not cover his Senate years"
        })
        .to_string(),
    ]));
    let events = run_collect(
        &corpus,
        provider.clone(),
        ask(&corpus, root, "When did Biden join the Senate?"),
    )
    .await;
    assert_eq!(provider.remaining(), 0);
    assert!(done_event(&events).get("suggestedPage").is_some());
    let stub = latest_assistant_message(&corpus).await;
    assert!(stub.suggested_page.is_some());

    // The suggested page gets indexed.
    let new_page = Uuid::new_v4();
    corpus.add_page(new_page, "Senate career of Joe Biden", "/Senate_career", "long");
    let answer_chunk =
        corpus.add_chunk_on(new_page, "Biden joined the United States Senate in January 1973.");

    // Second run: ask again, appending to the stub. No planner call;
    // the original slots and subqueries rehydrate.
    let provider2 = Arc::new(ScriptedProvider::new(vec![
        json!({
            "claims": [
                {"slot": "join_year", "value": 1973, "confidence": 0.95,
                 "chunkIds": [answer_chunk.to_string()]}
            ],
            "next_action": "answer",
            "why": "the new page states it directly"
        })
        .to_string(),
        json!({
            "final_answer": format!("He joined the Senate in January 1973. [[quote:{answer_chunk}]]"),
            "cited_snippets": {answer_chunk.to_string(): "joined the United States Senate in January 1973"}
        })
        .to_string(),
    ]));

    let mut request = ask(&corpus, root, "When did Biden join the Senate?");
    request.root_message_id = None;
    request.append_to_message_id = Some(stub.id);

    let events = run_collect(&corpus, provider2.clone(), request).await;
    assert_eq!(provider2.remaining(), 0);

    let done = done_event(&events);
    assert_eq!(
        done.get("message").and_then(|v| v.as_str()),
        Some("He joined the Senate in January 1973. [1]")
    );

    let answer = latest_assistant_message(&corpus).await;
    assert_eq!(answer.follows_message_id, Some(stub.id));

    // The original stub's suggestion was cleared when it was acted on.
    let stub_reloaded = corpus.store.get_message(stub.id).await.unwrap().unwrap();
    assert!(stub_reloaded.suggested_page.is_none());
}

// ── failure shapes ────────────────────────────────────────────────────

#[tokio::test]
async fn no_indexed_pages_yields_the_stock_message() {
    let corpus = TestCorpus::new(false);
    // A fresh conversation with a source but no pages at all.
    let empty_conversation = Uuid::new_v4();
    corpus
        .store
        .insert_conversation(&quarry_rs::model::Conversation {
            id: empty_conversation,
            owner_id: None,
            dynamic_sources: false,
        })
        .unwrap();

    let provider = Arc::new(ScriptedProvider::new(vec![]));
    let request = quarry_rs::engine::AskRequest {
        conversation_id: empty_conversation,
        user_message: "anything".to_string(),
        root_message_id: Some(Uuid::new_v4()),
        append_to_message_id: None,
        scraped_page_display: None,
    };
    let events = run_collect(&corpus, provider, request).await;

    let done = done_event(&events);
    let message = done.get("message").and_then(|v| v.as_str()).unwrap();
    assert!(message.contains("indexed pages"));
    assert_eq!(
        done.get("quotes").and_then(|v| v.as_array()).map(Vec::len),
        Some(0)
    );
}

#[tokio::test]
async fn unparseable_extractor_output_degrades_to_no_evidence() {
    let corpus = TestCorpus::new(false);
    corpus.add_chunk("Some indexed content.");
    let root = corpus.user_message("An unanswerable question");

    let provider = Arc::new(ScriptedProvider::new(vec![
        planner_scalar("answer", "an unanswerable question"),
        "this is not json at all".to_string(),
    ]));

    let events = run_collect(
        &corpus,
        provider.clone(),
        ask(&corpus, root, "An unanswerable question"),
    )
    .await;
    assert_eq!(provider.remaining(), 0);

    let done = done_event(&events);
    let thought = done.get("thoughtProcess").unwrap();
    assert_eq!(
        thought.get("hardStopReason").and_then(|v| v.as_str()),
        Some("No supporting evidence found")
    );
    let gaps = thought.get("extractionGaps").and_then(|v| v.as_array()).unwrap();
    assert!(!gaps.is_empty());

    let message = done.get("message").and_then(|v| v.as_str()).unwrap();
    assert!(message.contains("couldn't find supporting evidence"));
}

#[tokio::test]
async fn missing_conversation_emits_single_error_line() {
    let corpus = TestCorpus::new(false);
    let provider = Arc::new(ScriptedProvider::new(vec![]));
    let request = quarry_rs::engine::AskRequest {
        conversation_id: Uuid::new_v4(),
        user_message: "q".to_string(),
        root_message_id: Some(Uuid::new_v4()),
        append_to_message_id: None,
        scraped_page_display: None,
    };
    let events = run_collect(&corpus, provider, request).await;
    assert_eq!(events.len(), 1);
    assert!(events[0].get("error").is_some());
}
