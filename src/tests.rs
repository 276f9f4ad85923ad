use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::brain::*;
use crate::cli::*;
use crate::config::*;
use crate::error::*;
use crate::events::*;
use crate::knowledge::*;
use crate::message::*;
use crate::model::*;
use crate::multimodal::*;
use crate::orchestrator::*;
use crate::planner::*;
use crate::server::*;
use crate::store::*;
use crate::telemetry::*;
use crate::tools::*;

use tempfile::tempdir;

fn base_cfg() -> RuntimeConfig {
    RuntimeConfig {
        profile: "default".to_string(),
        config_path: ".cortex/config.toml".to_string(),
        user_id: "test-user".to_string(),
        model_tiers: ModelTiers::default(),
        generate_endpoint: DEFAULT_GENERATE_ENDPOINT.to_string(),
        generate_timeout_secs: 5,
        knowledge_backend: KnowledgeBackend::Disabled,
        knowledge_doc_path: None,
        grace_period_secs: 300,
        telemetry_enabled: false,
        telemetry_path: ".cortex/test-telemetry.jsonl".to_string(),
        server_token: None,
        show_sensitive_config: false,
    }
}

/// Routes each generation call by prompt shape so one mock can serve the
/// classification, decomposition, synthesis, and direct-response paths.
/// A `None` script slot fails that call with an abort-class error.
#[derive(Default)]
struct ScriptedGenerate {
    classify: Option<String>,
    decompose: Option<String>,
    synthesize: Option<String>,
    direct: Option<String>,
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl GenerateService for ScriptedGenerate {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        model: &str,
        _options: GenerateOptions,
    ) -> Result<String, GenerateFailure> {
        self.calls.lock().unwrap().push(model.to_string());
        let prompt = messages
            .last()
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        let slot = if prompt.contains("Respond with ONLY") {
            &self.classify
        } else if prompt.contains("Break down this query") {
            &self.decompose
        } else if prompt.contains("Synthesize final answer") {
            &self.synthesize
        } else {
            &self.direct
        };
        match slot {
            Some(text) => Ok(text.clone()),
            None => Err(GenerateFailure::Failed {
                reason: "scripted failure".to_string(),
            }),
        }
    }
}

/// Replays a fixed sequence of outcomes and records the models attempted.
/// Once the sequence is exhausted every call reports `Unavailable`.
struct SequenceGenerate {
    outcomes: Mutex<VecDeque<Result<String, GenerateFailure>>>,
    calls: Mutex<Vec<String>>,
}

impl SequenceGenerate {
    fn new(outcomes: Vec<Result<String, GenerateFailure>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn attempted_models(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerateService for SequenceGenerate {
    async fn generate(
        &self,
        _messages: &[ChatMessage],
        model: &str,
        _options: GenerateOptions,
    ) -> Result<String, GenerateFailure> {
        self.calls.lock().unwrap().push(model.to_string());
        self.outcomes.lock().unwrap().pop_front().unwrap_or_else(|| {
            Err(GenerateFailure::Unavailable {
                reason: "exhausted".to_string(),
            })
        })
    }
}

fn unavailable() -> GenerateFailure {
    GenerateFailure::Unavailable {
        reason: "model_decommissioned".to_string(),
    }
}

fn hard_failure() -> GenerateFailure {
    GenerateFailure::Failed {
        reason: "rate limited".to_string(),
    }
}

fn planner_with(service: Arc<dyn GenerateService>, store: Arc<InMemoryStore>) -> Planner {
    let policy = ModelPolicy::new(service, ModelTiers::default());
    Planner::new(policy, Arc::new(BuiltinToolRegistry::new(store)))
}

fn orchestrator_with(
    service: Arc<dyn GenerateService>,
    store: Arc<InMemoryStore>,
    knowledge: Arc<dyn KnowledgeService>,
) -> Arc<Orchestrator> {
    let planner = planner_with(service, store.clone());
    Arc::new(Orchestrator::new(
        knowledge,
        store,
        Arc::new(DisabledMediaService),
        planner,
    ))
}

fn text_message(message_id: &str, content: &str) -> UnifiedMessage {
    UnifiedMessage::text(Channel::Web, "user-1", message_id, content)
}

fn image_message(message_id: &str) -> UnifiedMessage {
    UnifiedMessage {
        channel: Channel::Telegram,
        user_id: "user-1".to_string(),
        message_id: message_id.to_string(),
        message_type: MessageKind::Image,
        content: "what is in this picture".to_string(),
        timestamp: 0,
        metadata: HashMap::from([("file_id".to_string(), json!("file-9"))]),
    }
}

fn plan_step(kind: StepKind, status: StepStatus) -> PlanStep {
    PlanStep {
        id: "s".to_string(),
        kind,
        content: "step".to_string(),
        tool: None,
        tool_params: None,
        result: None,
        status,
    }
}

fn refund_chunks() -> Vec<RetrievedDoc> {
    vec![RetrievedDoc {
        text: "Refunds are accepted within 30 days of purchase with a receipt.".to_string(),
        source: "kb.md#0".to_string(),
        score: 0.0,
    }]
}

fn orders_decomposition() -> String {
    json!({
        "steps": [
            {
                "reasoning": "Check the customer's order history",
                "tool": "query_user_orders",
                "params": { "user_id": "user-1" }
            },
            {
                "reasoning": "Summarize findings for the customer",
                "tool": null,
                "params": {}
            }
        ]
    })
    .to_string()
}

async fn drain(mut rx: mpsc::Receiver<WorkflowEvent>) -> Vec<WorkflowEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

// ---------------------------------------------------------------------------
// Confidence scoring

#[test]
fn confidence_is_zero_for_a_plan_with_no_steps() {
    assert_eq!(score_confidence(&[]), 0.0);
}

#[test]
fn confidence_caps_clean_run_bonus_at_one() {
    let steps = vec![
        plan_step(StepKind::Thought, StepStatus::Completed),
        plan_step(StepKind::Final, StepStatus::Completed),
    ];
    assert_eq!(score_confidence(&steps), 1.0);
}

#[test]
fn confidence_drops_bonus_when_any_step_failed() {
    let steps = vec![
        plan_step(StepKind::Thought, StepStatus::Completed),
        plan_step(StepKind::Action, StepStatus::Failed),
        plan_step(StepKind::Final, StepStatus::Completed),
    ];
    let score = score_confidence(&steps);
    assert!((score - 2.0 / 3.0).abs() < 1e-9);
    assert!((0.0..=1.0).contains(&score));
}

// ---------------------------------------------------------------------------
// Planner

#[tokio::test]
async fn simple_query_produces_single_final_step_with_fixed_confidence() {
    let service = Arc::new(ScriptedGenerate {
        classify: Some("simple".to_string()),
        direct: Some("Hello! How can I help?".to_string()),
        ..Default::default()
    });
    let planner = planner_with(service, Arc::new(InMemoryStore::new()));

    let mut callbacks = Vec::new();
    let plan = planner
        .create_and_execute("hi", &PlanContext::default(), |step| {
            callbacks.push((step.id.clone(), step.status))
        })
        .await;

    assert_eq!(plan.steps.len(), 1);
    assert_eq!(plan.steps[0].kind, StepKind::Final);
    assert_eq!(plan.steps[0].id, "1");
    assert_eq!(plan.confidence, SIMPLE_PATH_CONFIDENCE);
    assert_eq!(plan.final_answer.as_deref(), Some("Hello! How can I help?"));
    assert_eq!(plan.tools_used(), 0);
    // Construction first, then the completed transition.
    assert_eq!(callbacks.len(), 2);
    assert_eq!(callbacks[1], ("1".to_string(), StepStatus::Completed));
}

#[tokio::test]
async fn classification_failure_falls_open_to_the_simple_path() {
    let service = Arc::new(ScriptedGenerate {
        classify: None,
        direct: Some("Hi there.".to_string()),
        ..Default::default()
    });
    let planner = planner_with(service, Arc::new(InMemoryStore::new()));

    let plan = planner
        .create_and_execute("hello", &PlanContext::default(), |_| {})
        .await;

    assert_eq!(plan.steps.len(), 1);
    assert_eq!(plan.confidence, SIMPLE_PATH_CONFIDENCE);
}

#[tokio::test]
async fn complex_query_runs_tools_and_synthesizes_an_answer() {
    let store = Arc::new(InMemoryStore::new());
    store.seed_order("user-1", "Wireless headphones", 4999, "shipped");
    let service = Arc::new(ScriptedGenerate {
        classify: Some("complex".to_string()),
        decompose: Some(orders_decomposition()),
        synthesize: Some("Your headphones shipped yesterday.".to_string()),
        ..Default::default()
    });
    let planner = planner_with(service, store);

    let plan = planner
        .create_and_execute("where is my order?", &PlanContext::default(), |_| {})
        .await;

    let kinds: Vec<StepKind> = plan.steps.iter().map(|s| s.kind).collect();
    assert_eq!(
        kinds,
        vec![
            StepKind::Thought,
            StepKind::Action,
            StepKind::Observation,
            StepKind::Thought,
            StepKind::Final,
        ]
    );
    assert_eq!(plan.steps[0].id, "step-0-thought");
    assert_eq!(plan.steps[1].id, "step-0-action");
    assert_eq!(plan.steps[2].id, "step-0-obs");
    assert_eq!(plan.steps[4].id, "final");
    assert_eq!(plan.tools_used(), 1);
    assert_eq!(plan.confidence, 1.0);
    assert_eq!(
        plan.final_answer.as_deref(),
        Some("Your headphones shipped yesterday.")
    );

    // Action steps carry the tool call on the wire in camelCase.
    let wire = serde_json::to_value(&plan.steps[1]).unwrap();
    assert_eq!(wire["type"], "action");
    assert_eq!(wire["tool"], "query_user_orders");
    assert!(wire.get("toolParams").is_some());
    assert_eq!(wire["status"], "completed");
}

#[tokio::test]
async fn failing_tool_marks_the_action_failed_and_the_plan_continues() {
    let service = Arc::new(ScriptedGenerate {
        classify: Some("complex".to_string()),
        decompose: Some(
            json!({
                "steps": [{
                    "reasoning": "Attempt an unsupported operation",
                    "tool": "refund_everything",
                    "params": {}
                }]
            })
            .to_string(),
        ),
        synthesize: Some("I could not complete that operation.".to_string()),
        ..Default::default()
    });
    let planner = planner_with(service, Arc::new(InMemoryStore::new()));

    let plan = planner
        .create_and_execute("refund everything", &PlanContext::default(), |_| {})
        .await;

    let action = plan
        .steps
        .iter()
        .find(|s| s.kind == StepKind::Action)
        .expect("action step should exist");
    assert_eq!(action.status, StepStatus::Failed);
    assert!(!plan.steps.iter().any(|s| s.kind == StepKind::Observation));
    assert!(plan.final_answer.is_some());
    assert!((plan.confidence - 2.0 / 3.0).abs() < 1e-9);
}

#[tokio::test]
async fn unparseable_decomposition_degrades_to_a_direct_response_step() {
    let service = Arc::new(ScriptedGenerate {
        classify: Some("complex".to_string()),
        decompose: Some("I cannot produce JSON today.".to_string()),
        synthesize: Some("Here is what I found.".to_string()),
        ..Default::default()
    });
    let planner = planner_with(service, Arc::new(InMemoryStore::new()));

    let plan = planner
        .create_and_execute("compare plans", &PlanContext::default(), |_| {})
        .await;

    assert_eq!(plan.steps.len(), 2);
    assert_eq!(plan.steps[0].kind, StepKind::Thought);
    assert_eq!(plan.steps[0].content, "Direct response");
    assert_eq!(plan.steps[1].kind, StepKind::Final);
    assert_eq!(plan.confidence, 1.0);
}

#[tokio::test]
async fn simple_path_answer_falls_back_when_all_models_abort() {
    let service = Arc::new(ScriptedGenerate {
        classify: Some("simple".to_string()),
        direct: None,
        ..Default::default()
    });
    let planner = planner_with(service, Arc::new(InMemoryStore::new()));

    let plan = planner
        .create_and_execute("hi", &PlanContext::default(), |_| {})
        .await;

    assert_eq!(plan.final_answer.as_deref(), Some(DIRECT_RESPONSE_FALLBACK));
}

// ---------------------------------------------------------------------------
// Model fallback policy

#[tokio::test]
async fn policy_walks_candidates_in_declared_order_until_one_succeeds() {
    let service = Arc::new(SequenceGenerate::new(vec![
        Err(unavailable()),
        Ok("answer".to_string()),
    ]));
    let policy = ModelPolicy::new(service.clone(), ModelTiers::default());
    let candidates = vec!["model-a".to_string(), "model-b".to_string()];

    let result = policy
        .try_candidates(&candidates, &[ChatMessage::user("ping")], GenerateOptions::RESPOND)
        .await;

    assert_eq!(result.as_deref(), Some("answer"));
    assert_eq!(service.attempted_models(), vec!["model-a", "model-b"]);
}

#[tokio::test]
async fn hard_failure_aborts_the_candidate_list() {
    let service = Arc::new(SequenceGenerate::new(vec![Err(hard_failure())]));
    let policy = ModelPolicy::new(service.clone(), ModelTiers::default());
    let candidates = vec!["model-a".to_string(), "model-b".to_string()];

    let result = policy
        .try_candidates(&candidates, &[ChatMessage::user("ping")], GenerateOptions::RESPOND)
        .await;

    assert!(result.is_none());
    assert_eq!(service.attempted_models(), vec!["model-a"]);
}

#[tokio::test]
async fn empty_model_output_is_skipped_like_an_unavailable_candidate() {
    let service = Arc::new(SequenceGenerate::new(vec![
        Ok("   ".to_string()),
        Ok("text".to_string()),
    ]));
    let policy = ModelPolicy::new(service.clone(), ModelTiers::default());
    let candidates = vec!["model-a".to_string(), "model-b".to_string()];

    let result = policy
        .try_candidates(&candidates, &[ChatMessage::user("ping")], GenerateOptions::RESPOND)
        .await;

    assert_eq!(result.as_deref(), Some("text"));
}

#[tokio::test]
async fn exhausted_tiers_fall_back_to_the_fixed_apology() {
    let service = Arc::new(SequenceGenerate::new(Vec::new()));
    let tiers = ModelTiers::default();
    let policy = ModelPolicy::new(service.clone(), tiers.clone());

    let text = policy
        .generate_or_apology(&tiers.primary, &[ChatMessage::user("ping")], GenerateOptions::GROUNDED)
        .await;

    assert_eq!(text, APOLOGY_RESPONSE);
    assert!(!text.is_empty());

    // Models shared between the primary and fast tiers are attempted once.
    let attempted = service.attempted_models();
    let unique: std::collections::HashSet<&String> = attempted.iter().collect();
    assert_eq!(attempted.len(), unique.len());
    assert_eq!(attempted.len(), 5);
}

// ---------------------------------------------------------------------------
// Event stream

#[test]
fn sse_framing_carries_kind_and_json_payload() {
    let event = WorkflowEvent::Status {
        status: "planning".to_string(),
        message: "Planning approach...".to_string(),
    };
    let frame = event.to_sse();
    assert!(frame.starts_with("event: status\ndata: "));
    assert!(frame.ends_with("\n\n"));

    let data = frame
        .trim_end()
        .split_once("\ndata: ")
        .map(|(_, payload)| payload)
        .expect("frame should carry a data line");
    let parsed: Value = serde_json::from_str(data).expect("data should be JSON");
    assert_eq!(parsed["status"], "planning");
}

#[test]
fn complete_event_payload_uses_camel_case_wire_keys() {
    let event = WorkflowEvent::Complete {
        response: "done".to_string(),
        confidence: 0.9,
        tools_used: 2,
        execution_time_ms: 1234,
    };
    let data = event.data();
    assert_eq!(data["toolsUsed"], 2);
    assert_eq!(data["executionTime"], 1234);
    assert!(data.get("tools_used").is_none());
    assert!(event.is_terminal());
}

#[test]
fn connected_event_identifies_the_workflow() {
    let event = WorkflowEvent::Connected {
        workflow_id: "wf-1".to_string(),
    };
    assert_eq!(event.kind(), "connected");
    assert_eq!(event.data()["workflowId"], "wf-1");
    assert!(!event.is_terminal());
}

// ---------------------------------------------------------------------------
// Orchestrator

#[tokio::test]
async fn workflow_emits_lifecycle_events_in_order_and_stops_after_complete() {
    let service = Arc::new(ScriptedGenerate {
        classify: Some("simple".to_string()),
        direct: Some("Hello!".to_string()),
        ..Default::default()
    });
    let orchestrator = orchestrator_with(
        service,
        Arc::new(InMemoryStore::new()),
        Arc::new(DisabledKnowledgeService),
    );

    let message = text_message("wf-order", "hi");
    orchestrator.initialize(&message).await.unwrap();
    let rx = orchestrator.clone().execute("wf-order").unwrap();
    let events = drain(rx).await;

    let kinds: Vec<&str> = events.iter().map(WorkflowEvent::kind).collect();
    assert_eq!(
        kinds,
        vec!["status", "status", "step", "step", "status", "progress", "complete"]
    );
    match events.last().unwrap() {
        WorkflowEvent::Complete {
            confidence,
            tools_used,
            ..
        } => {
            assert_eq!(*confidence, SIMPLE_PATH_CONFIDENCE);
            assert_eq!(*tools_used, 0);
        }
        other => panic!("expected complete event, got {other:?}"),
    }

    let snapshot = orchestrator.status("wf-order").expect("workflow visible in grace period");
    assert_eq!(snapshot.status, WorkflowStatus::Completed);
    assert!(snapshot.status.is_terminal());
}

#[tokio::test]
async fn retrieval_event_is_emitted_only_when_documents_match() {
    let service = Arc::new(ScriptedGenerate {
        classify: Some("simple".to_string()),
        direct: Some("Refunds take 30 days.".to_string()),
        ..Default::default()
    });
    let orchestrator = orchestrator_with(
        service,
        Arc::new(InMemoryStore::new()),
        Arc::new(LocalFileKnowledgeService::from_chunks(refund_chunks())),
    );

    let message = text_message("wf-retrieval", "What is your refund policy?");
    orchestrator.initialize(&message).await.unwrap();
    let rx = orchestrator.clone().execute("wf-retrieval").unwrap();
    let events = drain(rx).await;

    assert_eq!(events[0].kind(), "status");
    match &events[1] {
        WorkflowEvent::Retrieval { sources, count } => {
            assert_eq!(*count, 1);
            assert_eq!(sources, &vec!["kb.md#0".to_string()]);
        }
        other => panic!("expected retrieval event, got {other:?}"),
    }
}

#[tokio::test]
async fn complete_event_reports_tool_usage_and_plan_confidence() {
    let store = Arc::new(InMemoryStore::new());
    store.seed_order("user-1", "Desk lamp", 2500, "delivered");
    let service = Arc::new(ScriptedGenerate {
        classify: Some("complex".to_string()),
        decompose: Some(orders_decomposition()),
        synthesize: Some("Your desk lamp was delivered.".to_string()),
        ..Default::default()
    });
    let orchestrator = orchestrator_with(service, store, Arc::new(DisabledKnowledgeService));

    let message = text_message("wf-tools", "where is my order?");
    orchestrator.initialize(&message).await.unwrap();
    let rx = orchestrator.clone().execute("wf-tools").unwrap();
    let events = drain(rx).await;

    let complete = events
        .iter()
        .find_map(|event| match event {
            WorkflowEvent::Complete {
                response,
                confidence,
                tools_used,
                ..
            } => Some((response.clone(), *confidence, *tools_used)),
            _ => None,
        })
        .expect("workflow should complete");
    assert_eq!(complete.0, "Your desk lamp was delivered.");
    assert_eq!(complete.1, 1.0);
    assert_eq!(complete.2, 1);
}

#[tokio::test]
async fn executing_an_unknown_workflow_is_rejected() {
    let service = Arc::new(ScriptedGenerate::default());
    let orchestrator = orchestrator_with(
        service,
        Arc::new(InMemoryStore::new()),
        Arc::new(DisabledKnowledgeService),
    );

    let err = orchestrator.clone().execute("missing").unwrap_err();
    assert_eq!(
        err,
        OrchestratorError::WorkflowNotFound {
            id: "missing".to_string()
        }
    );
}

#[tokio::test]
async fn duplicate_workflow_ids_are_rejected_at_initialize() {
    let service = Arc::new(ScriptedGenerate::default());
    let orchestrator = orchestrator_with(
        service,
        Arc::new(InMemoryStore::new()),
        Arc::new(DisabledKnowledgeService),
    );

    let message = text_message("wf-dup", "hi");
    orchestrator.initialize(&message).await.unwrap();
    let err = orchestrator.initialize(&message).await.unwrap_err();
    assert_eq!(
        err,
        OrchestratorError::DuplicateWorkflow {
            id: "wf-dup".to_string()
        }
    );
}

#[tokio::test]
async fn a_workflow_may_only_be_executed_once() {
    let service = Arc::new(ScriptedGenerate {
        classify: Some("simple".to_string()),
        direct: Some("Hello!".to_string()),
        ..Default::default()
    });
    let orchestrator = orchestrator_with(
        service,
        Arc::new(InMemoryStore::new()),
        Arc::new(DisabledKnowledgeService),
    );

    let message = text_message("wf-once", "hi");
    orchestrator.initialize(&message).await.unwrap();
    let _rx = orchestrator.clone().execute("wf-once").unwrap();
    let err = orchestrator.clone().execute("wf-once").unwrap_err();
    assert_eq!(
        err,
        OrchestratorError::WorkflowBusy {
            id: "wf-once".to_string()
        }
    );
}

#[tokio::test]
async fn terminal_workflows_are_evicted_after_the_grace_period() {
    let service = Arc::new(ScriptedGenerate {
        classify: Some("simple".to_string()),
        direct: Some("Hello!".to_string()),
        ..Default::default()
    });
    let store = Arc::new(InMemoryStore::new());
    let planner = planner_with(service, store.clone());
    let orchestrator = Arc::new(
        Orchestrator::new(
            Arc::new(DisabledKnowledgeService),
            store,
            Arc::new(DisabledMediaService),
            planner,
        )
        .with_grace_period(Duration::from_millis(50)),
    );

    let message = text_message("wf-evict", "hi");
    orchestrator.initialize(&message).await.unwrap();
    let rx = orchestrator.clone().execute("wf-evict").unwrap();
    drain(rx).await;

    assert!(orchestrator.status("wf-evict").is_some());
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(orchestrator.sweep_expired(), 1);
    assert!(orchestrator.status("wf-evict").is_none());
    assert_eq!(orchestrator.active_count(), 0);
}

#[tokio::test]
async fn media_preprocessing_failure_is_recorded_and_the_workflow_survives() {
    let service = Arc::new(ScriptedGenerate {
        classify: Some("simple".to_string()),
        direct: Some("It looks like a picture.".to_string()),
        ..Default::default()
    });
    let orchestrator = orchestrator_with(
        service,
        Arc::new(InMemoryStore::new()),
        Arc::new(DisabledKnowledgeService),
    );

    let snapshot = orchestrator.initialize(&image_message("wf-media")).await.unwrap();
    assert_eq!(snapshot.status, WorkflowStatus::Analyzing);
    assert_eq!(snapshot.errors.len(), 1);
    assert!(snapshot.errors[0].starts_with("Multimodal processing failed"));

    let rx = orchestrator.clone().execute("wf-media").unwrap();
    let events = drain(rx).await;
    assert_eq!(events.last().unwrap().kind(), "complete");
}

#[tokio::test]
async fn cancel_marks_a_registered_workflow_failed() {
    let service = Arc::new(ScriptedGenerate::default());
    let orchestrator = orchestrator_with(
        service,
        Arc::new(InMemoryStore::new()),
        Arc::new(DisabledKnowledgeService),
    );

    let message = text_message("wf-cancel", "hi");
    orchestrator.initialize(&message).await.unwrap();
    assert!(orchestrator.cancel("wf-cancel"));
    let snapshot = orchestrator.status("wf-cancel").unwrap();
    assert_eq!(snapshot.status, WorkflowStatus::Failed);
    assert!(!orchestrator.cancel("wf-unknown"));
}

// ---------------------------------------------------------------------------
// Tools

#[test]
fn tool_invocation_rejects_unknown_tool_names() {
    let err = ToolInvocation::parse("refund_everything", &json!({})).unwrap_err();
    assert_eq!(err, ToolError::UnknownTool("refund_everything".to_string()));
}

#[test]
fn tool_invocation_requires_mandatory_parameters() {
    let err = ToolInvocation::parse(QUERY_USER_ORDERS, &json!({})).unwrap_err();
    assert_eq!(
        err,
        ToolError::MissingParams {
            tool: QUERY_USER_ORDERS.to_string(),
            missing: "user_id".to_string(),
        }
    );

    let err = ToolInvocation::parse(SEARCH_CONVERSATIONS, &json!({ "user_id": "u1" })).unwrap_err();
    assert_eq!(
        err,
        ToolError::MissingParams {
            tool: SEARCH_CONVERSATIONS.to_string(),
            missing: "keyword".to_string(),
        }
    );
}

#[tokio::test]
async fn builtin_registry_returns_seeded_order_history() {
    let store = Arc::new(InMemoryStore::new());
    store.seed_order("user-1", "Wireless headphones", 4999, "shipped");
    let registry = BuiltinToolRegistry::new(store);

    let outcome = registry
        .execute(&ToolInvocation::QueryUserOrders {
            user_id: "user-1".to_string(),
            limit: 5,
        })
        .await;

    assert!(outcome.success);
    let data = outcome.data.expect("success carries data");
    assert_eq!(data["count"], 1);
    assert_eq!(data["orders"][0]["item"], "Wireless headphones");
}

#[test]
fn tool_catalogue_lists_every_tool() {
    let text = catalogue_text();
    for spec in TOOL_SPECS {
        assert!(text.contains(spec.name));
    }
}

// ---------------------------------------------------------------------------
// Knowledge retrieval

#[tokio::test]
async fn local_knowledge_ranks_chunks_by_keyword_overlap() {
    let service = LocalFileKnowledgeService::from_chunks(vec![
        RetrievedDoc {
            text: "Shipping typically takes 3-5 business days.".to_string(),
            source: "kb.md#0".to_string(),
            score: 0.0,
        },
        RetrievedDoc {
            text: "Refund policy: refunds are processed within 30 days.".to_string(),
            source: "kb.md#1".to_string(),
            score: 0.0,
        },
    ]);

    let docs = service.retrieve("what is the refund policy", 3).await.unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].source, "kb.md#1");
    assert!(docs[0].score > 0.0);
}

#[tokio::test]
async fn local_knowledge_returns_nothing_for_stop_word_queries() {
    let service = LocalFileKnowledgeService::from_chunks(refund_chunks());
    let docs = service.retrieve("a an of", 3).await.unwrap();
    assert!(docs.is_empty());
}

#[test]
fn retrieved_context_formatting_carries_source_and_score() {
    let docs = vec![RetrievedDoc {
        text: "Refunds take 30 days.".to_string(),
        source: "kb.md#1".to_string(),
        score: 0.5,
    }];
    let formatted = format_retrieved_context(&docs);
    assert!(formatted.contains("[Source: kb.md#1 (Score: 50.0%)]"));
    assert!(formatted.contains("Refunds take 30 days."));
}

#[test]
fn query_terms_drop_punctuation_and_short_tokens() {
    let terms = query_terms("What is my ORDER?!");
    assert_eq!(terms, vec!["what".to_string(), "order".to_string()]);
}

// ---------------------------------------------------------------------------
// Brain

#[tokio::test]
async fn grounded_response_reports_high_confidence_and_sources() {
    let service = Arc::new(ScriptedGenerate {
        direct: Some("Refunds take 30 days.".to_string()),
        ..Default::default()
    });
    let policy = ModelPolicy::new(service, ModelTiers::default());
    let brain = Brain::new(
        policy,
        Arc::new(LocalFileKnowledgeService::from_chunks(refund_chunks())),
        Arc::new(InMemoryStore::new()),
        Arc::new(DisabledMediaService),
    );

    let response = brain.respond(&text_message("m1", "What is your refund policy?")).await;
    assert_eq!(response.confidence, CONFIDENCE_RETRIEVAL);
    assert!(response.used_retrieval);
    assert_eq!(response.sources, Some(vec!["knowledge_base".to_string()]));
}

#[tokio::test]
async fn ungrounded_response_reports_baseline_confidence() {
    let service = Arc::new(ScriptedGenerate {
        direct: Some("Hello!".to_string()),
        ..Default::default()
    });
    let policy = ModelPolicy::new(service, ModelTiers::default());
    let brain = Brain::new(
        policy,
        Arc::new(DisabledKnowledgeService),
        Arc::new(InMemoryStore::new()),
        Arc::new(DisabledMediaService),
    );

    let response = brain.respond(&text_message("m2", "hello there")).await;
    assert_eq!(response.confidence, CONFIDENCE_BASELINE);
    assert!(!response.used_retrieval);
    assert_eq!(response.sources, None);
}

#[tokio::test]
async fn failed_media_analysis_still_scores_as_multimodal() {
    let service = Arc::new(ScriptedGenerate {
        direct: Some("I could not see the image.".to_string()),
        ..Default::default()
    });
    let policy = ModelPolicy::new(service, ModelTiers::default());
    let brain = Brain::new(
        policy,
        Arc::new(DisabledKnowledgeService),
        Arc::new(InMemoryStore::new()),
        Arc::new(DisabledMediaService),
    );

    let mut message = image_message("m3");
    message.content = "look at this".to_string();
    let response = brain.respond(&message).await;
    assert_eq!(response.confidence, CONFIDENCE_MULTIMODAL);
}

#[tokio::test]
async fn brain_never_returns_an_empty_response_when_models_fail() {
    let service = Arc::new(SequenceGenerate::new(Vec::new()));
    let policy = ModelPolicy::new(service, ModelTiers::default());
    let brain = Brain::new(
        policy,
        Arc::new(DisabledKnowledgeService),
        Arc::new(InMemoryStore::new()),
        Arc::new(DisabledMediaService),
    );

    let response = brain.respond(&text_message("m4", "hello there")).await;
    assert_eq!(response.response, APOLOGY_RESPONSE);
    assert!(!response.response.is_empty());
}

#[test]
fn retrieval_gate_requires_length_and_a_knowledge_keyword() {
    assert!(!should_retrieve_context("hi"));
    assert!(!should_retrieve_context("how"));
    assert!(!should_retrieve_context("greetings friend"));
    assert!(should_retrieve_context("what is the price"));
    assert!(should_retrieve_context("REFUND please"));
}

#[test]
fn system_prompt_switches_between_grounded_and_ungrounded_rules() {
    let grounded = build_system_prompt("Refunds take 30 days.", "");
    assert!(grounded.contains("[KNOWLEDGE BASE]"));
    assert!(grounded.contains("Use ONLY"));

    let ungrounded = build_system_prompt("", "");
    assert!(ungrounded.contains("No specific knowledge base documents"));

    let with_media = build_system_prompt("", "A photo of a cat.");
    assert!(with_media.contains("[MEDIA CONTENT]: A photo of a cat."));
}

// ---------------------------------------------------------------------------
// Multimodal formatting

#[test]
fn image_caption_is_woven_into_the_processed_content() {
    let with_caption =
        format_multimodal_content("my new desk", "A wooden desk.", MessageKind::Image);
    assert!(with_caption.contains("caption: \"my new desk\""));
    assert!(with_caption.contains("Image description: A wooden desk."));

    let placeholder = format_multimodal_content("[Image]", "A wooden desk.", MessageKind::Image);
    assert!(placeholder.starts_with("User sent an image\n"));

    let audio = format_multimodal_content("", "Transcript: hello.", MessageKind::Audio);
    assert_eq!(audio, "User sent a voice message. Transcript: hello.");
}

// ---------------------------------------------------------------------------
// Configuration

#[test]
fn runtime_config_uses_built_in_defaults_without_a_profile_file() {
    let cli = Cli::try_parse_from(["cortex-agent", "doctor"]).unwrap();
    let cfg = resolve_runtime_config(&cli, &ProfilesFile::default()).unwrap();

    assert_eq!(cfg.profile, "default");
    assert_eq!(cfg.model_tiers, ModelTiers::default());
    assert_eq!(cfg.generate_endpoint, DEFAULT_GENERATE_ENDPOINT);
    assert_eq!(cfg.grace_period_secs, 300);
    assert!(cfg.telemetry_enabled);
    assert_eq!(cfg.user_id, "local-user");
}

#[test]
fn cli_flags_override_profile_values_which_override_defaults() {
    let profiles: ProfilesFile = toml::from_str(
        r#"
        [profiles.prod]
        primary_models = ["m-prime"]
        grace_period_secs = 10
        server_token = "tok"
        "#,
    )
    .unwrap();
    let cli = Cli::try_parse_from([
        "cortex-agent",
        "--profile",
        "prod",
        "--grace-period-secs",
        "20",
        "doctor",
    ])
    .unwrap();

    let cfg = resolve_runtime_config(&cli, &profiles).unwrap();
    assert_eq!(cfg.grace_period_secs, 20);
    assert_eq!(cfg.model_tiers.primary, vec!["m-prime".to_string()]);
    assert_eq!(cfg.model_tiers.fast, ModelTiers::default().fast);
    assert_eq!(cfg.server_token.as_deref(), Some("tok"));
    assert_eq!(cfg.grace_period(), Duration::from_secs(20));
}

#[test]
fn pinned_model_replaces_only_the_primary_tier() {
    let cli =
        Cli::try_parse_from(["cortex-agent", "--model", "pinned-model", "doctor"]).unwrap();
    let cfg = resolve_runtime_config(&cli, &ProfilesFile::default()).unwrap();

    assert_eq!(cfg.model_tiers.primary, vec!["pinned-model".to_string()]);
    assert_eq!(cfg.model_tiers.planning, ModelTiers::default().planning);
}

#[test]
fn unknown_profile_errors_list_the_available_names() {
    let profiles: ProfilesFile = toml::from_str(
        r#"
        [profiles.prod]
        user_id = "prod-user"
        "#,
    )
    .unwrap();
    let cli = Cli::try_parse_from(["cortex-agent", "--profile", "staging", "doctor"]).unwrap();

    let err = resolve_runtime_config(&cli, &profiles).unwrap_err();
    let message = format!("{err:#}");
    assert!(message.contains("staging"));
    assert!(message.contains("prod"));
}

#[test]
fn unknown_profile_fields_are_rejected() {
    let parsed = toml::from_str::<ProfilesFile>(
        r#"
        [profiles.default]
        not_a_field = true
        "#,
    );
    assert!(parsed.is_err());
}

#[test]
fn server_token_is_masked_unless_explicitly_revealed() {
    let mut cfg = base_cfg();
    assert_eq!(display_server_token(&cfg), "disabled");

    cfg.server_token = Some("tok".to_string());
    assert_eq!(
        display_server_token(&cfg),
        "set (use --show-sensitive-config to reveal)"
    );

    cfg.show_sensitive_config = true;
    assert_eq!(display_server_token(&cfg), "tok");
}

// ---------------------------------------------------------------------------
// Telemetry

#[test]
fn telemetry_summary_counts_command_and_workflow_outcomes() {
    let lines = vec![
        json!({"ts_unix_ms": 1, "event": "command.completed", "run_id": "run-1", "command": "ask"})
            .to_string(),
        json!({"ts_unix_ms": 2, "event": "workflow.completed", "run_id": "run-1", "command": "ask"})
            .to_string(),
        json!({"ts_unix_ms": 3, "event": "workflow.failed", "run_id": "run-2", "command": "serve"})
            .to_string(),
        "not json".to_string(),
    ];

    let summary = summarize_telemetry_lines(lines, 100);
    assert_eq!(summary.parsed_events, 3);
    assert_eq!(summary.parse_errors, 1);
    assert_eq!(summary.command_completed, 1);
    assert_eq!(summary.workflow_completed, 1);
    assert_eq!(summary.workflow_failed, 1);
    assert_eq!(summary.unique_runs.len(), 2);
    assert_eq!(summary.command_counts.get("ask"), Some(&2));
    assert_eq!(summary.last_event_ts_unix_ms, Some(3));
}

#[test]
fn telemetry_sink_appends_jsonl_records_with_run_context() {
    let dir = tempdir().unwrap();
    let mut cfg = base_cfg();
    cfg.telemetry_enabled = true;
    cfg.telemetry_path = dir
        .path()
        .join("events.jsonl")
        .to_string_lossy()
        .to_string();

    let sink = TelemetrySink::new(&cfg, "ask".to_string());
    sink.emit("workflow.completed", json!({ "workflow_id": "wf-1" }));
    sink.emit("command.completed", json!({}));

    let content = std::fs::read_to_string(&cfg.telemetry_path).unwrap();
    let records: Vec<Value> = content
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["event"], "workflow.completed");
    assert_eq!(records[0]["workflow_id"], "wf-1");
    assert_eq!(records[0]["command"], "ask");
    assert!(records[0]["run_id"].as_str().unwrap().starts_with("run-"));
}

#[test]
fn disabled_telemetry_sink_writes_nothing() {
    let dir = tempdir().unwrap();
    let mut cfg = base_cfg();
    cfg.telemetry_path = dir
        .path()
        .join("events.jsonl")
        .to_string_lossy()
        .to_string();

    let sink = TelemetrySink::new(&cfg, "ask".to_string());
    sink.emit("command.completed", json!({}));
    assert!(!std::path::Path::new(&cfg.telemetry_path).exists());
}

// ---------------------------------------------------------------------------
// Error taxonomy

#[test]
fn error_taxonomy_distinguishes_workflow_provider_and_tooling() {
    let workflow = anyhow::Error::new(OrchestratorError::WorkflowNotFound {
        id: "wf-1".to_string(),
    });
    assert_eq!(categorize_error(&workflow), ErrorCategory::Workflow);

    let provider = anyhow::anyhow!("GROQ_API_KEY is required for the generation backend");
    assert_eq!(categorize_error(&provider), ErrorCategory::Provider);

    let tooling = anyhow::anyhow!("knowledge document missing");
    assert_eq!(categorize_error(&tooling), ErrorCategory::Tooling);

    let internal = anyhow::anyhow!("something unexpected");
    assert_eq!(categorize_error(&internal), ErrorCategory::Internal);
}

#[test]
fn formatted_cli_errors_carry_the_code_and_a_hint() {
    let err = anyhow::anyhow!("GROQ_API_KEY is required for the generation backend");
    let formatted = format_cli_error(&err);
    assert!(formatted.starts_with("[PROVIDER]"));
    assert!(formatted.contains("Hint:"));
}

// ---------------------------------------------------------------------------
// Server surface

fn test_server_state(auth_token: Option<&str>) -> Arc<ServerState> {
    let cfg = base_cfg();
    let store = Arc::new(InMemoryStore::new());
    let service = Arc::new(ScriptedGenerate {
        classify: Some("simple".to_string()),
        direct: Some("ok".to_string()),
        ..Default::default()
    });
    let policy = ModelPolicy::new(service.clone(), ModelTiers::default());
    let orchestrator = orchestrator_with(service, store.clone(), Arc::new(DisabledKnowledgeService));
    let brain = Arc::new(Brain::new(
        policy,
        Arc::new(DisabledKnowledgeService),
        store,
        Arc::new(DisabledMediaService),
    ));
    let telemetry = TelemetrySink::new(&cfg, "serve".to_string());
    Arc::new(ServerState {
        cfg,
        orchestrator,
        brain,
        telemetry,
        auth_token: auth_token.map(str::to_string),
    })
}

#[test]
fn server_auth_is_open_when_no_token_is_configured() {
    let state = test_server_state(None);
    let headers = axum::http::HeaderMap::new();
    assert!(check_server_auth(&state, &headers).is_ok());
}

#[test]
fn server_auth_rejects_missing_or_wrong_bearer_tokens() {
    let state = test_server_state(Some("secret"));

    let headers = axum::http::HeaderMap::new();
    let err = check_server_auth(&state, &headers).unwrap_err();
    assert_eq!(err.0, axum::http::StatusCode::UNAUTHORIZED);

    let mut headers = axum::http::HeaderMap::new();
    headers.insert(
        axum::http::header::AUTHORIZATION,
        axum::http::HeaderValue::from_static("Bearer wrong"),
    );
    assert!(check_server_auth(&state, &headers).is_err());

    let mut headers = axum::http::HeaderMap::new();
    headers.insert(
        axum::http::header::AUTHORIZATION,
        axum::http::HeaderValue::from_static("Bearer secret"),
    );
    assert!(check_server_auth(&state, &headers).is_ok());
}

#[test]
fn chat_request_defaults_fill_channel_and_message_type() {
    let request: ChatRequest =
        serde_json::from_value(json!({ "user_id": "u1", "content": "hi" })).unwrap();
    assert_eq!(request.channel, Channel::Web);
    assert_eq!(request.message_type, MessageKind::Text);
    assert!(request.message_id.is_none());
    assert!(request.metadata.is_empty());
}

// ---------------------------------------------------------------------------
// CLI surface

#[test]
fn command_labels_match_subcommand_paths() {
    let cli = Cli::try_parse_from(["cortex-agent", "ask", "hello"]).unwrap();
    assert_eq!(command_label(cli.command.as_ref().unwrap()), "ask");

    let cli = Cli::try_parse_from(["cortex-agent", "profiles", "show"]).unwrap();
    assert_eq!(command_label(cli.command.as_ref().unwrap()), "profiles.show");

    let cli = Cli::try_parse_from(["cortex-agent", "telemetry", "report"]).unwrap();
    assert_eq!(
        command_label(cli.command.as_ref().unwrap()),
        "telemetry.report"
    );
}

#[test]
fn channel_argument_maps_onto_inbound_channels() {
    assert_eq!(ChannelArg::Web.to_channel(), Channel::Web);
    assert_eq!(ChannelArg::Whatsapp.to_channel(), Channel::Whatsapp);
    assert_eq!(ChannelArg::Telegram.to_channel(), Channel::Telegram);
}
