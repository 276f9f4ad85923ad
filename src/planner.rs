use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::model::{ChatMessage, GenerateOptions, ModelPolicy};
use crate::store::ChatTurn;
use crate::tools::{catalogue_text, ToolInvocation, ToolRegistry};

pub const DIRECT_RESPONSE_FALLBACK: &str = "I apologize, I couldn't process that request.";
pub const SYNTHESIS_FALLBACK: &str = "I've processed your request.";
pub const SIMPLE_PATH_CONFIDENCE: f64 = 0.8;

/// How much raw tool output the synthesis prompt is allowed to carry.
const TOOL_RESULTS_PROMPT_LIMIT: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Thought,
    Action,
    Observation,
    Final,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// One unit of plan execution. `tool` is set only on action steps; `result`
/// only once the step has resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStep {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: StepKind,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub status: StepStatus,
}

impl PlanStep {
    fn new(id: impl Into<String>, kind: StepKind, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            content: content.into(),
            tool: None,
            tool_params: None,
            result: None,
            status: StepStatus::Pending,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub original_query: String,
    pub steps: Vec<PlanStep>,
    pub final_answer: Option<String>,
    pub confidence: f64,
}

impl ExecutionPlan {
    pub fn tools_used(&self) -> usize {
        self.steps.iter().filter(|s| s.tool.is_some()).count()
    }
}

/// Grounding handed to the planner by the controller for one query.
#[derive(Debug, Clone, Default)]
pub struct PlanContext {
    pub requester_id: String,
    pub history: Vec<ChatTurn>,
    pub retrieved_context: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Complexity {
    Simple,
    Complex,
}

/// Shape the decomposition call is asked to produce.
#[derive(Debug, Deserialize)]
struct Decomposition {
    #[serde(default)]
    steps: Vec<StepDefinition>,
}

#[derive(Debug, Deserialize)]
struct StepDefinition {
    reasoning: String,
    #[serde(default)]
    tool: Option<String>,
    #[serde(default)]
    params: Value,
}

/// Builds and executes plans. Tool calls happen here, during construction;
/// the controller later replays steps as progress without re-executing.
pub struct Planner {
    policy: ModelPolicy,
    tools: Arc<dyn ToolRegistry>,
}

impl Planner {
    pub fn new(policy: ModelPolicy, tools: Arc<dyn ToolRegistry>) -> Self {
        Self { policy, tools }
    }

    /// Classifies, decomposes, and executes in one pass. `on_step` fires at
    /// every step construction and status transition, in order; callers that
    /// stream progress rely on that ordering.
    pub async fn create_and_execute(
        &self,
        query: &str,
        context: &PlanContext,
        mut on_step: impl FnMut(&PlanStep),
    ) -> ExecutionPlan {
        let mut plan = ExecutionPlan {
            original_query: query.to_string(),
            steps: Vec::new(),
            final_answer: None,
            confidence: 0.0,
        };

        info!(query = %query, "building execution plan");

        if self.classify_complexity(query).await == Complexity::Simple {
            let mut step = PlanStep::new("1", StepKind::Final, "Direct response to simple query");
            on_step(&step);

            let response = self.direct_response(query, context).await;
            step.status = StepStatus::Completed;
            step.result = Some(Value::String(response.clone()));
            on_step(&step);

            plan.steps.push(step);
            plan.final_answer = Some(response);
            plan.confidence = SIMPLE_PATH_CONFIDENCE;
            return plan;
        }

        let definitions = self.decompose(query).await;
        info!(steps = definitions.len(), "query decomposed");

        for (i, def) in definitions.iter().enumerate() {
            let mut thought =
                PlanStep::new(format!("step-{i}-thought"), StepKind::Thought, &def.reasoning);
            thought.status = StepStatus::Running;
            on_step(&thought);
            plan.steps.push(thought);
            let thought_idx = plan.steps.len() - 1;

            if let Some(tool) = &def.tool {
                let mut action = PlanStep::new(
                    format!("step-{i}-action"),
                    StepKind::Action,
                    format!("Executing {tool}"),
                );
                action.tool = Some(tool.clone());
                action.tool_params = Some(def.params.clone());
                action.status = StepStatus::Running;
                on_step(&action);

                match self.run_tool(tool, &def.params).await {
                    Ok(result) => {
                        action.status = StepStatus::Completed;
                        action.result = Some(result.clone());
                        on_step(&action);
                        plan.steps.push(action);

                        let mut obs = PlanStep::new(
                            format!("step-{i}-obs"),
                            StepKind::Observation,
                            "Tool returned data",
                        );
                        obs.status = StepStatus::Completed;
                        obs.result = Some(result);
                        on_step(&obs);
                        plan.steps.push(obs);
                    }
                    Err(message) => {
                        warn!(tool = %tool, error = %message, "tool step failed, continuing plan");
                        action.status = StepStatus::Failed;
                        action.result = Some(Value::String(message));
                        on_step(&action);
                        plan.steps.push(action);
                    }
                }
            }

            plan.steps[thought_idx].status = StepStatus::Completed;
            on_step(&plan.steps[thought_idx]);
        }

        let mut final_step = PlanStep::new("final", StepKind::Final, "Synthesizing final response");
        final_step.status = StepStatus::Running;
        on_step(&final_step);

        let answer = self.synthesize(query, &plan.steps).await;
        final_step.status = StepStatus::Completed;
        final_step.result = Some(Value::String(answer.clone()));
        on_step(&final_step);
        plan.steps.push(final_step);

        plan.final_answer = Some(answer);
        plan.confidence = score_confidence(&plan.steps);
        plan
    }

    /// One classification call; anything other than a clear "complex" answer,
    /// including total failure, falls open to the cheaper simple path.
    pub async fn classify_complexity(&self, query: &str) -> Complexity {
        let prompt = format!(
            "Analyze if this query requires multiple steps or external tools:\n\
             Query: \"{query}\"\n\n\
             Simple: Greeting, general knowledge, FAQ, opinion\n\
             Complex: Requires database lookup, calculations, multiple pieces of info, API calls\n\n\
             Respond with ONLY \"simple\" or \"complex\"."
        );
        let messages = [ChatMessage::user(prompt)];
        let candidates = self.policy.tiers.classification.clone();

        match self
            .policy
            .try_candidates(&candidates, &messages, GenerateOptions::CLASSIFY)
            .await
        {
            Some(answer) if answer.to_lowercase().contains("complex") => Complexity::Complex,
            other => {
                debug!(answer = ?other, "classified as simple");
                Complexity::Simple
            }
        }
    }

    async fn direct_response(&self, query: &str, context: &PlanContext) -> String {
        let grounding = context.retrieved_context.as_deref().unwrap_or("");
        let mut messages = vec![ChatMessage::system(format!(
            "You are a helpful assistant. {grounding}"
        ))];
        let tail = context.history.len().saturating_sub(3);
        for turn in &context.history[tail..] {
            messages.push(ChatMessage {
                role: turn.role.clone(),
                content: turn.content.clone(),
            });
        }
        messages.push(ChatMessage::user(query));

        let candidates = self.policy.tiers.planning.clone();
        match self
            .policy
            .try_candidates(&candidates, &messages, GenerateOptions::RESPOND)
            .await
        {
            Some(text) => text,
            None => DIRECT_RESPONSE_FALLBACK.to_string(),
        }
    }

    async fn decompose(&self, query: &str) -> Vec<StepDefinition> {
        let prompt = format!(
            "Break down this query into steps. Available tools:\n{}\n\n\
             Query: \"{query}\"\n\n\
             Respond in JSON:\n\
             {{\n  \"steps\": [\n    {{\n      \"reasoning\": \"why this step\",\n      \
             \"tool\": \"tool_name or null\",\n      \"params\": {{ \"param\": \"value\" }}\n    \
             }}\n  ]\n}}",
            catalogue_text()
        );
        let messages = [ChatMessage::user(prompt)];
        let candidates = self.policy.tiers.planning.clone();

        let fallback = || {
            vec![StepDefinition {
                reasoning: "Direct response".to_string(),
                tool: None,
                params: Value::Null,
            }]
        };

        let raw = match self
            .policy
            .try_candidates(&candidates, &messages, GenerateOptions::DECOMPOSE)
            .await
        {
            Some(raw) => raw,
            None => return fallback(),
        };

        match extract_json_object(&raw).and_then(|json| {
            serde_json::from_str::<Decomposition>(json).ok()
        }) {
            Some(decomposition) => decomposition.steps,
            None => {
                warn!("decomposition output was not parseable JSON, using direct-response step");
                fallback()
            }
        }
    }

    /// Unknown tool names and missing required parameters are rejected before
    /// any call is issued; both surface as the action's failure text.
    async fn run_tool(&self, name: &str, params: &Value) -> Result<Value, String> {
        let invocation = ToolInvocation::parse(name, params).map_err(|err| err.to_string())?;
        let outcome = self.tools.execute(&invocation).await;
        if outcome.success {
            Ok(outcome.to_value())
        } else {
            Err(outcome
                .error
                .unwrap_or_else(|| "tool execution failed".to_string()))
        }
    }

    async fn synthesize(&self, query: &str, steps: &[PlanStep]) -> String {
        let transcript = steps
            .iter()
            .map(|s| format!("- {}: {}", kind_label(s.kind), s.content))
            .collect::<Vec<_>>()
            .join("\n");
        let tool_results: Vec<&Value> = steps
            .iter()
            .filter(|s| s.kind == StepKind::Observation)
            .filter_map(|s| s.result.as_ref())
            .collect();
        let mut results_json = serde_json::to_string(&tool_results).unwrap_or_default();
        results_json.truncate(floor_char_boundary(&results_json, TOOL_RESULTS_PROMPT_LIMIT));

        let prompt = format!(
            "Synthesize final answer based on executed steps.\n\n\
             Original Query: \"{query}\"\n\n\
             Steps: {transcript}\n\n\
             Tool Results: {results_json}"
        );
        let messages = [ChatMessage::user(prompt)];
        let candidates = self.policy.tiers.planning.clone();

        match self
            .policy
            .try_candidates(&candidates, &messages, GenerateOptions::RESPOND)
            .await
        {
            Some(text) => text,
            None => SYNTHESIS_FALLBACK.to_string(),
        }
    }
}

fn kind_label(kind: StepKind) -> &'static str {
    match kind {
        StepKind::Thought => "thought",
        StepKind::Action => "action",
        StepKind::Observation => "observation",
        StepKind::Final => "final",
    }
}

/// The decomposition model often wraps its JSON in prose; take the outermost
/// braced object.
fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end >= start).then(|| &raw[start..=end])
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Completed-over-total ratio with a bonus for a clean run.
pub fn score_confidence(steps: &[PlanStep]) -> f64 {
    let total = steps.len();
    if total == 0 {
        return 0.0;
    }
    let completed = steps
        .iter()
        .filter(|s| s.status == StepStatus::Completed)
        .count();
    let mut score = completed as f64 / total as f64;
    if !steps.iter().any(|s| s.status == StepStatus::Failed) {
        score += 0.1;
    }
    score.min(1.0)
}
