use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::OrchestratorError;
use crate::events::{event_channel, EventSender, WorkflowEvent};
use crate::knowledge::KnowledgeService;
use crate::message::UnifiedMessage;
use crate::multimodal::{preprocess_media, MediaService};
use crate::planner::{ExecutionPlan, PlanContext, PlanStep, Planner};
use crate::store::ConversationStore;

/// Terminal workflows stay visible this long before the sweep removes them.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(300);

const RETRIEVAL_TOP_K: usize = 3;
const HISTORY_LIMIT: usize = 5;
const PROGRESS_PACING: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStatus {
    Initialized,
    Analyzing,
    Retrieving,
    Planning,
    Executing,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::Initialized => "initialized",
            WorkflowStatus::Analyzing => "analyzing",
            WorkflowStatus::Retrieving => "retrieving",
            WorkflowStatus::Planning => "planning",
            WorkflowStatus::Executing => "executing",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed)
    }
}

struct WorkflowState {
    requester_id: String,
    status: WorkflowStatus,
    current_step: usize,
    total_steps: usize,
    processed_message: String,
    plan: Option<ExecutionPlan>,
    results: Vec<String>,
    errors: Vec<String>,
    started_at: Instant,
    last_update: Instant,
    finished_at: Option<Instant>,
    executing: bool,
}

/// Read-only view of one workflow record for status lookups.
#[derive(Debug, Clone)]
pub struct WorkflowSnapshot {
    pub id: String,
    pub status: WorkflowStatus,
    pub current_step: usize,
    pub total_steps: usize,
    pub errors: Vec<String>,
}

/// Drives the per-request pipeline with explicit collaborators instead of
/// process globals. Each workflow id is owned by exactly one execution run;
/// the keyed store is the only shared mutable state and every mutation holds
/// the map lock only across synchronous sections.
pub struct Orchestrator {
    workflows: Mutex<HashMap<String, WorkflowState>>,
    knowledge: Arc<dyn KnowledgeService>,
    store: Arc<dyn ConversationStore>,
    media: Arc<dyn MediaService>,
    planner: Planner,
    grace_period: Duration,
}

impl Orchestrator {
    pub fn new(
        knowledge: Arc<dyn KnowledgeService>,
        store: Arc<dyn ConversationStore>,
        media: Arc<dyn MediaService>,
        planner: Planner,
    ) -> Self {
        Self {
            workflows: Mutex::new(HashMap::new()),
            knowledge,
            store,
            media,
            planner,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Registers a workflow for the message. Image and audio messages pass
    /// through media preprocessing first; a preprocessing failure is recorded
    /// and the original text is used unchanged.
    pub async fn initialize(
        &self,
        message: &UnifiedMessage,
    ) -> Result<WorkflowSnapshot, OrchestratorError> {
        self.sweep_expired();
        {
            let workflows = self.lock_workflows();
            if workflows.contains_key(&message.message_id) {
                return Err(OrchestratorError::DuplicateWorkflow {
                    id: message.message_id.clone(),
                });
            }
        }

        let now = Instant::now();
        let mut state = WorkflowState {
            requester_id: message.user_id.clone(),
            status: WorkflowStatus::Initialized,
            current_step: 0,
            total_steps: 0,
            processed_message: message.content.clone(),
            plan: None,
            results: Vec::new(),
            errors: Vec::new(),
            started_at: now,
            last_update: now,
            finished_at: None,
            executing: false,
        };

        if message.message_type.is_multimodal() {
            if let Some(file_id) = message.metadata_str("file_id").map(str::to_string) {
                state.status = WorkflowStatus::Analyzing;
                match preprocess_media(self.media.as_ref(), message, &file_id).await {
                    Ok(enriched) => state.processed_message = enriched,
                    Err(err) => {
                        warn!(workflow_id = %message.message_id, error = %err,
                              "media preprocessing failed, continuing with raw text");
                        state
                            .errors
                            .push(format!("Multimodal processing failed: {err}"));
                    }
                }
            }
        }

        let snapshot = WorkflowSnapshot {
            id: message.message_id.clone(),
            status: state.status,
            current_step: 0,
            total_steps: 0,
            errors: state.errors.clone(),
        };

        let mut workflows = self.lock_workflows();
        // Window between the duplicate check and this insert: last writer
        // would win, so re-check under the same lock.
        if workflows.contains_key(&message.message_id) {
            return Err(OrchestratorError::DuplicateWorkflow {
                id: message.message_id.clone(),
            });
        }
        workflows.insert(message.message_id.clone(), state);
        info!(workflow_id = %message.message_id, channel = %message.channel.label(),
              "workflow initialized");
        Ok(snapshot)
    }

    /// Starts the pipeline and returns its event stream. The channel is
    /// bounded to one in-flight event, so the producer suspends on every
    /// emission until the consumer accepts it; a dropped receiver stops the
    /// run at the next emission. May be called once per workflow id.
    pub fn execute(
        self: Arc<Self>,
        workflow_id: &str,
    ) -> Result<mpsc::Receiver<WorkflowEvent>, OrchestratorError> {
        self.sweep_expired();
        {
            let mut workflows = self.lock_workflows();
            let state = workflows.get_mut(workflow_id).ok_or_else(|| {
                OrchestratorError::WorkflowNotFound {
                    id: workflow_id.to_string(),
                }
            })?;
            if state.executing {
                return Err(OrchestratorError::WorkflowBusy {
                    id: workflow_id.to_string(),
                });
            }
            state.executing = true;
        }

        let (tx, rx) = event_channel();
        let id = workflow_id.to_string();
        tokio::spawn(async move {
            self.run_pipeline(&id, &tx).await;
        });
        Ok(rx)
    }

    pub fn status(&self, workflow_id: &str) -> Option<WorkflowSnapshot> {
        self.sweep_expired();
        let workflows = self.lock_workflows();
        workflows.get(workflow_id).map(|state| WorkflowSnapshot {
            id: workflow_id.to_string(),
            status: state.status,
            current_step: state.current_step,
            total_steps: state.total_steps,
            errors: state.errors.clone(),
        })
    }

    /// Marks a workflow failed on behalf of the caller. Does not interrupt a
    /// pipeline already in flight.
    pub fn cancel(&self, workflow_id: &str) -> bool {
        let mut workflows = self.lock_workflows();
        match workflows.get_mut(workflow_id) {
            Some(state) => {
                state.status = WorkflowStatus::Failed;
                state.errors.push("Cancelled by user".to_string());
                state.finished_at = Some(Instant::now());
                state.last_update = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Removes terminal workflows whose grace period has passed. Called
    /// lazily on every access and periodically by the server task.
    pub fn sweep_expired(&self) -> usize {
        let grace = self.grace_period;
        let mut workflows = self.lock_workflows();
        let before = workflows.len();
        workflows.retain(|_, state| match state.finished_at {
            Some(finished) => finished.elapsed() < grace,
            None => true,
        });
        let removed = before - workflows.len();
        if removed > 0 {
            debug!(removed, "swept expired workflows");
        }
        removed
    }

    pub fn active_count(&self) -> usize {
        self.lock_workflows().len()
    }

    async fn run_pipeline(&self, workflow_id: &str, tx: &EventSender) {
        let outcome = self.pipeline_stages(workflow_id, tx).await;

        if let Err(err) = outcome {
            let message = err.to_string();
            warn!(workflow_id = %workflow_id, error = %message, "workflow failed");
            self.with_workflow(workflow_id, |state| {
                state.status = WorkflowStatus::Failed;
                state.errors.push(message.clone());
                state.finished_at = Some(Instant::now());
            });
            tx.send(WorkflowEvent::Error { message }).await;
        }

        // Eviction is scheduled regardless of outcome, including a run cut
        // short by a disconnected consumer.
        self.with_workflow(workflow_id, |state| {
            state.last_update = Instant::now();
            if state.finished_at.is_none() {
                state.finished_at = Some(Instant::now());
            }
        });
    }

    /// Stages 1-4 of the run. Ok(()) covers both completion and an abandoned
    /// consumer; Err means an unexpected failure that becomes the terminal
    /// `error` event.
    async fn pipeline_stages(&self, workflow_id: &str, tx: &EventSender) -> Result<()> {
        let (query, requester_id, started_at) = self
            .with_workflow(workflow_id, |state| {
                state.status = WorkflowStatus::Retrieving;
                (
                    state.processed_message.clone(),
                    state.requester_id.clone(),
                    state.started_at,
                )
            })
            .ok_or_else(|| anyhow::anyhow!("workflow record disappeared mid-run"))?;

        if !tx
            .send(WorkflowEvent::Status {
                status: WorkflowStatus::Retrieving.as_str().to_string(),
                message: "Searching knowledge base...".to_string(),
            })
            .await
        {
            return Ok(());
        }

        let docs = match self.knowledge.retrieve(&query, RETRIEVAL_TOP_K).await {
            Ok(docs) => docs,
            Err(err) => {
                warn!(workflow_id = %workflow_id, error = %err,
                      "knowledge retrieval failed, continuing without context");
                self.with_workflow(workflow_id, |state| {
                    state.errors.push(format!("Retrieval failed: {err}"));
                });
                Vec::new()
            }
        };

        if !docs.is_empty() {
            let sources: Vec<String> = docs.iter().map(|d| d.source.clone()).collect();
            let count = docs.len();
            if !tx.send(WorkflowEvent::Retrieval { sources, count }).await {
                return Ok(());
            }
        }

        self.with_workflow(workflow_id, |state| {
            state.status = WorkflowStatus::Planning;
        });
        if !tx
            .send(WorkflowEvent::Status {
                status: WorkflowStatus::Planning.as_str().to_string(),
                message: "Planning approach...".to_string(),
            })
            .await
        {
            return Ok(());
        }

        let history = self
            .store
            .history_for_requester(&requester_id, HISTORY_LIMIT)
            .await
            .unwrap_or_default();
        let context = PlanContext {
            requester_id,
            history,
            retrieved_context: (!docs.is_empty()).then(|| {
                docs.iter()
                    .map(|d| d.text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n\n")
            }),
        };

        let mut step_log: Vec<PlanStep> = Vec::new();
        let plan = self
            .planner
            .create_and_execute(&query, &context, |step| step_log.push(step.clone()))
            .await;

        let total = plan.steps.len();
        self.with_workflow(workflow_id, |state| {
            state.total_steps = total;
            state.plan = Some(plan.clone());
        });

        for step in step_log {
            if !tx.send(WorkflowEvent::Step(step)).await {
                return Ok(());
            }
        }

        self.with_workflow(workflow_id, |state| {
            state.status = WorkflowStatus::Executing;
        });
        if !tx
            .send(WorkflowEvent::Status {
                status: WorkflowStatus::Executing.as_str().to_string(),
                message: "Executing plan...".to_string(),
            })
            .await
        {
            return Ok(());
        }

        for (i, step) in plan.steps.iter().enumerate() {
            self.with_workflow(workflow_id, |state| {
                state.current_step = i + 1;
            });
            if !tx
                .send(WorkflowEvent::Progress {
                    step: i + 1,
                    total,
                    description: step.content.clone(),
                })
                .await
            {
                return Ok(());
            }
            tokio::time::sleep(PROGRESS_PACING).await;
        }

        let response = plan.final_answer.clone().unwrap_or_default();
        self.with_workflow(workflow_id, |state| {
            state.status = WorkflowStatus::Completed;
            state.results.push(response.clone());
            state.finished_at = Some(Instant::now());
        });
        tx.send(WorkflowEvent::Complete {
            response,
            confidence: plan.confidence,
            tools_used: plan.tools_used(),
            execution_time_ms: started_at.elapsed().as_millis(),
        })
        .await;

        info!(workflow_id = %workflow_id, steps = total, confidence = plan.confidence,
              "workflow completed");
        Ok(())
    }

    fn with_workflow<R>(
        &self,
        workflow_id: &str,
        f: impl FnOnce(&mut WorkflowState) -> R,
    ) -> Option<R> {
        let mut workflows = self.lock_workflows();
        workflows.get_mut(workflow_id).map(f)
    }

    fn lock_workflows(&self) -> std::sync::MutexGuard<'_, HashMap<String, WorkflowState>> {
        match self.workflows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
