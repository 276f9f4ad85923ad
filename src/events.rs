use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::planner::PlanStep;

/// Producer may not advance past an emission until the consumer has accepted
/// it. Capacity 1 keeps exactly one event in flight.
pub const EVENT_CHANNEL_CAPACITY: usize = 1;

/// One unit on a workflow's progress stream. Events are totally ordered as
/// produced; nothing but `done` follows a `complete` or `error` event for the
/// same workflow, and `done` itself is appended by the transport.
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    Connected {
        workflow_id: String,
    },
    Status {
        status: String,
        message: String,
    },
    Retrieval {
        sources: Vec<String>,
        count: usize,
    },
    Step(PlanStep),
    Progress {
        step: usize,
        total: usize,
        description: String,
    },
    Complete {
        response: String,
        confidence: f64,
        tools_used: usize,
        execution_time_ms: u128,
    },
    Error {
        message: String,
    },
    Done,
}

impl WorkflowEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowEvent::Connected { .. } => "connected",
            WorkflowEvent::Status { .. } => "status",
            WorkflowEvent::Retrieval { .. } => "retrieval",
            WorkflowEvent::Step(_) => "step",
            WorkflowEvent::Progress { .. } => "progress",
            WorkflowEvent::Complete { .. } => "complete",
            WorkflowEvent::Error { .. } => "error",
            WorkflowEvent::Done => "done",
        }
    }

    pub fn data(&self) -> Value {
        match self {
            WorkflowEvent::Connected { workflow_id } => json!({ "workflowId": workflow_id }),
            WorkflowEvent::Status { status, message } => {
                json!({ "status": status, "message": message })
            }
            WorkflowEvent::Retrieval { sources, count } => {
                json!({ "sources": sources, "count": count })
            }
            WorkflowEvent::Step(step) => serde_json::to_value(step).unwrap_or(Value::Null),
            WorkflowEvent::Progress {
                step,
                total,
                description,
            } => json!({ "step": step, "total": total, "description": description }),
            WorkflowEvent::Complete {
                response,
                confidence,
                tools_used,
                execution_time_ms,
            } => json!({
                "response": response,
                "confidence": confidence,
                "toolsUsed": tools_used,
                "executionTime": execution_time_ms,
            }),
            WorkflowEvent::Error { message } => json!({ "message": message }),
            WorkflowEvent::Done => json!({}),
        }
    }

    /// Wire framing relayed unmodified by SSE-style transports.
    pub fn to_sse(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.kind(), self.data())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowEvent::Complete { .. } | WorkflowEvent::Error { .. })
    }
}

/// Sending half of the bounded progress stream. `send` suspends until the
/// consumer pulls the previous event and reports whether the consumer is
/// still attached, so an abandoned stream stops the producer at the next
/// emission instead of running the pipeline to completion unobserved.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<WorkflowEvent>,
}

impl EventSender {
    pub fn new(tx: mpsc::Sender<WorkflowEvent>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, event: WorkflowEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }
}

pub fn event_channel() -> (EventSender, mpsc::Receiver<WorkflowEvent>) {
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    (EventSender::new(tx), rx)
}
