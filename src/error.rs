use thiserror::Error;

/// Workflow lifecycle violations surfaced to the caller of the orchestrator.
/// Everything recoverable inside a run (tool failures, model fallbacks,
/// multimodal degradation) is handled locally and never reaches this type.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("workflow '{id}' not found")]
    WorkflowNotFound { id: String },
    #[error("workflow '{id}' already exists")]
    DuplicateWorkflow { id: String },
    #[error("workflow '{id}' is already executing")]
    WorkflowBusy { id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Provider,
    Workflow,
    Tooling,
    Input,
    Internal,
}

impl ErrorCategory {
    pub fn code(self) -> &'static str {
        match self {
            ErrorCategory::Provider => "PROVIDER",
            ErrorCategory::Workflow => "WORKFLOW",
            ErrorCategory::Tooling => "TOOLING",
            ErrorCategory::Input => "INPUT",
            ErrorCategory::Internal => "INTERNAL",
        }
    }

    pub fn hint(self) -> &'static str {
        match self {
            ErrorCategory::Provider => {
                "Set GROQ_API_KEY (or generate_endpoint in the profile) and check model tier names."
            }
            ErrorCategory::Workflow => {
                "Each workflow id must be initialized once and executed once. Use a fresh id per inbound message."
            }
            ErrorCategory::Tooling => {
                "Review tool names/parameters and retry with RUST_LOG=info for tool lifecycle logs."
            }
            ErrorCategory::Input => "Run cortex-agent --help and correct command arguments.",
            ErrorCategory::Internal => {
                "Retry with RUST_LOG=debug. If it persists, capture logs and open an issue."
            }
        }
    }
}

pub fn categorize_error(err: &anyhow::Error) -> ErrorCategory {
    if err.downcast_ref::<OrchestratorError>().is_some() {
        return ErrorCategory::Workflow;
    }

    let msg = format!("{err:#}").to_ascii_lowercase();

    if msg.contains("api_key") || msg.contains("groq") || msg.contains("model tier") {
        return ErrorCategory::Provider;
    }

    if msg.contains("invalid value")
        || msg.contains("unknown argument")
        || msg.contains("profile")
        || msg.contains("failed to read input")
    {
        return ErrorCategory::Input;
    }

    if msg.contains("workflow") {
        return ErrorCategory::Workflow;
    }

    if msg.contains("tool") || msg.contains("knowledge") || msg.contains("retrieval") {
        return ErrorCategory::Tooling;
    }

    ErrorCategory::Internal
}

pub fn format_cli_error(err: &anyhow::Error) -> String {
    let category = categorize_error(err);
    format!("[{}] {:#}\nHint: {}", category.code(), err, category.hint())
}
