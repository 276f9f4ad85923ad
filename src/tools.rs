use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

use crate::store::ConversationStore;

pub const QUERY_USER_ORDERS: &str = "query_user_orders";
pub const GET_USER_INFO: &str = "get_user_info";
pub const SEARCH_CONVERSATIONS: &str = "search_conversations";
pub const GET_DOCUMENT_INFO: &str = "get_document_info";

const DEFAULT_ORDER_LIMIT: usize = 5;

#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub required: &'static [&'static str],
}

pub const TOOL_SPECS: &[ToolSpec] = &[
    ToolSpec {
        name: QUERY_USER_ORDERS,
        description: "Retrieve order history for a specific user",
        required: &["user_id"],
    },
    ToolSpec {
        name: GET_USER_INFO,
        description: "Get user profile information",
        required: &["user_id"],
    },
    ToolSpec {
        name: SEARCH_CONVERSATIONS,
        description: "Search through conversation history",
        required: &["user_id", "keyword"],
    },
    ToolSpec {
        name: GET_DOCUMENT_INFO,
        description: "Get information about uploaded documents in knowledge base",
        required: &[],
    },
];

/// Catalogue description handed to the decomposition prompt.
pub fn catalogue_text() -> String {
    TOOL_SPECS
        .iter()
        .map(|spec| format!("- {}: {}", spec.name, spec.description))
        .collect::<Vec<String>>()
        .join("\n")
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("tool '{0}' not found")]
    UnknownTool(String),
    #[error("missing required parameters for '{tool}': {missing}")]
    MissingParams { tool: String, missing: String },
}

/// Validated tool call. Unknown names and missing required parameters are
/// rejected at parse time, before any execution happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolInvocation {
    QueryUserOrders { user_id: String, limit: usize },
    GetUserInfo { user_id: String },
    SearchConversations { user_id: String, keyword: String },
    GetDocumentInfo,
}

impl ToolInvocation {
    pub fn parse(name: &str, params: &Value) -> Result<Self, ToolError> {
        match name {
            QUERY_USER_ORDERS => Ok(ToolInvocation::QueryUserOrders {
                user_id: required_str(name, params, "user_id")?,
                limit: params
                    .get("limit")
                    .and_then(Value::as_u64)
                    .map(|v| v as usize)
                    .unwrap_or(DEFAULT_ORDER_LIMIT),
            }),
            GET_USER_INFO => Ok(ToolInvocation::GetUserInfo {
                user_id: required_str(name, params, "user_id")?,
            }),
            SEARCH_CONVERSATIONS => Ok(ToolInvocation::SearchConversations {
                user_id: required_str(name, params, "user_id")?,
                keyword: required_str(name, params, "keyword")?,
            }),
            GET_DOCUMENT_INFO => Ok(ToolInvocation::GetDocumentInfo),
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }

    pub fn tool_name(&self) -> &'static str {
        match self {
            ToolInvocation::QueryUserOrders { .. } => QUERY_USER_ORDERS,
            ToolInvocation::GetUserInfo { .. } => GET_USER_INFO,
            ToolInvocation::SearchConversations { .. } => SEARCH_CONVERSATIONS,
            ToolInvocation::GetDocumentInfo => GET_DOCUMENT_INFO,
        }
    }
}

fn required_str(tool: &str, params: &Value, key: &str) -> Result<String, ToolError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .filter(|v| !v.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| ToolError::MissingParams {
            tool: tool.to_string(),
            missing: key.to_string(),
        })
}

/// Tool call result. `success: false` carries the error text; the plan
/// continues either way.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    pub fn to_value(&self) -> Value {
        match (&self.data, &self.error) {
            (Some(data), _) => json!({ "success": self.success, "data": data }),
            (None, Some(error)) => json!({ "success": self.success, "error": error }),
            (None, None) => json!({ "success": self.success }),
        }
    }
}

#[async_trait]
pub trait ToolRegistry: Send + Sync {
    fn specs(&self) -> &'static [ToolSpec] {
        TOOL_SPECS
    }

    async fn execute(&self, call: &ToolInvocation) -> ToolOutcome;
}

/// Built-in tools backed by the conversation store, mirroring the production
/// database-backed catalogue.
pub struct BuiltinToolRegistry {
    store: Arc<dyn ConversationStore>,
}

impl BuiltinToolRegistry {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ToolRegistry for BuiltinToolRegistry {
    async fn execute(&self, call: &ToolInvocation) -> ToolOutcome {
        let outcome = match call {
            ToolInvocation::QueryUserOrders { user_id, limit } => self
                .store
                .user_orders(user_id, *limit)
                .await
                .map(|orders| {
                    let count = orders.len();
                    json!({ "orders": orders, "count": count })
                }),
            ToolInvocation::GetUserInfo { user_id } => self
                .store
                .user_profile(user_id)
                .await
                .map(|profile| json!({ "user": profile })),
            ToolInvocation::SearchConversations { user_id, keyword } => self
                .store
                .search_messages(user_id, keyword)
                .await
                .map(|hits| {
                    let count = hits.len();
                    json!({ "matches": hits, "count": count })
                }),
            ToolInvocation::GetDocumentInfo => self.store.documents().await.map(|docs| {
                let count = docs.len();
                json!({ "documents": docs, "count": count })
            }),
        };

        match outcome {
            Ok(data) => {
                tracing::info!(tool = call.tool_name(), "tool execution completed");
                ToolOutcome::ok(data)
            }
            Err(err) => {
                tracing::warn!(tool = call.tool_name(), error = %err, "tool execution failed");
                ToolOutcome::failed(err.to_string())
            }
        }
    }
}
