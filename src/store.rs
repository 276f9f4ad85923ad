use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::message::Channel;

#[derive(Debug, Clone, Serialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserProfile {
    pub id: u64,
    pub channel: Channel,
    pub requester_id: String,
    pub username: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderRecord {
    pub id: u64,
    pub requester_id: String,
    pub item: String,
    pub total_cents: i64,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentRecord {
    pub filename: String,
    pub chunk_count: usize,
    pub created_at: DateTime<Utc>,
}

/// Conversation persistence consumed by the brain, the orchestrator (history
/// grounding), and the built-in tools. Backed by Postgres in production; the
/// in-memory implementation mirrors its tables for tests and local runs.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get_or_create_conversation(
        &self,
        channel: Channel,
        requester_id: &str,
        username: Option<&str>,
    ) -> Result<u64>;

    async fn save_message(
        &self,
        conversation_id: u64,
        role: &str,
        content: &str,
        metadata: Value,
    ) -> Result<()>;

    /// Chronological recent turns for one conversation.
    async fn recent_messages(&self, conversation_id: u64, limit: usize) -> Result<Vec<ChatTurn>>;

    /// Chronological recent turns across the requester's conversations.
    /// Failures degrade to empty history rather than failing the workflow.
    async fn history_for_requester(&self, requester_id: &str, limit: usize) -> Result<Vec<ChatTurn>>;

    async fn user_profile(&self, requester_id: &str) -> Result<Option<UserProfile>>;

    async fn user_orders(&self, requester_id: &str, limit: usize) -> Result<Vec<OrderRecord>>;

    async fn search_messages(&self, requester_id: &str, keyword: &str) -> Result<Vec<ChatTurn>>;

    async fn documents(&self) -> Result<Vec<DocumentRecord>>;
}

#[derive(Default)]
struct StoreInner {
    next_user_id: u64,
    next_conversation_id: u64,
    users: HashMap<String, UserProfile>,
    conversations: HashMap<String, u64>,
    messages: HashMap<u64, Vec<(String, String)>>,
    conversation_owner: HashMap<u64, String>,
    orders: Vec<OrderRecord>,
    documents: Vec<DocumentRecord>,
}

#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<StoreInner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_order(&self, requester_id: &str, item: &str, total_cents: i64, status: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = inner.orders.len() as u64 + 1;
        inner.orders.push(OrderRecord {
            id,
            requester_id: requester_id.to_string(),
            item: item.to_string(),
            total_cents,
            status: status.to_string(),
            created_at: Utc::now(),
        });
    }

    pub fn seed_document(&self, filename: &str, chunk_count: usize) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.documents.push(DocumentRecord {
            filename: filename.to_string(),
            chunk_count,
            created_at: Utc::now(),
        });
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn get_or_create_conversation(
        &self,
        channel: Channel,
        requester_id: &str,
        username: Option<&str>,
    ) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if !inner.users.contains_key(requester_id) {
            inner.next_user_id += 1;
            let profile = UserProfile {
                id: inner.next_user_id,
                channel,
                requester_id: requester_id.to_string(),
                username: username.map(str::to_string),
                created_at: Utc::now(),
            };
            inner.users.insert(requester_id.to_string(), profile);
        }

        if let Some(existing) = inner.conversations.get(requester_id) {
            return Ok(*existing);
        }

        inner.next_conversation_id += 1;
        let conversation_id = inner.next_conversation_id;
        inner
            .conversations
            .insert(requester_id.to_string(), conversation_id);
        inner
            .conversation_owner
            .insert(conversation_id, requester_id.to_string());
        Ok(conversation_id)
    }

    async fn save_message(
        &self,
        conversation_id: u64,
        role: &str,
        content: &str,
        _metadata: Value,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .messages
            .entry(conversation_id)
            .or_default()
            .push((role.to_string(), content.to_string()));
        Ok(())
    }

    async fn recent_messages(&self, conversation_id: u64, limit: usize) -> Result<Vec<ChatTurn>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let turns = inner
            .messages
            .get(&conversation_id)
            .map(|messages| {
                messages
                    .iter()
                    .rev()
                    .take(limit)
                    .rev()
                    .map(|(role, content)| ChatTurn {
                        role: role.clone(),
                        content: content.clone(),
                    })
                    .collect::<Vec<ChatTurn>>()
            })
            .unwrap_or_default();
        Ok(turns)
    }

    async fn history_for_requester(&self, requester_id: &str, limit: usize) -> Result<Vec<ChatTurn>> {
        let conversation_id = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.conversations.get(requester_id).copied()
        };
        match conversation_id {
            Some(id) => self.recent_messages(id, limit).await,
            None => Ok(Vec::new()),
        }
    }

    async fn user_profile(&self, requester_id: &str) -> Result<Option<UserProfile>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.users.get(requester_id).cloned())
    }

    async fn user_orders(&self, requester_id: &str, limit: usize) -> Result<Vec<OrderRecord>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut orders = inner
            .orders
            .iter()
            .filter(|order| order.requester_id == requester_id)
            .cloned()
            .collect::<Vec<OrderRecord>>();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        orders.truncate(limit);
        Ok(orders)
    }

    async fn search_messages(&self, requester_id: &str, keyword: &str) -> Result<Vec<ChatTurn>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let needle = keyword.to_ascii_lowercase();
        let Some(conversation_id) = inner.conversations.get(requester_id) else {
            return Ok(Vec::new());
        };
        let hits = inner
            .messages
            .get(conversation_id)
            .map(|messages| {
                messages
                    .iter()
                    .filter(|(_, content)| content.to_ascii_lowercase().contains(&needle))
                    .rev()
                    .take(10)
                    .map(|(role, content)| ChatTurn {
                        role: role.clone(),
                        content: content.clone(),
                    })
                    .collect::<Vec<ChatTurn>>()
            })
            .unwrap_or_default();
        Ok(hits)
    }

    async fn documents(&self) -> Result<Vec<DocumentRecord>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut documents = inner.documents.clone();
        documents.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        documents.truncate(10);
        Ok(documents)
    }
}
