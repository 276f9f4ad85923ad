use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Whatsapp,
    Telegram,
    Instagram,
    Linkedin,
    Snapchat,
    Web,
}

impl Channel {
    pub fn label(self) -> &'static str {
        match self {
            Channel::Whatsapp => "whatsapp",
            Channel::Telegram => "telegram",
            Channel::Instagram => "instagram",
            Channel::Linkedin => "linkedin",
            Channel::Snapchat => "snapchat",
            Channel::Web => "web",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Audio,
    Video,
}

impl MessageKind {
    pub fn is_multimodal(self) -> bool {
        matches!(self, MessageKind::Image | MessageKind::Audio | MessageKind::Video)
    }
}

/// Channel-normalized inbound message. Produced by the per-channel inbound
/// adapters, consumed by the brain and the workflow orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedMessage {
    pub channel: Channel,
    pub user_id: String,
    pub message_id: String,
    #[serde(default = "default_message_kind")]
    pub message_type: MessageKind,
    pub content: String,
    pub timestamp: i64,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

fn default_message_kind() -> MessageKind {
    MessageKind::Text
}

impl UnifiedMessage {
    pub fn text(channel: Channel, user_id: &str, message_id: &str, content: &str) -> Self {
        Self {
            channel,
            user_id: user_id.to_string(),
            message_id: message_id.to_string(),
            message_type: MessageKind::Text,
            content: content.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            metadata: HashMap::new(),
        }
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

/// Final assistant response assembled by the brain layer.
#[derive(Debug, Clone, Serialize)]
pub struct AgentResponse {
    pub conversation_id: String,
    pub response: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<String>>,
    pub confidence: f64,
    pub used_retrieval: bool,
}
