use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use serde_json::json;
use tracing::{info, warn};

use crate::knowledge::{format_retrieved_context, KnowledgeService};
use crate::message::{AgentResponse, MessageKind, UnifiedMessage};
use crate::model::{ChatMessage, GenerateOptions, ModelPolicy};
use crate::multimodal::{format_multimodal_content, MediaService};
use crate::store::ConversationStore;

const CRITICAL_FALLBACK: &str =
    "I apologize, but I'm experiencing technical difficulties. Please try again in a moment.";
const MEDIA_ERROR_MARKER: &str = "[Error processing media]";
const HISTORY_LIMIT: usize = 5;
const RETRIEVAL_TOP_K: usize = 3;

/// Confidence reported by the response-assembly layer. This scale is about
/// grounding quality of a single response and is unrelated to the plan
/// confidence computed from step completion.
pub const CONFIDENCE_RETRIEVAL: f64 = 0.95;
pub const CONFIDENCE_MULTIMODAL: f64 = 0.9;
pub const CONFIDENCE_BASELINE: f64 = 0.75;

/// Single-shot response assembly: multimodal enrichment, keyword-gated
/// retrieval, strict grounded generation, and turn persistence.
pub struct Brain {
    policy: ModelPolicy,
    knowledge: Arc<dyn KnowledgeService>,
    store: Arc<dyn ConversationStore>,
    media: Arc<dyn MediaService>,
}

impl Brain {
    pub fn new(
        policy: ModelPolicy,
        knowledge: Arc<dyn KnowledgeService>,
        store: Arc<dyn ConversationStore>,
        media: Arc<dyn MediaService>,
    ) -> Self {
        Self {
            policy,
            knowledge,
            store,
            media,
        }
    }

    /// Never fails and never returns an empty response: any error escaping
    /// the assembly steps degrades to a fixed apology with confidence 0.
    pub async fn respond(&self, message: &UnifiedMessage) -> AgentResponse {
        match self.assemble(message).await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "response assembly failed");
                AgentResponse {
                    conversation_id: "0".to_string(),
                    response: CRITICAL_FALLBACK.to_string(),
                    sources: None,
                    confidence: 0.0,
                    used_retrieval: false,
                }
            }
        }
    }

    async fn assemble(&self, message: &UnifiedMessage) -> Result<AgentResponse> {
        let started = Instant::now();
        info!(kind = ?message.message_type, channel = %message.channel.label(),
              "assembling response");

        let mut processed_content = message.content.clone();
        let mut multimodal_context = String::new();

        if message.message_type.is_multimodal() {
            if let Some(file_id) = message.metadata_str("file_id").map(str::to_string) {
                match self.analyze_media(message, &file_id).await {
                    Ok(analysis) => {
                        processed_content = format_multimodal_content(
                            &message.content,
                            &analysis,
                            message.message_type,
                        );
                        multimodal_context = analysis;
                    }
                    Err(err) => {
                        warn!(error = %err, "media analysis failed");
                        multimodal_context = MEDIA_ERROR_MARKER.to_string();
                    }
                }
            }
        }

        let username = message
            .metadata_str("username")
            .or_else(|| message.metadata_str("first_name"))
            .map(str::to_string);
        let conversation_id = self
            .store
            .get_or_create_conversation(message.channel, &message.user_id, username.as_deref())
            .await?;

        let history = self
            .store
            .recent_messages(conversation_id, HISTORY_LIMIT)
            .await?;

        let mut retrieved_context = String::new();
        let mut used_retrieval = false;
        if should_retrieve_context(&processed_content) {
            let docs = self
                .knowledge
                .retrieve(&processed_content, RETRIEVAL_TOP_K)
                .await?;
            if docs.is_empty() {
                info!("no relevant documents, answering ungrounded");
            } else {
                retrieved_context = format_retrieved_context(&docs);
                used_retrieval = true;
                info!(count = docs.len(), "retrieved grounding documents");
            }
        }

        let system_prompt = build_system_prompt(&retrieved_context, &multimodal_context);
        let mut messages = vec![ChatMessage::system(system_prompt)];
        for turn in &history {
            messages.push(ChatMessage {
                role: turn.role.clone(),
                content: turn.content.clone(),
            });
        }
        messages.push(ChatMessage::user(&processed_content));

        let candidates = self.policy.tiers.primary.clone();
        let response = self
            .policy
            .generate_or_apology(&candidates, &messages, GenerateOptions::GROUNDED)
            .await;

        self.store
            .save_message(
                conversation_id,
                "user",
                &message.content,
                json!({
                    "original_type": message.message_type,
                    "processed": processed_content != message.content,
                }),
            )
            .await?;
        self.store
            .save_message(
                conversation_id,
                "assistant",
                &response,
                json!({
                    "used_retrieval": used_retrieval,
                    "used_multimodal": !multimodal_context.is_empty(),
                    "processing_time_ms": started.elapsed().as_millis() as u64,
                    "confidence": if used_retrieval { "high" } else { "medium" },
                }),
            )
            .await?;

        let confidence = if used_retrieval {
            CONFIDENCE_RETRIEVAL
        } else if !multimodal_context.is_empty() {
            CONFIDENCE_MULTIMODAL
        } else {
            CONFIDENCE_BASELINE
        };

        Ok(AgentResponse {
            conversation_id: conversation_id.to_string(),
            response,
            sources: used_retrieval.then(|| vec!["knowledge_base".to_string()]),
            confidence,
            used_retrieval,
        })
    }

    async fn analyze_media(&self, message: &UnifiedMessage, file_id: &str) -> Result<String> {
        let file_url = self.media.resolve_file_url(file_id).await?;
        match message.message_type {
            MessageKind::Image => {
                self.media
                    .describe_image(&file_url, message.metadata_str("caption"))
                    .await
            }
            MessageKind::Audio => self.media.transcribe_audio(&file_url).await,
            other => Err(anyhow::anyhow!("unsupported media type {other:?}")),
        }
    }
}

/// Cheap keyword gate deciding whether a query is worth a retrieval call.
pub fn should_retrieve_context(query: &str) -> bool {
    const KNOWLEDGE_KEYWORDS: &[&str] = &[
        "what",
        "how",
        "when",
        "where",
        "why",
        "who",
        "price",
        "cost",
        "product",
        "service",
        "order",
        "company",
        "business",
        "help",
        "support",
        "faq",
        "policy",
        "refund",
        "shipping",
        "warranty",
        "feature",
        "specification",
        "compare",
        "difference",
    ];

    if query.len() <= 3 {
        return false;
    }
    let lowered = query.to_lowercase();
    KNOWLEDGE_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Grounding rules are strict: with a knowledge-base context the model must
/// answer from it alone; without one it must not invent specifics.
pub fn build_system_prompt(context: &str, multimodal: &str) -> String {
    let mut prompt = String::from(
        "You are a helpful AI assistant for a business. You provide accurate, \
         helpful responses based on available information.",
    );

    if !multimodal.is_empty() {
        prompt.push_str(&format!("\n\n[MEDIA CONTENT]: {multimodal}"));
    }

    if !context.is_empty() {
        prompt.push_str(&format!(
            "\n\n[KNOWLEDGE BASE]:\n{context}\n\n[INSTRUCTIONS]: Use ONLY the \
             information in [KNOWLEDGE BASE] to answer. If the answer is not in the \
             [KNOWLEDGE BASE], you MUST say: \"I don't have specific information \
             about that in my knowledge base. Please upload relevant documents or \
             contact support for assistance.\" Do not make up information."
        ));
    } else {
        prompt.push_str(
            "\n\n[INSTRUCTIONS]: No specific knowledge base documents are available \
             for this query. Answer based on general conversation context only. If \
             the user is asking specific factual questions about products, services, \
             or company details that you don't have context for, suggest they upload \
             documents or contact support.",
        );
    }

    prompt.push_str(
        "\n\n[CRITICAL RULES]:\n\
         1. NEVER make up facts, prices, or specific details not in the knowledge base.\n\
         2. If uncertain, admit uncertainty rather than guessing.\n\
         3. Keep responses concise and professional.\n\
         4. If asked about uploading documents, mention you can process .txt and .md files.",
    );

    prompt
}
