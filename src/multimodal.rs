use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::message::{MessageKind, UnifiedMessage};

/// Media preprocessing consumed during workflow initialization. Failures are
/// always recoverable: the workflow records them and continues with the raw
/// message text.
#[async_trait]
pub trait MediaService: Send + Sync {
    /// Resolves a channel-specific file id to a fetchable URL.
    async fn resolve_file_url(&self, file_id: &str) -> Result<String>;
    async fn describe_image(&self, file_url: &str, caption: Option<&str>) -> Result<String>;
    async fn transcribe_audio(&self, file_url: &str) -> Result<String>;
}

pub struct DisabledMediaService;

#[async_trait]
impl MediaService for DisabledMediaService {
    async fn resolve_file_url(&self, _file_id: &str) -> Result<String> {
        Err(anyhow!("no media backend configured"))
    }

    async fn describe_image(&self, _file_url: &str, _caption: Option<&str>) -> Result<String> {
        Err(anyhow!("no media backend configured"))
    }

    async fn transcribe_audio(&self, _file_url: &str) -> Result<String> {
        Err(anyhow!("no media backend configured"))
    }
}

/// Blends the original message text with the media analysis so downstream
/// generation sees one textual message.
pub fn format_multimodal_content(original: &str, analysis: &str, kind: MessageKind) -> String {
    match kind {
        MessageKind::Image => {
            if original != "[Image]" && !original.trim().is_empty() {
                format!("User sent an image with caption: \"{original}\"\n\nImage description: {analysis}")
            } else {
                format!("User sent an image\n\nImage description: {analysis}")
            }
        }
        MessageKind::Audio => format!("User sent a voice message. {analysis}"),
        MessageKind::Video => format!("User sent a video. {analysis}"),
        MessageKind::Text => analysis.to_string(),
    }
}

/// Runs media preprocessing for a multimodal message. Returns the enriched
/// text on success; the caller degrades to the original content on error.
pub async fn preprocess_media(
    media: &dyn MediaService,
    message: &UnifiedMessage,
    file_id: &str,
) -> Result<String> {
    let file_url = media.resolve_file_url(file_id).await?;
    let analysis = match message.message_type {
        MessageKind::Image => {
            media
                .describe_image(&file_url, message.metadata_str("caption"))
                .await?
        }
        MessageKind::Audio => media.transcribe_audio(&file_url).await?,
        other => return Err(anyhow!("unsupported media type {other:?}")),
    };
    Ok(format_multimodal_content(
        &message.content,
        &analysis,
        message.message_type,
    ))
}
