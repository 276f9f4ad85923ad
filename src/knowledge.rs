use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::cli::KnowledgeBackend;
use crate::config::RuntimeConfig;

/// One retrieved grounding chunk. `score` is a relevance estimate in [0, 1].
#[derive(Debug, Clone)]
pub struct RetrievedDoc {
    pub text: String,
    pub source: String,
    pub score: f64,
}

#[async_trait]
pub trait KnowledgeService: Send + Sync {
    fn backend_name(&self) -> &'static str;
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedDoc>>;
}

/// No knowledge base configured. Retrieval degrades to empty grounding
/// instead of failing the workflow.
pub struct DisabledKnowledgeService;

#[async_trait]
impl KnowledgeService for DisabledKnowledgeService {
    fn backend_name(&self) -> &'static str {
        "disabled"
    }

    async fn retrieve(&self, _query: &str, _top_k: usize) -> Result<Vec<RetrievedDoc>> {
        Ok(Vec::new())
    }
}

/// Keyword-scored retrieval over paragraph chunks of a local document.
pub struct LocalFileKnowledgeService {
    chunks: Vec<RetrievedDoc>,
}

pub fn load_knowledge_chunks(path: &str) -> Result<Vec<RetrievedDoc>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read knowledge doc at '{}'", path))?;
    let chunks = content
        .split("\n\n")
        .map(str::trim)
        .filter(|chunk| !chunk.is_empty())
        .enumerate()
        .map(|(index, text)| RetrievedDoc {
            source: format!("local:{path}#{}", index + 1),
            text: text.to_string(),
            score: 0.0,
        })
        .collect::<Vec<RetrievedDoc>>();
    Ok(chunks)
}

pub fn query_terms(query: &str) -> Vec<String> {
    query
        .split_whitespace()
        .map(|token| token.trim_matches(|c: char| !c.is_ascii_alphanumeric()))
        .map(str::to_ascii_lowercase)
        .filter(|token| token.len() > 2)
        .collect::<Vec<String>>()
}

impl LocalFileKnowledgeService {
    pub fn load(path: &str) -> Result<Self> {
        Ok(Self {
            chunks: load_knowledge_chunks(path)?,
        })
    }

    pub fn from_chunks(chunks: Vec<RetrievedDoc>) -> Self {
        Self { chunks }
    }
}

#[async_trait]
impl KnowledgeService for LocalFileKnowledgeService {
    fn backend_name(&self) -> &'static str {
        "local"
    }

    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedDoc>> {
        let terms = query_terms(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored = self
            .chunks
            .iter()
            .filter_map(|chunk| {
                let body = chunk.text.to_ascii_lowercase();
                let matched = terms
                    .iter()
                    .filter(|term| body.contains(term.as_str()))
                    .count();
                (matched > 0).then(|| RetrievedDoc {
                    text: chunk.text.clone(),
                    source: chunk.source.clone(),
                    score: matched as f64 / terms.len() as f64,
                })
            })
            .collect::<Vec<RetrievedDoc>>();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k.max(1));
        Ok(scored)
    }
}

/// Formats retrieved chunks the way generation prompts expect them.
pub fn format_retrieved_context(docs: &[RetrievedDoc]) -> String {
    docs.iter()
        .map(|doc| {
            format!(
                "[Source: {} (Score: {:.1}%)]\n{}",
                doc.source,
                doc.score * 100.0,
                doc.text
            )
        })
        .collect::<Vec<String>>()
        .join("\n\n")
}

pub fn build_knowledge_service(cfg: &RuntimeConfig) -> Result<Arc<dyn KnowledgeService>> {
    match cfg.knowledge_backend {
        KnowledgeBackend::Disabled => Ok(Arc::new(DisabledKnowledgeService)),
        KnowledgeBackend::Local => {
            let path = cfg.knowledge_doc_path.as_deref().ok_or_else(|| {
                anyhow::anyhow!(
                    "knowledge backend 'local' requires --knowledge-doc-path or profile.knowledge_doc_path"
                )
            })?;
            let service = LocalFileKnowledgeService::load(path)?;
            Ok(Arc::new(service))
        }
    }
}
