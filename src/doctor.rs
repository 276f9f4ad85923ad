use anyhow::Result;

use crate::cli::KnowledgeBackend;
use crate::config::{RuntimeConfig, display_server_token};
use crate::knowledge::build_knowledge_service;

pub fn env_present(key: &str) -> bool {
    std::env::var(key)
        .map(|value| !value.trim().is_empty())
        .unwrap_or(false)
}

/// Prints environment and configuration checks for the resolved profile.
/// Always exits successfully; problems surface as findings, not errors.
pub fn run_doctor(cfg: &RuntimeConfig) -> Result<()> {
    println!(
        "Active profile: '{}' (config: {})",
        cfg.profile, cfg.config_path
    );

    println!("Generation environment check:");
    let api_key_set = env_present("GROQ_API_KEY");
    println!(
        "- GROQ_API_KEY: {}",
        if api_key_set { "set" } else { "missing" }
    );
    println!("- endpoint: {}", cfg.generate_endpoint);
    println!("- timeout_secs: {}", cfg.generate_timeout_secs);
    if !api_key_set {
        println!("Tip: export GROQ_API_KEY to enable the generation backend.");
    }

    println!("Model tiers:");
    println!("- primary: {}", cfg.model_tiers.primary.join(", "));
    println!("- fast: {}", cfg.model_tiers.fast.join(", "));
    println!(
        "- classification: {}",
        cfg.model_tiers.classification.join(", ")
    );
    println!("- planning: {}", cfg.model_tiers.planning.join(", "));

    println!(
        "Knowledge: backend={:?}, doc_path={}",
        cfg.knowledge_backend,
        cfg.knowledge_doc_path
            .as_deref()
            .unwrap_or("<not configured>")
    );
    match cfg.knowledge_backend {
        KnowledgeBackend::Disabled => {
            println!("Knowledge check: disabled (retrieval returns empty grounding)");
        }
        KnowledgeBackend::Local => match build_knowledge_service(cfg) {
            Ok(service) => {
                println!("Knowledge check: ok (backend '{}')", service.backend_name());
            }
            Err(err) => println!("Knowledge check: FAILED ({err})"),
        },
    }

    println!(
        "Workflow: grace_period_secs={}, user_id={}",
        cfg.grace_period_secs, cfg.user_id
    );
    println!(
        "Telemetry: enabled={}, path={}",
        cfg.telemetry_enabled, cfg.telemetry_path
    );
    println!("Server auth token: {}", display_server_token(cfg));

    Ok(())
}
