use anyhow::Result;
use clap::Parser;
use serde_json::json;
use tracing::level_filters::LevelFilter;
use uuid::Uuid;

use cortex_agent::cli::{Cli, Commands, ProfileCommands, TelemetryCommands, command_label};
use cortex_agent::config::{
    ProfilesFile, RuntimeConfig, display_server_token, load_profiles, resolve_runtime_config,
};
use cortex_agent::doctor::run_doctor;
use cortex_agent::error::{categorize_error, format_cli_error};
use cortex_agent::events::WorkflowEvent;
use cortex_agent::message::{Channel, UnifiedMessage};
use cortex_agent::server::{build_agent_services, run_server};
use cortex_agent::telemetry::{TelemetrySink, run_telemetry_report, unix_ms_now};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Err(err) = run_cli(cli).await {
        eprintln!("{}", format_cli_error(&err));
        tracing::error!(category = %categorize_error(&err).code(), error = %err, "command failed");
        std::process::exit(1);
    }

    Ok(())
}

async fn run_cli(cli: Cli) -> Result<()> {
    init_tracing(&cli.log_filter)?;
    let profiles = load_profiles(&cli.config_path)?;
    let cfg = resolve_runtime_config(&cli, &profiles)?;

    let Some(command) = cli.command else {
        return Err(anyhow::anyhow!(
            "no command given. Try 'cortex-agent ask \"hello\"' or --help."
        ));
    };
    let telemetry = TelemetrySink::new(&cfg, command_label(&command));

    let result = dispatch(&cfg, &profiles, &telemetry, command).await;
    match &result {
        Ok(()) => telemetry.emit("command.completed", json!({})),
        Err(err) => telemetry.emit("command.failed", json!({ "error": err.to_string() })),
    }
    result
}

async fn dispatch(
    cfg: &RuntimeConfig,
    profiles: &ProfilesFile,
    telemetry: &TelemetrySink,
    command: Commands,
) -> Result<()> {
    match command {
        Commands::Ask {
            prompt,
            channel,
            quiet,
        } => run_ask(cfg, telemetry, prompt.join(" "), channel.to_channel(), quiet).await,
        Commands::Serve { host, port } => run_server(cfg.clone(), host, port, telemetry).await,
        Commands::Doctor => run_doctor(cfg),
        Commands::Profiles { command } => match command {
            ProfileCommands::List => run_profiles_list(profiles, cfg),
            ProfileCommands::Show => run_profiles_show(cfg),
        },
        Commands::Telemetry { command } => match command {
            TelemetryCommands::Report { path, limit } => run_telemetry_report(cfg, path, limit),
        },
    }
}

/// One-shot workflow run: streams progress to stderr, final answer to stdout.
async fn run_ask(
    cfg: &RuntimeConfig,
    telemetry: &TelemetrySink,
    prompt: String,
    channel: Channel,
    quiet: bool,
) -> Result<()> {
    let services = build_agent_services(cfg)?;
    let message = UnifiedMessage {
        channel,
        user_id: cfg.user_id.clone(),
        message_id: Uuid::new_v4().to_string(),
        message_type: cortex_agent::message::MessageKind::Text,
        content: prompt,
        timestamp: unix_ms_now() as i64,
        metadata: Default::default(),
    };

    services.orchestrator.initialize(&message).await?;
    let mut rx = services
        .orchestrator
        .clone()
        .execute(&message.message_id)?;

    while let Some(event) = rx.recv().await {
        match event {
            WorkflowEvent::Status { status, message } => {
                if !quiet {
                    eprintln!("[{status}] {message}");
                }
            }
            WorkflowEvent::Retrieval { sources, count } => {
                if !quiet {
                    eprintln!("[retrieval] {} source(s): {}", count, sources.join(", "));
                }
            }
            WorkflowEvent::Step(step) => {
                if !quiet {
                    eprintln!("  step {}: {}", step.id, step.content);
                }
            }
            WorkflowEvent::Progress {
                step,
                total,
                description,
            } => {
                if !quiet {
                    eprintln!("[{step}/{total}] {description}");
                }
            }
            WorkflowEvent::Complete {
                response,
                confidence,
                tools_used,
                execution_time_ms,
            } => {
                telemetry.emit(
                    "workflow.completed",
                    json!({
                        "workflow_id": &message.message_id,
                        "confidence": confidence,
                        "tools_used": tools_used,
                        "execution_time_ms": execution_time_ms as u64,
                    }),
                );
                if !quiet {
                    eprintln!(
                        "[done] confidence={confidence:.2} tools_used={tools_used} elapsed_ms={execution_time_ms}"
                    );
                }
                println!("{response}");
            }
            WorkflowEvent::Error { message: error } => {
                telemetry.emit(
                    "workflow.failed",
                    json!({ "workflow_id": &message.message_id, "error": error }),
                );
                return Err(anyhow::anyhow!("workflow failed: {error}"));
            }
            WorkflowEvent::Connected { .. } | WorkflowEvent::Done => {}
        }
    }

    Ok(())
}

fn run_profiles_list(profiles: &ProfilesFile, cfg: &RuntimeConfig) -> Result<()> {
    let mut names = profiles.profiles.keys().cloned().collect::<Vec<String>>();
    if !names.iter().any(|name| name == "default") {
        names.push("default".to_string());
    }
    names.sort();

    println!("Configured profiles (active='{}'):", cfg.profile);
    for name in names {
        let marker = if name == cfg.profile { "*" } else { " " };
        let source = if profiles.profiles.contains_key(&name) {
            "configured"
        } else {
            "implicit"
        };
        println!("{marker} {name} ({source})");
    }

    Ok(())
}

fn run_profiles_show(cfg: &RuntimeConfig) -> Result<()> {
    println!("Active profile: {}", cfg.profile);
    println!("Config path: {}", cfg.config_path);
    println!("User: {}", cfg.user_id);
    println!("Primary models: {}", cfg.model_tiers.primary.join(", "));
    println!("Fast models: {}", cfg.model_tiers.fast.join(", "));
    println!(
        "Classification models: {}",
        cfg.model_tiers.classification.join(", ")
    );
    println!("Planning models: {}", cfg.model_tiers.planning.join(", "));
    println!("Generate endpoint: {}", cfg.generate_endpoint);
    println!("Generate timeout secs: {}", cfg.generate_timeout_secs);
    println!("Knowledge backend: {:?}", cfg.knowledge_backend);
    println!(
        "Knowledge doc path: {}",
        cfg.knowledge_doc_path
            .as_deref()
            .unwrap_or("<not configured>")
    );
    println!("Grace period secs: {}", cfg.grace_period_secs);
    println!("Telemetry enabled: {}", cfg.telemetry_enabled);
    println!("Telemetry path: {}", cfg.telemetry_path);
    println!("Server token: {}", display_server_token(cfg));

    Ok(())
}

fn init_tracing(log_filter: &str) -> Result<()> {
    let level = log_filter
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_env_filter(log_filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {e}"))
}
