use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;

use crate::message::Channel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KnowledgeBackend {
    Disabled,
    Local,
}

/// Channel selector for one-shot CLI runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ChannelArg {
    Web,
    Whatsapp,
    Telegram,
    Instagram,
    Linkedin,
    Snapchat,
}

impl ChannelArg {
    pub fn to_channel(self) -> Channel {
        match self {
            ChannelArg::Web => Channel::Web,
            ChannelArg::Whatsapp => Channel::Whatsapp,
            ChannelArg::Telegram => Channel::Telegram,
            ChannelArg::Instagram => Channel::Instagram,
            ChannelArg::Linkedin => Channel::Linkedin,
            ChannelArg::Snapchat => Channel::Snapchat,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum ProfileCommands {
    #[command(about = "List configured profiles and highlight the active profile")]
    List,
    #[command(about = "Show the active profile's resolved runtime settings")]
    Show,
}

#[derive(Debug, Subcommand)]
pub enum TelemetryCommands {
    #[command(about = "Summarize telemetry events from a JSONL stream")]
    Report {
        #[arg(long)]
        path: Option<String>,
        #[arg(long, default_value_t = 5000)]
        limit: usize,
    },
}

const CLI_EXAMPLES: &str = "Examples:\n\
  cortex-agent ask \"What is your refund policy?\"\n\
  cortex-agent --knowledge-backend local --knowledge-doc-path docs/kb.md ask \"How do I ship returns?\"\n\
  cortex-agent --model llama-3.3-70b-versatile ask \"hi\"\n\
  cortex-agent serve --host 127.0.0.1 --port 8787\n\
  cortex-agent doctor\n\
  cortex-agent profiles show\n\
  cortex-agent telemetry report --limit 2000\n\
\n\
Switching behavior:\n\
  - Use --profile <name> to load model tiers and backends from .cortex/config.toml.\n\
  - Use --model to pin a single generation model for this invocation.\n\
  - Use --channel on ask to simulate a specific inbound channel.";

#[derive(Debug, Parser)]
#[command(name = "cortex-agent")]
#[command(about = "Omnichannel agent core: workflow orchestration with streaming progress")]
#[command(after_long_help = CLI_EXAMPLES)]
pub struct Cli {
    #[arg(long, env = "CORTEX_PROFILE", default_value = "default")]
    pub profile: String,

    #[arg(long, env = "CORTEX_CONFIG", default_value = ".cortex/config.toml")]
    pub config_path: String,

    #[arg(long, env = "CORTEX_USER_ID")]
    pub user_id: Option<String>,

    /// Pin a single generation model, bypassing the configured primary tier.
    #[arg(long, env = "CORTEX_MODEL")]
    pub model: Option<String>,

    #[arg(long, env = "CORTEX_GENERATE_ENDPOINT")]
    pub generate_endpoint: Option<String>,

    #[arg(long, env = "CORTEX_GENERATE_TIMEOUT_SECS")]
    pub generate_timeout_secs: Option<u64>,

    #[arg(long, env = "CORTEX_KNOWLEDGE_BACKEND", value_enum)]
    pub knowledge_backend: Option<KnowledgeBackend>,

    #[arg(long, env = "CORTEX_KNOWLEDGE_DOC_PATH")]
    pub knowledge_doc_path: Option<String>,

    #[arg(long, env = "CORTEX_GRACE_PERIOD_SECS")]
    pub grace_period_secs: Option<u64>,

    #[arg(long, env = "CORTEX_TELEMETRY_ENABLED", action = clap::ArgAction::Set)]
    pub telemetry_enabled: Option<bool>,

    #[arg(long, env = "CORTEX_TELEMETRY_PATH")]
    pub telemetry_path: Option<String>,

    #[arg(long, env = "CORTEX_SERVER_TOKEN")]
    pub server_token: Option<String>,

    #[arg(long, env = "CORTEX_SHOW_SENSITIVE_CONFIG", default_value_t = false)]
    pub show_sensitive_config: bool,

    #[arg(long, env = "RUST_LOG", default_value = "error")]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Run one message through the workflow pipeline and print progress")]
    Ask {
        #[arg(required = true)]
        prompt: Vec<String>,
        #[arg(long, value_enum, default_value_t = ChannelArg::Web)]
        channel: ChannelArg,
        /// Print only the final response, skipping progress output.
        #[arg(long, default_value_t = false)]
        quiet: bool,
    },
    #[command(about = "Run the HTTP server: SSE workflow stream, ask, and health endpoints")]
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 8787)]
        port: u16,
    },
    #[command(about = "Validate provider environment and knowledge backend configuration")]
    Doctor,
    #[command(about = "Inspect profile configuration and active resolved profile state")]
    Profiles {
        #[command(subcommand)]
        command: ProfileCommands,
    },
    #[command(about = "Telemetry utilities and reporting")]
    Telemetry {
        #[command(subcommand)]
        command: TelemetryCommands,
    },
}

pub fn command_label(command: &Commands) -> String {
    match command {
        Commands::Ask { .. } => "ask".to_string(),
        Commands::Serve { .. } => "serve".to_string(),
        Commands::Doctor => "doctor".to_string(),
        Commands::Profiles { command } => match command {
            ProfileCommands::List => "profiles.list".to_string(),
            ProfileCommands::Show => "profiles.show".to_string(),
        },
        Commands::Telemetry { command } => match command {
            TelemetryCommands::Report { .. } => "telemetry.report".to_string(),
        },
    }
}
