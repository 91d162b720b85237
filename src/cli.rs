use crate::config::Role;
use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "taskmaster", author, version, about = "Role-based AI provider orchestration", long_about = None)]
pub struct Cli {
    /// Explicit project root (defaults to searching upward for markers)
    #[arg(long)]
    pub project_root: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[allow(clippy::large_enum_variant)]
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate text or a JSON object for one or more prompts
    Generate(GenerateArgs),
    /// List the models known to the catalog
    Models,
    /// Show provider integrations and their API-key status
    Providers,
    /// Print the configuration file path for this project
    ConfigPath,
    /// Write the default configuration template if none exists
    InitConfig,
}

#[derive(Args, Debug)]
pub struct GenerateArgs {
    /// Role whose configured provider/model handles the request
    #[arg(short, long, value_parser = clap::value_parser!(Role), default_value_t = Role::Main)]
    pub role: Role,

    /// Prompt text; repeat to process a batch sequentially
    #[arg(short, long, num_args = 1..)]
    pub prompt: Vec<String>,

    /// Optional system message
    #[arg(long)]
    pub system: Option<String>,

    /// Attach one or more text files as system context
    #[arg(long = "file", num_args = 1..)]
    pub files: Vec<String>,

    /// Stream tokens as they arrive
    #[arg(long)]
    pub stream: bool,

    /// Enable the built-in tool set (file I/O, shell, sequential thinking)
    #[arg(long)]
    pub enable_tools: bool,

    /// Limit allowed tools by name (default: all built-in)
    #[arg(long = "allow-tool", num_args = 1..)]
    pub allow_tools: Vec<String>,

    /// Tool mode: planning (read-only) or building (all tools)
    #[arg(long, value_parser = clap::value_parser!(Mode), default_value_t = Mode::Planning)]
    pub mode: Mode,

    /// Generate a JSON object with this name instead of free text
    #[arg(long)]
    pub object: Option<String>,

    /// Path to a JSON schema file used with --object
    #[arg(long)]
    pub schema: Option<String>,

    /// Temperature override (0.0 - 1.0); defaults to the role's resolved value
    #[arg(long)]
    pub temperature: Option<f32>,

    /// Max output tokens override; defaults to the role's resolved value
    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// Render the prompt from ~/.config/taskmaster/templates/<name>.tmpl
    #[arg(long)]
    pub template: Option<String>,

    /// Key=val variables for template rendering
    #[arg(long = "var", num_args = 1..)]
    pub vars: Vec<String>,

    /// Command label recorded in telemetry
    #[arg(long, default_value = "generate")]
    pub command_name: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    Planning,
    Building,
}

impl std::str::FromStr for Mode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "planning" => Ok(Mode::Planning),
            "building" => Ok(Mode::Building),
            other => Err(format!("invalid mode: {} (use planning|building)", other)),
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Planning => write!(f, "planning"),
            Mode::Building => write!(f, "building"),
        }
    }
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}
