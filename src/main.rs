mod catalog;
mod cli;
mod config;
mod env;
mod jsonfix;
mod providers;
mod telemetry;
mod templating;
mod tools;

use anyhow::Result;
use catalog::ModelCatalog;
use cli::{Cli, Commands, GenerateArgs, Mode};
use colored::*;
use config::ConfigManager;
use futures_util::StreamExt;
use providers::{AiProvider, ChatMessage, InvocationParams, ProviderError, ProviderKind, Usage};
use std::io::Write;
use std::path::Path;
use telemetry::{TelemetryAggregate, TelemetryData};
use tools::ToolRegistry;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, reload, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Every role default depends on catalog overrides, so a broken catalog
    // has no degraded mode: abort before doing anything else.
    let loaded = match std::env::var("TASKMASTER_MODELS") {
        Ok(path) => ModelCatalog::from_path(Path::new(&path)),
        Err(_) => ModelCatalog::load_embedded(),
    };
    let catalog = match loaded {
        Ok(catalog) => catalog,
        Err(e) => {
            eprintln!(
                "{}",
                format!("FATAL ERROR: could not load the model catalog: {e}").red()
            );
            std::process::exit(1);
        }
    };

    // Logging comes up at the default level first so that warnings emitted
    // during configuration resolution are not lost; the filter is reloaded
    // once the configured logLevel/debug flags are known.
    let reload_handle = init_tracing();

    let mut manager = ConfigManager::new(catalog);
    let root = cli.project_root.as_deref().map(Path::new);
    let cfg = manager.resolve(root);
    let _ = reload_handle.reload(log_filter(&cfg.global.log_level, cfg.global.debug));

    match cli.command {
        Commands::Generate(cmd) => run_generate(cmd, &mut manager, root).await?,
        Commands::Models => {
            let providers: Vec<String> = manager
                .catalog()
                .provider_names()
                .map(str::to_string)
                .collect();
            for provider in providers {
                println!("{}", provider.bold());
                for entry in manager.catalog().models_for(&provider) {
                    let score = entry
                        .swe_score
                        .map(|s| format!(" swe={s:.3}"))
                        .unwrap_or_default();
                    let roles = entry
                        .allowed_roles
                        .as_ref()
                        .map(|r| format!(" [{}]", r.join(",")))
                        .unwrap_or_default();
                    println!("  {}{score}{roles}", entry.id);
                }
            }
        }
        Commands::Providers => {
            println!("{}", "Provider integrations:".bold());
            for kind in ProviderKind::ALL {
                let key_status = if !kind.requires_api_key() {
                    "no key required".green()
                } else if config::is_api_key_set(&cfg, kind.as_str(), None) {
                    "key set".green()
                } else {
                    "key missing".yellow()
                };
                println!("- {kind} ({key_status})");
            }
        }
        Commands::ConfigPath => {
            println!(
                "{}",
                cfg.project_root
                    .join(config::CONFIG_DIR)
                    .join(config::CONFIG_FILE)
                    .display()
            );
        }
        Commands::InitConfig => {
            let path = config::write_template_if_absent(&cfg.project_root)?;
            println!("Wrote default config to {}", path.display());
        }
    }

    Ok(())
}

fn init_tracing() -> reload::Handle<EnvFilter, tracing_subscriber::Registry> {
    let (filter, handle) = reload::Layer::new(log_filter("info", false));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    handle
}

fn log_filter(level: &str, debug: bool) -> EnvFilter {
    let directive = if debug { "debug" } else { level };
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("taskmaster={directive}")))
}

async fn run_generate(
    cmd: GenerateArgs,
    manager: &mut ConfigManager,
    root: Option<&Path>,
) -> Result<()> {
    let user_id = manager.ensure_user_id(root);
    let cfg = manager.resolve(root);
    let role_cfg = cfg.role(cmd.role).clone();
    let role_params = manager.parameters_for_role(&cfg, cmd.role);
    let Some(kind) = role_cfg.kind() else {
        anyhow::bail!("resolved {} provider '{}' is unknown", cmd.role, role_cfg.provider);
    };

    // Prompts: explicit --prompt values plus an optional rendered template.
    let mut prompts = cmd.prompt.clone();
    if let Some(tpl) = &cmd.template {
        let mut vars = serde_json::Map::new();
        for kv in &cmd.vars {
            if let Some((k, v)) = kv.split_once('=') {
                vars.insert(k.to_string(), serde_json::Value::String(v.to_string()));
            }
        }
        prompts.push(templating::render_template(tpl, &serde_json::Value::Object(vars))?);
    }
    if prompts.iter().all(|p| p.trim().is_empty()) {
        anyhow::bail!("a prompt is required (use --prompt or --template)");
    }

    // Shared system context: explicit message plus attached files.
    // Unreadable attachments become a note in context, not an error.
    let mut context: Vec<ChatMessage> = Vec::new();
    if let Some(sys) = &cmd.system {
        context.push(ChatMessage::system(sys.clone()));
    }
    for file in &cmd.files {
        match std::fs::read_to_string(file) {
            Ok(text) => context.push(ChatMessage::system(format!(
                "Attached file '{}':\n{}",
                file, text
            ))),
            Err(_) => context.push(ChatMessage::system(format!(
                "[Failed to read attachment '{}']",
                file
            ))),
        }
    }

    let tool_registry = if cmd.enable_tools {
        ToolRegistry::with_default()
    } else {
        ToolRegistry::new()
    };
    let read_only_only = matches!(cmd.mode, Mode::Planning);
    let allowed = tool_registry.list_filtered(
        (!cmd.allow_tools.is_empty()).then_some(&cmd.allow_tools[..]),
        read_only_only,
    );
    let tool_specs: Vec<providers::ToolSpec> = allowed
        .iter()
        .map(|t| providers::ToolSpec {
            name: t.name.clone(),
            description: t.description.clone(),
            parameters: t.parameters.clone(),
        })
        .collect();

    let schema: Option<serde_json::Value> = match (&cmd.schema, &cmd.object) {
        (Some(path), _) => Some(serde_json::from_str(&std::fs::read_to_string(path)?)?),
        (None, Some(_)) => Some(serde_json::json!({ "type": "object" })),
        (None, None) => None,
    };

    let provider = providers::dispatch::build_provider(kind, &cfg, None);
    let mut aggregate = TelemetryAggregate::default();

    for prompt in prompts {
        if prompt.trim().is_empty() {
            continue;
        }
        if !config::is_api_key_set(&cfg, &role_cfg.provider, None) {
            tracing::warn!(
                "no usable API key for provider '{}'; skipping prompt",
                role_cfg.provider
            );
            aggregate.record_skip();
            continue;
        }

        let mut messages = context.clone();
        messages.push(ChatMessage::user(prompt.clone()));
        let params = InvocationParams {
            model_id: role_cfg.model_id.clone(),
            messages,
            max_tokens: Some(cmd.max_tokens.unwrap_or(role_params.max_tokens)),
            temperature: Some(cmd.temperature.unwrap_or(role_params.temperature)),
            tools: tool_specs.clone(),
            active_tools: (!cmd.allow_tools.is_empty()).then(|| cmd.allow_tools.clone()),
            schema: schema.clone(),
            object_name: cmd.object.clone(),
            command_name: Some(cmd.command_name.clone()),
        };

        let usage = if cmd.object.is_some() {
            match provider.generate_object(&params).await {
                Ok(res) => {
                    if res.repaired {
                        tracing::warn!("model output needed JSON repair");
                    }
                    println!("{}", serde_json::to_string_pretty(&res.object)?);
                    Some(res.usage)
                }
                Err(e) => {
                    tracing::error!("object generation failed: {e}");
                    aggregate.record_failure();
                    None
                }
            }
        } else if cmd.stream {
            match stream_and_print(provider.as_ref(), &params, &tool_registry).await {
                Ok(usage) => Some(usage),
                Err(e) => {
                    tracing::error!("streaming generation failed: {e}");
                    aggregate.record_failure();
                    None
                }
            }
        } else {
            match provider.generate_text(&params, &tool_registry).await {
                Ok(res) => {
                    if !res.tool_results.is_empty() {
                        let names: Vec<&str> =
                            res.tool_calls.iter().map(|c| c.name.as_str()).collect();
                        tracing::debug!(
                            "finished ({:?}) after {} step(s); tools used: {}",
                            res.finish_reason,
                            res.steps,
                            names.join(", ")
                        );
                    }
                    println!("{}", res.text);
                    Some(res.usage)
                }
                Err(e) => {
                    tracing::error!("text generation failed: {e}");
                    aggregate.record_failure();
                    None
                }
            }
        };

        if let Some(usage) = usage {
            let data = TelemetryData::from_usage(
                manager.catalog(),
                &role_cfg.provider,
                &role_cfg.model_id,
                &cmd.command_name,
                &user_id,
                usage,
            );
            aggregate.record(&data);
        }
    }

    print_summary(&aggregate);
    Ok(())
}

// Stream until completion or a tool trigger; tool use falls back to the
// blocking loop with the same parameters (streams cannot carry tool results
// back mid-flight).
async fn stream_and_print(
    provider: &dyn AiProvider,
    params: &InvocationParams,
    tools: &ToolRegistry,
) -> Result<Usage, ProviderError> {
    let mut stream = provider.stream_text(params).await?;
    let mut usage = Usage::default();
    let mut acc = String::new();
    let mut tool_trigger = false;
    while let Some(chunk) = stream.next().await.transpose()? {
        if let Some(delta) = chunk.delta {
            print!("{delta}");
            std::io::stdout().flush().ok();
            acc.push_str(&delta);
        }
        if let Some(u) = chunk.usage {
            usage = u;
        }
        if chunk.tool_calls.is_some() {
            tool_trigger = true;
            break;
        }
    }
    println!();

    if tool_trigger {
        // carry any partial assistant text into the blocking run
        let mut follow_up = params.clone();
        if !acc.is_empty() {
            follow_up.messages.push(ChatMessage::assistant(acc));
        }
        let res = provider.generate_text(&follow_up, tools).await?;
        println!("{}", res.text);
        usage.add(Some(res.usage));
    }
    Ok(usage)
}

fn print_summary(agg: &TelemetryAggregate) {
    if agg.invocations() == 0 {
        return;
    }
    eprintln!("{}", "AI usage summary".bold());
    eprintln!(
        "  tokens: in={} out={} total={}",
        agg.total_input_tokens, agg.total_output_tokens, agg.total_tokens
    );
    eprintln!("  est. cost: ${:.4}", agg.total_cost);
    for (provider, count) in &agg.provider_counts {
        eprintln!("  {provider}: {count} call(s)");
    }
    if agg.failed > 0 || agg.skipped > 0 {
        eprintln!(
            "  {}",
            format!(
                "ok={} failed={} skipped={}",
                agg.successful, agg.failed, agg.skipped
            )
            .yellow()
        );
    }
}
