use super::anthropic::AnthropicProvider;
use super::dify::DifyProvider;
use super::ollama::OllamaProvider;
use super::openai::OpenAiCompatProvider;
use super::{AiProvider, ProviderKind};
use crate::config::EffectiveConfig;
use crate::env::{EnvStack, Session};

/// Builds the adapter for a provider kind. Key and base URL come from the
/// session/process/file environment stack; base URLs fall back to the
/// config globals (ollama, bedrock) and then to each vendor's default.
pub fn build_provider(
    kind: ProviderKind,
    config: &EffectiveConfig,
    session: Option<&Session>,
) -> Box<dyn AiProvider> {
    let stack = config.env_stack(session);
    let api_key = kind.api_key_env().and_then(|var| stack.lookup(var));
    let base_url = resolve_base_url(kind, config, &stack);
    match kind {
        ProviderKind::Anthropic => Box::new(AnthropicProvider::new(base_url, api_key)),
        ProviderKind::Openai
        | ProviderKind::Google
        | ProviderKind::Perplexity
        | ProviderKind::Mistral
        | ProviderKind::Azure
        | ProviderKind::Openrouter
        | ProviderKind::Xai
        | ProviderKind::Bedrock => Box::new(OpenAiCompatProvider::new(kind, base_url, api_key)),
        ProviderKind::Ollama => Box::new(OllamaProvider::new(base_url)),
        ProviderKind::DifyAgent => Box::new(DifyProvider::new(base_url, api_key)),
    }
}

pub fn resolve_base_url(kind: ProviderKind, config: &EffectiveConfig, stack: &EnvStack) -> String {
    if let Some(url) = stack.lookup(kind.base_url_env()) {
        return url;
    }
    match kind {
        ProviderKind::Anthropic => "https://api.anthropic.com".into(),
        ProviderKind::Openai => "https://api.openai.com/v1".into(),
        ProviderKind::Google => "https://generativelanguage.googleapis.com/v1beta/openai".into(),
        ProviderKind::Perplexity => "https://api.perplexity.ai".into(),
        ProviderKind::Mistral => "https://api.mistral.ai/v1".into(),
        ProviderKind::Azure => "https://api.openai.azure.com/openai/v1".into(),
        ProviderKind::Openrouter => "https://openrouter.ai/api/v1".into(),
        ProviderKind::Xai => "https://api.x.ai/v1".into(),
        ProviderKind::Ollama => config.global.ollama_base_url.clone(),
        ProviderKind::Bedrock => config.global.bedrock_base_url.clone(),
        ProviderKind::DifyAgent => "https://api.dify.ai/v1".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ModelCatalog;
    use crate::config::ConfigManager;
    use std::collections::HashMap;

    fn config() -> crate::config::EffectiveConfig {
        let catalog = ModelCatalog::from_json(r#"{"anthropic": [], "perplexity": []}"#).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut manager = ConfigManager::new(catalog);
        (*manager.resolve(Some(dir.path()))).clone()
    }

    #[test]
    fn ollama_base_url_comes_from_config_globals() {
        let cfg = config();
        let url = resolve_base_url(ProviderKind::Ollama, &cfg, &cfg.env_stack(None));
        assert_eq!(url, "http://localhost:11434/api");
    }

    #[test]
    fn session_env_overrides_the_base_url() {
        let cfg = config();
        let mut env = HashMap::new();
        env.insert(
            "OLLAMA_BASE_URL".to_string(),
            "http://gpu-box:11434/api".to_string(),
        );
        let session = Session::with_env(env);
        let url = resolve_base_url(
            ProviderKind::Ollama,
            &cfg,
            &cfg.env_stack(Some(&session)),
        );
        assert_eq!(url, "http://gpu-box:11434/api");
    }

    #[test]
    fn every_kind_builds_an_adapter() {
        let cfg = config();
        for kind in ProviderKind::ALL {
            let provider = build_provider(kind, &cfg, None);
            assert_eq!(provider.name(), kind.as_str());
        }
    }
}
