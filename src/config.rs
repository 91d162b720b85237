use crate::catalog::ModelCatalog;
use crate::env::{EnvStack, Session, parse_env_file};
use crate::providers::ProviderKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

pub const CONFIG_DIR: &str = ".taskmaster";
pub const CONFIG_FILE: &str = "config.json";
pub const LEGACY_CONFIG_FILE: &str = ".taskmasterconfig";
pub const ENV_FILE: &str = ".env";

// Master templates distributed with the tool.
pub const MASTER_CONFIG_TEMPLATE: &str = include_str!("../assets/config_default.json");
pub const MASTER_ENV_TEMPLATE: &str = include_str!("../assets/env_default");

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("writing configuration to {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
    #[error("serializing configuration: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Main,
    Research,
    Fallback,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Main, Role::Research, Role::Fallback];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Main => "main",
            Role::Research => "research",
            Role::Fallback => "fallback",
        }
    }
}

impl FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "main" => Ok(Role::Main),
            "research" => Ok(Role::Research),
            "fallback" => Ok(Role::Fallback),
            other => Err(format!("invalid role: {other} (use main|research|fallback)")),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleConfig {
    pub provider: String,
    pub model_id: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl RoleConfig {
    pub fn default_for(role: Role) -> Self {
        match role {
            Role::Main => Self {
                provider: "anthropic".into(),
                model_id: "claude-3-7-sonnet-20250219".into(),
                max_tokens: 64_000,
                temperature: 0.2,
            },
            Role::Research => Self {
                provider: "perplexity".into(),
                model_id: "sonar-pro".into(),
                max_tokens: 8_700,
                temperature: 0.1,
            },
            Role::Fallback => Self {
                provider: "anthropic".into(),
                model_id: "claude-3-5-sonnet".into(),
                max_tokens: 64_000,
                temperature: 0.2,
            },
        }
    }

    pub fn kind(&self) -> Option<ProviderKind> {
        ProviderKind::from_str(&self.provider).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleModels {
    pub main: RoleConfig,
    pub research: RoleConfig,
    pub fallback: RoleConfig,
}

impl RoleModels {
    pub fn get(&self, role: Role) -> &RoleConfig {
        match role {
            Role::Main => &self.main,
            Role::Research => &self.research,
            Role::Fallback => &self.fallback,
        }
    }

    fn get_mut(&mut self, role: Role) -> &mut RoleConfig {
        match role {
            Role::Main => &mut self.main,
            Role::Research => &mut self.research,
            Role::Fallback => &mut self.fallback,
        }
    }
}

impl Default for RoleModels {
    fn default() -> Self {
        Self {
            main: RoleConfig::default_for(Role::Main),
            research: RoleConfig::default_for(Role::Research),
            fallback: RoleConfig::default_for(Role::Fallback),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalConfig {
    pub log_level: String,
    pub debug: bool,
    pub default_subtasks: u32,
    pub default_num_tasks: u32,
    pub default_priority: String,
    pub project_name: String,
    #[serde(rename = "ollamaBaseURL")]
    pub ollama_base_url: String,
    #[serde(rename = "bedrockBaseURL")]
    pub bedrock_base_url: String,
    pub response_language: String,
    pub use_default_configuration: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            debug: false,
            default_subtasks: 5,
            default_num_tasks: 10,
            default_priority: "medium".into(),
            project_name: "Task Master".into(),
            ollama_base_url: "http://localhost:11434/api".into(),
            bedrock_base_url: "https://bedrock.us-east-1.amazonaws.com".into(),
            response_language: "English".into(),
            use_default_configuration: true,
            user_id: None,
        }
    }
}

// Partial shapes for deep-merging a config file over the defaults: every
// field is optional, absent fields keep the compiled-in value. The global
// block is therefore always fully populated after a merge.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFilePatch {
    models: ModelsPatch,
    global: GlobalPatch,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ModelsPatch {
    main: Option<RolePatch>,
    research: Option<RolePatch>,
    fallback: Option<RolePatch>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RolePatch {
    provider: Option<String>,
    model_id: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
}

impl RolePatch {
    fn apply(&self, base: &mut RoleConfig) {
        if let Some(v) = &self.provider {
            base.provider = v.clone();
        }
        if let Some(v) = &self.model_id {
            base.model_id = v.clone();
        }
        if let Some(v) = self.max_tokens {
            base.max_tokens = v;
        }
        if let Some(v) = self.temperature {
            base.temperature = v;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct GlobalPatch {
    log_level: Option<String>,
    debug: Option<bool>,
    default_subtasks: Option<u32>,
    default_num_tasks: Option<u32>,
    default_priority: Option<String>,
    project_name: Option<String>,
    #[serde(rename = "ollamaBaseURL")]
    ollama_base_url: Option<String>,
    #[serde(rename = "bedrockBaseURL")]
    bedrock_base_url: Option<String>,
    response_language: Option<String>,
    use_default_configuration: Option<bool>,
    user_id: Option<String>,
}

impl GlobalPatch {
    fn apply(&self, base: &mut GlobalConfig) {
        if let Some(v) = &self.log_level {
            base.log_level = v.clone();
        }
        if let Some(v) = self.debug {
            base.debug = v;
        }
        if let Some(v) = self.default_subtasks {
            base.default_subtasks = v;
        }
        if let Some(v) = self.default_num_tasks {
            base.default_num_tasks = v;
        }
        if let Some(v) = &self.default_priority {
            base.default_priority = v.clone();
        }
        if let Some(v) = &self.project_name {
            base.project_name = v.clone();
        }
        if let Some(v) = &self.ollama_base_url {
            base.ollama_base_url = v.clone();
        }
        if let Some(v) = &self.bedrock_base_url {
            base.bedrock_base_url = v.clone();
        }
        if let Some(v) = &self.response_language {
            base.response_language = v.clone();
        }
        if let Some(v) = self.use_default_configuration {
            base.use_default_configuration = v;
        }
        if let Some(v) = &self.user_id {
            base.user_id = Some(v.clone());
        }
    }
}

/// Fully merged, validated configuration for one project root.
#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    pub models: RoleModels,
    pub global: GlobalConfig,
    pub project_root: PathBuf,
    pub using_default_system: bool,
    pub config_file_loaded: bool,
    file_env: HashMap<String, String>,
    file_env_source: &'static str,
}

impl EffectiveConfig {
    pub fn role(&self, role: Role) -> &RoleConfig {
        self.models.get(role)
    }

    /// Session env wins over process env, which wins over the file layer
    /// (project `.env`, or the master template when the default system is
    /// active).
    pub fn env_stack(&self, session: Option<&Session>) -> EnvStack {
        let mut stack = EnvStack::new();
        if let Some(s) = session {
            stack = stack.push_map("session", s.env.clone());
        }
        stack
            .push_process()
            .push_map(self.file_env_source, self.file_env.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoleParameters {
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Resolves and caches the effective configuration. Constructed once at
/// startup and threaded by the caller; there is no process-wide singleton.
pub struct ConfigManager {
    catalog: ModelCatalog,
    cached: Option<Cached>,
}

struct Cached {
    root_key: PathBuf,
    config: Arc<EffectiveConfig>,
}

impl ConfigManager {
    pub fn new(catalog: ModelCatalog) -> Self {
        Self {
            catalog,
            cached: None,
        }
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    /// Returns the cached configuration unless the resolved root changed.
    pub fn resolve(&mut self, explicit_root: Option<&Path>) -> Arc<EffectiveConfig> {
        if let Some(cached) = &self.cached {
            match explicit_root {
                None => return Arc::clone(&cached.config),
                Some(root) if root == cached.root_key => return Arc::clone(&cached.config),
                _ => {}
            }
        }

        let (root, warn_missing) = match explicit_root {
            Some(root) => (root.to_path_buf(), true),
            None => match find_project_root() {
                Some(root) => (root, false),
                None => {
                    // Fresh-init scenario: fall back to the working directory
                    // and keep quiet about the missing config file.
                    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
                    (cwd, false)
                }
            },
        };

        let config = Arc::new(load_effective(&self.catalog, &root, warn_missing));
        self.cached = Some(Cached {
            root_key: root,
            config: Arc::clone(&config),
        });
        config
    }

    pub fn force_reload(&mut self) {
        self.cached = None;
    }

    /// Effective per-role parameters: the catalog's max_tokens override caps
    /// the role value (never exceed either limit) and a catalog temperature
    /// in [0,1] replaces the role default. Lookup misses keep role defaults.
    pub fn parameters_for_role(&self, config: &EffectiveConfig, role: Role) -> RoleParameters {
        let rc = config.role(role);
        let mut max_tokens = rc.max_tokens;
        let mut temperature = rc.temperature;
        if let Some(entry) = self.catalog.find(&rc.provider, &rc.model_id) {
            if let Some(limit) = entry.max_tokens
                && limit > 0
            {
                max_tokens = max_tokens.min(limit);
                tracing::debug!(
                    "applying model-specific max_tokens ({limit}) for {}; effective limit: {max_tokens}",
                    rc.model_id
                );
            }
            if let Some(t) = entry.temperature
                && (0.0..=1.0).contains(&t)
            {
                temperature = t;
            }
        } else {
            tracing::debug!(
                "no catalog entry for {}/{}; using role defaults",
                rc.provider,
                rc.model_id
            );
        }
        RoleParameters {
            max_tokens,
            temperature,
        }
    }

    pub fn write_config(&self, config: &EffectiveConfig) -> Result<PathBuf, ConfigError> {
        #[derive(Serialize)]
        struct FileOut<'a> {
            models: &'a RoleModels,
            global: &'a GlobalConfig,
        }
        let dir = config.project_root.join(CONFIG_DIR);
        std::fs::create_dir_all(&dir).map_err(|source| ConfigError::Write {
            path: dir.display().to_string(),
            source,
        })?;
        let path = dir.join(CONFIG_FILE);
        let text = serde_json::to_string_pretty(&FileOut {
            models: &config.models,
            global: &config.global,
        })?;
        std::fs::write(&path, text).map_err(|source| ConfigError::Write {
            path: path.display().to_string(),
            source,
        })?;
        Ok(path)
    }

    /// Returns the configured user id, generating and persisting one on
    /// first use. A failed write degrades to a warning.
    pub fn ensure_user_id(&mut self, explicit_root: Option<&Path>) -> String {
        let config = self.resolve(explicit_root);
        if let Some(id) = &config.global.user_id {
            return id.clone();
        }
        let id = ulid::Ulid::new().to_string().to_lowercase();
        tracing::info!("generated new user ID: {id}");
        let mut updated = (*config).clone();
        updated.global.user_id = Some(id.clone());
        if let Err(e) = self.write_config(&updated) {
            tracing::warn!("failed to write updated configuration with new userId: {e}");
        }
        self.cached = Some(Cached {
            root_key: updated.project_root.clone(),
            config: Arc::new(updated),
        });
        id
    }
}

/// True when the key for `provider` resolves to a usable value. Providers in
/// the credential-less set always pass; placeholder values never do.
pub fn is_api_key_set(config: &EffectiveConfig, provider: &str, session: Option<&Session>) -> bool {
    let Ok(kind) = ProviderKind::from_str(provider) else {
        tracing::warn!("unknown provider name: {provider} in API key check");
        return false;
    };
    let Some(var) = kind.api_key_env() else {
        return true;
    };
    match config.env_stack(session).lookup(var) {
        Some(value) => !value.trim().is_empty() && !is_placeholder(&value),
        None => false,
    }
}

pub fn is_placeholder(value: &str) -> bool {
    value.contains("KEY_HERE")
        || (value.starts_with("YOUR_") && value.ends_with("_API_KEY_HERE"))
}

/// A provider is known when it parses to a `ProviderKind` and, for
/// catalog-validated kinds, also appears in the model catalog.
pub fn is_known_provider(catalog: &ModelCatalog, provider: &str) -> bool {
    match ProviderKind::from_str(provider) {
        Ok(kind) => !kind.is_catalog_validated() || catalog.has_provider(kind.as_str()),
        Err(_) => false,
    }
}

pub fn find_project_root() -> Option<PathBuf> {
    let mut dir = std::env::current_dir().ok()?;
    loop {
        if dir.join(CONFIG_DIR).is_dir()
            || dir.join(LEGACY_CONFIG_FILE).is_file()
            || dir.join(".git").exists()
        {
            return Some(dir);
        }
        if !dir.pop() {
            return None;
        }
    }
}

/// New-style path first, then the legacy file. The bool is true for legacy.
pub fn find_config_path(root: &Path) -> Option<(PathBuf, bool)> {
    let new_style = root.join(CONFIG_DIR).join(CONFIG_FILE);
    if new_style.is_file() {
        return Some((new_style, false));
    }
    let legacy = root.join(LEGACY_CONFIG_FILE);
    if legacy.is_file() {
        return Some((legacy, true));
    }
    None
}

/// Writes the master default template to `.taskmaster/config.json` when no
/// config file exists yet.
pub fn write_template_if_absent(root: &Path) -> Result<PathBuf, ConfigError> {
    if let Some((path, _)) = find_config_path(root) {
        return Ok(path);
    }
    let dir = root.join(CONFIG_DIR);
    std::fs::create_dir_all(&dir).map_err(|source| ConfigError::Write {
        path: dir.display().to_string(),
        source,
    })?;
    let path = dir.join(CONFIG_FILE);
    std::fs::write(&path, MASTER_CONFIG_TEMPLATE).map_err(|source| ConfigError::Write {
        path: path.display().to_string(),
        source,
    })?;
    Ok(path)
}

fn load_effective(catalog: &ModelCatalog, root: &Path, warn_missing: bool) -> EffectiveConfig {
    let file_patch = match find_config_path(root) {
        Some((path, legacy)) => {
            if legacy {
                tracing::warn!(
                    "configuration found at deprecated location {}; move it to {CONFIG_DIR}/{CONFIG_FILE}",
                    path.display()
                );
            }
            read_patch(&path)
        }
        None => {
            if warn_missing {
                tracing::warn!("no configuration file found at {}", root.display());
            }
            None
        }
    };

    // The file's explicit flag wins; otherwise the compiled default decides.
    // A missing or unparseable file always falls back to the default system.
    let flag = file_patch
        .as_ref()
        .and_then(|p| p.global.use_default_configuration)
        .unwrap_or(GlobalConfig::default().use_default_configuration);
    let use_default_system = flag || file_patch.is_none();

    let mut models = RoleModels::default();
    let mut global = GlobalConfig::default();
    let config_file_loaded;

    if use_default_system {
        match serde_json::from_str::<ConfigFilePatch>(MASTER_CONFIG_TEMPLATE) {
            Ok(master) => {
                apply_patch(&master, &mut models, &mut global);
                config_file_loaded = true;
            }
            Err(e) => {
                tracing::warn!(
                    "failed to parse master default config template: {e}; using compiled-in defaults"
                );
                config_file_loaded = false;
            }
        }
    } else {
        // use_default_system false implies the file parsed.
        let patch = file_patch.as_ref().expect("config file patch present");
        apply_patch(patch, &mut models, &mut global);
        config_file_loaded = true;
    }

    // Invalid providers degrade that role to its compiled-in default.
    for role in Role::ALL {
        let rc = models.get_mut(role);
        if !is_known_provider(catalog, &rc.provider) {
            tracing::warn!(
                "invalid {role} provider \"{}\"; falling back to the default {role} model",
                rc.provider
            );
            *rc = RoleConfig::default_for(role);
        } else if let Some(kind) = rc.kind()
            && kind.is_catalog_validated()
            && catalog.find(&rc.provider, &rc.model_id).is_none()
        {
            // Non-strict: an unlisted model may still be valid.
            tracing::debug!(
                "model {} is not listed in the catalog for provider {}",
                rc.model_id,
                rc.provider
            );
        }
    }

    let (file_env, file_env_source) = if use_default_system {
        (parse_env_file(MASTER_ENV_TEMPLATE), "master .env template")
    } else {
        match std::fs::read_to_string(root.join(ENV_FILE)) {
            Ok(text) => (parse_env_file(&text), "project .env"),
            Err(_) => {
                tracing::debug!("no project .env file at {}", root.display());
                (HashMap::new(), "project .env")
            }
        }
    };

    EffectiveConfig {
        models,
        global,
        project_root: root.to_path_buf(),
        using_default_system: use_default_system,
        config_file_loaded,
        file_env,
        file_env_source,
    }
}

fn read_patch(path: &Path) -> Option<ConfigFilePatch> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!("error reading config file at {}: {e}", path.display());
            return None;
        }
    };
    if text.trim().is_empty() {
        tracing::warn!("config file at {} is empty", path.display());
        return None;
    }
    match serde_json::from_str(&text) {
        Ok(patch) => Some(patch),
        Err(e) => {
            tracing::warn!(
                "error parsing config file at {}: {e}; degrading to defaults",
                path.display()
            );
            None
        }
    }
}

fn apply_patch(patch: &ConfigFilePatch, models: &mut RoleModels, global: &mut GlobalConfig) {
    if let Some(p) = &patch.models.main {
        p.apply(&mut models.main);
    }
    if let Some(p) = &patch.models.research {
        p.apply(&mut models.research);
    }
    if let Some(p) = &patch.models.fallback {
        p.apply(&mut models.fallback);
    }
    patch.global.apply(global);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn test_catalog() -> ModelCatalog {
        ModelCatalog::from_json(
            r#"{
                "anthropic": [{"id": "claude-3-7-sonnet-20250219", "max_tokens": 64000}],
                "perplexity": [{"id": "sonar-pro", "max_tokens": 8700}],
                "openai": [
                    {"id": "m1", "max_tokens": 500},
                    {"id": "m2", "temperature": 0.7},
                    {"id": "m3"}
                ]
            }"#,
        )
        .unwrap()
    }

    fn write_project_config(root: &Path, body: &str) {
        let dir = root.join(CONFIG_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(CONFIG_FILE), body).unwrap();
    }

    #[test]
    fn missing_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = ConfigManager::new(test_catalog());
        let cfg = manager.resolve(Some(dir.path()));
        assert_eq!(cfg.models.main, RoleConfig::default_for(Role::Main));
        assert_eq!(cfg.global.log_level, "info");
        assert!(cfg.using_default_system);
    }

    #[test]
    fn project_config_overrides_defaults_when_opted_out_of_default_system() {
        let dir = tempfile::tempdir().unwrap();
        write_project_config(
            dir.path(),
            r#"{
                "models": {
                    "main": {"provider": "openai", "modelId": "m3", "maxTokens": 1200}
                },
                "global": {"useDefaultConfiguration": false, "logLevel": "debug"}
            }"#,
        );
        let mut manager = ConfigManager::new(test_catalog());
        let cfg = manager.resolve(Some(dir.path()));
        assert_eq!(cfg.models.main.provider, "openai");
        assert_eq!(cfg.models.main.model_id, "m3");
        assert_eq!(cfg.models.main.max_tokens, 1200);
        // unset role fields keep their defaults
        assert!((cfg.models.main.temperature - 0.2).abs() < 1e-6);
        assert_eq!(cfg.global.log_level, "debug");
        // backfilled global keys are never left out
        assert_eq!(cfg.global.default_priority, "medium");
        assert_eq!(cfg.global.default_subtasks, 5);
        assert!(!cfg.using_default_system);
    }

    #[test]
    fn file_without_opt_out_flag_stays_on_the_default_system() {
        let dir = tempfile::tempdir().unwrap();
        write_project_config(
            dir.path(),
            r#"{"models": {"main": {"provider": "openai", "modelId": "m3"}}}"#,
        );
        let mut manager = ConfigManager::new(test_catalog());
        let cfg = manager.resolve(Some(dir.path()));
        // compiled default for useDefaultConfiguration is true
        assert!(cfg.using_default_system);
        assert_eq!(cfg.models.main.provider, "anthropic");
    }

    #[test]
    fn invalid_research_provider_reverts_to_the_compiled_default() {
        let dir = tempfile::tempdir().unwrap();
        write_project_config(
            dir.path(),
            r#"{
                "models": {"research": {"provider": "not-a-real-provider"}},
                "global": {"useDefaultConfiguration": false}
            }"#,
        );
        let mut manager = ConfigManager::new(test_catalog());
        let cfg = manager.resolve(Some(dir.path()));
        assert_eq!(
            *cfg.role(Role::Research),
            RoleConfig {
                provider: "perplexity".into(),
                model_id: "sonar-pro".into(),
                max_tokens: 8700,
                temperature: 0.1,
            }
        );
    }

    #[test]
    fn every_resolved_provider_is_in_the_known_set() {
        let dir = tempfile::tempdir().unwrap();
        write_project_config(
            dir.path(),
            r#"{
                "models": {
                    "main": {"provider": "bogus"},
                    "research": {"provider": "alsobogus"},
                    "fallback": {"provider": "ollama"}
                },
                "global": {"useDefaultConfiguration": false}
            }"#,
        );
        let catalog = test_catalog();
        let mut manager = ConfigManager::new(catalog);
        let cfg = manager.resolve(Some(dir.path()));
        for role in Role::ALL {
            assert!(is_known_provider(manager.catalog(), &cfg.role(role).provider));
        }
        // custom providers bypass catalog validation
        assert_eq!(cfg.models.fallback.provider, "ollama");
    }

    #[test]
    fn malformed_config_file_degrades_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        write_project_config(dir.path(), "{ this is not json");
        let mut manager = ConfigManager::new(test_catalog());
        let cfg = manager.resolve(Some(dir.path()));
        assert_eq!(cfg.models.main, RoleConfig::default_for(Role::Main));
    }

    #[test]
    fn legacy_config_location_is_honored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(LEGACY_CONFIG_FILE),
            r#"{
                "models": {"main": {"provider": "openai", "modelId": "m3"}},
                "global": {"useDefaultConfiguration": false}
            }"#,
        )
        .unwrap();
        let mut manager = ConfigManager::new(test_catalog());
        let cfg = manager.resolve(Some(dir.path()));
        assert_eq!(cfg.models.main.provider, "openai");
    }

    #[test]
    fn resolve_is_idempotent_until_forced() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = ConfigManager::new(test_catalog());
        let first = manager.resolve(Some(dir.path()));
        let second = manager.resolve(Some(dir.path()));
        assert!(Arc::ptr_eq(&first, &second));
        manager.force_reload();
        let third = manager.resolve(Some(dir.path()));
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[test]
    fn root_change_invalidates_the_cache() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let mut manager = ConfigManager::new(test_catalog());
        let first = manager.resolve(Some(a.path()));
        let second = manager.resolve(Some(b.path()));
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.project_root, b.path());
    }

    fn config_with_main(manager: &mut ConfigManager, root: &Path, body: &str) -> Arc<EffectiveConfig> {
        write_project_config(root, body);
        manager.force_reload();
        manager.resolve(Some(root))
    }

    #[test]
    fn catalog_max_tokens_caps_the_role_value() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = ConfigManager::new(test_catalog());
        // catalog says m1 allows 500; role asks for 1000
        let cfg = config_with_main(
            &mut manager,
            dir.path(),
            r#"{
                "models": {"main": {"provider": "openai", "modelId": "m1", "maxTokens": 1000}},
                "global": {"useDefaultConfiguration": false}
            }"#,
        );
        let params = manager.parameters_for_role(&cfg, Role::Main);
        assert_eq!(params.max_tokens, 500);

        // the cap never raises a smaller role value
        let cfg = config_with_main(
            &mut manager,
            dir.path(),
            r#"{
                "models": {"main": {"provider": "openai", "modelId": "m1", "maxTokens": 200}},
                "global": {"useDefaultConfiguration": false}
            }"#,
        );
        let params = manager.parameters_for_role(&cfg, Role::Main);
        assert_eq!(params.max_tokens, 200);
    }

    #[test]
    fn role_values_hold_without_a_catalog_override() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = ConfigManager::new(test_catalog());
        let cfg = config_with_main(
            &mut manager,
            dir.path(),
            r#"{
                "models": {"main": {"provider": "openai", "modelId": "m3", "maxTokens": 1000, "temperature": 0.3}},
                "global": {"useDefaultConfiguration": false}
            }"#,
        );
        let params = manager.parameters_for_role(&cfg, Role::Main);
        assert_eq!(params.max_tokens, 1000);
        assert!((params.temperature - 0.3).abs() < 1e-6);
    }

    #[test]
    fn catalog_temperature_overrides_the_role_default() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = ConfigManager::new(test_catalog());
        let cfg = config_with_main(
            &mut manager,
            dir.path(),
            r#"{
                "models": {"main": {"provider": "openai", "modelId": "m2", "temperature": 0.3}},
                "global": {"useDefaultConfiguration": false}
            }"#,
        );
        let params = manager.parameters_for_role(&cfg, Role::Main);
        assert!((params.temperature - 0.7).abs() < 1e-6);
    }

    #[test]
    fn credential_less_providers_always_pass_the_key_check() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = ConfigManager::new(test_catalog());
        let cfg = manager.resolve(Some(dir.path()));
        assert!(is_api_key_set(&cfg, "ollama", None));
        assert!(is_api_key_set(&cfg, "bedrock", None));
    }

    #[test]
    fn placeholder_keys_fail_the_check() {
        assert!(is_placeholder("YOUR_OPENAI_API_KEY_HERE"));
        assert!(is_placeholder("sk-KEY_HERE"));
        assert!(!is_placeholder("sk-real-key"));

        // the master env template ships placeholders only
        let dir = tempfile::tempdir().unwrap();
        let mut manager = ConfigManager::new(test_catalog());
        let cfg = manager.resolve(Some(dir.path()));
        if std::env::var("ANTHROPIC_API_KEY").is_err() {
            assert!(!is_api_key_set(&cfg, "anthropic", None));
        }
    }

    #[test]
    fn session_env_outranks_everything_for_key_checks() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = ConfigManager::new(test_catalog());
        let cfg = manager.resolve(Some(dir.path()));
        let mut env = HashMap::new();
        env.insert("PERPLEXITY_API_KEY".to_string(), "pplx-real".to_string());
        let session = Session::with_env(env);
        assert!(is_api_key_set(&cfg, "perplexity", Some(&session)));
    }

    #[test]
    fn project_env_file_feeds_the_stack_when_not_on_default_system() {
        let dir = tempfile::tempdir().unwrap();
        write_project_config(
            dir.path(),
            r#"{"global": {"useDefaultConfiguration": false}}"#,
        );
        std::fs::write(dir.path().join(ENV_FILE), "XAI_API_KEY=xai-real\n").unwrap();
        let mut manager = ConfigManager::new(test_catalog());
        let cfg = manager.resolve(Some(dir.path()));
        assert!(is_api_key_set(&cfg, "xai", None));
    }

    #[test]
    fn ensure_user_id_generates_once_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = ConfigManager::new(test_catalog());
        let id = manager.ensure_user_id(Some(dir.path()));
        assert!(!id.is_empty());
        let again = manager.ensure_user_id(Some(dir.path()));
        assert_eq!(id, again);
        // persisted to the new-style config path
        let written = dir.path().join(CONFIG_DIR).join(CONFIG_FILE);
        assert!(written.is_file());
        let text = std::fs::read_to_string(written).unwrap();
        assert!(text.contains(&id));
    }

    #[test]
    fn write_template_if_absent_is_a_noop_when_config_exists() {
        let dir = tempfile::tempdir().unwrap();
        write_project_config(dir.path(), r#"{"global": {"logLevel": "warn"}}"#);
        let path = write_template_if_absent(dir.path()).unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("warn"));
    }
}
