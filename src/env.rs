use std::collections::HashMap;

/// Opaque per-session handle. Carries environment overrides (API keys and
/// base URLs) that take precedence over every other source for that session.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub env: HashMap<String, String>,
}

impl Session {
    pub fn with_env(env: HashMap<String, String>) -> Self {
        Self { env }
    }
}

#[derive(Debug, Clone)]
enum EnvSource {
    Map {
        name: &'static str,
        vars: HashMap<String, String>,
    },
    Process,
}

impl EnvSource {
    fn name(&self) -> &'static str {
        match self {
            EnvSource::Map { name, .. } => name,
            EnvSource::Process => "process",
        }
    }

    fn get(&self, key: &str) -> Option<String> {
        match self {
            EnvSource::Map { vars, .. } => vars.get(key).cloned(),
            EnvSource::Process => std::env::var(key).ok(),
        }
    }
}

/// Ordered list of environment sources; the first source that defines a
/// variable wins. Precedence is session > process > file/template.
#[derive(Debug, Clone, Default)]
pub struct EnvStack {
    sources: Vec<EnvSource>,
}

impl EnvStack {
    pub fn new() -> Self {
        Self { sources: Vec::new() }
    }

    pub fn push_map(mut self, name: &'static str, vars: HashMap<String, String>) -> Self {
        self.sources.push(EnvSource::Map { name, vars });
        self
    }

    pub fn push_process(mut self) -> Self {
        self.sources.push(EnvSource::Process);
        self
    }

    pub fn lookup(&self, key: &str) -> Option<String> {
        self.sources.iter().find_map(|s| s.get(key))
    }

    /// Which source would answer for `key`. Keeps precedence auditable.
    pub fn source_of(&self, key: &str) -> Option<&'static str> {
        self.sources
            .iter()
            .find(|s| s.get(key).is_some())
            .map(|s| s.name())
    }
}

/// Parses dotenv-format text into a map. Unparseable lines are skipped.
pub fn parse_env_file(text: &str) -> HashMap<String, String> {
    dotenvy::from_read_iter(text.as_bytes())
        .filter_map(|item| item.ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn first_source_wins() {
        let stack = EnvStack::new()
            .push_map("session", map(&[("A", "from-session")]))
            .push_map("file", map(&[("A", "from-file"), ("B", "from-file")]));
        assert_eq!(stack.lookup("A").as_deref(), Some("from-session"));
        assert_eq!(stack.lookup("B").as_deref(), Some("from-file"));
        assert_eq!(stack.lookup("C"), None);
    }

    #[test]
    fn source_of_reports_the_winning_layer() {
        let stack = EnvStack::new()
            .push_map("session", map(&[("A", "1")]))
            .push_map("file", map(&[("A", "2"), ("B", "3")]));
        assert_eq!(stack.source_of("A"), Some("session"));
        assert_eq!(stack.source_of("B"), Some("file"));
        assert_eq!(stack.source_of("C"), None);
    }

    #[test]
    fn process_env_sits_between_session_and_file() {
        // SAFETY: test-local variable name, no concurrent reader cares.
        unsafe { std::env::set_var("TASKMASTER_TEST_PRECEDENCE", "from-process") };
        let stack = EnvStack::new()
            .push_map("session", map(&[]))
            .push_process()
            .push_map("file", map(&[("TASKMASTER_TEST_PRECEDENCE", "from-file")]));
        assert_eq!(
            stack.lookup("TASKMASTER_TEST_PRECEDENCE").as_deref(),
            Some("from-process")
        );
        unsafe { std::env::remove_var("TASKMASTER_TEST_PRECEDENCE") };
    }

    #[test]
    fn parses_dotenv_lines_and_skips_garbage() {
        let parsed = parse_env_file("FOO=bar\n# comment\nBAZ=\"quoted\"\n");
        assert_eq!(parsed.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!(parsed.get("BAZ").map(String::as_str), Some("quoted"));
    }
}
