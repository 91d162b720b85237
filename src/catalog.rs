use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

// Catalog shipped with the binary. Parsed once at startup; a malformed
// catalog is fatal because role defaults depend on its overrides.
pub const EMBEDDED_CATALOG: &str = include_str!("../assets/supported-models.json");

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("reading model catalog at {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("parsing model catalog: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct CostPerMillion {
    pub input: Option<f64>,
    pub output: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogEntry {
    pub id: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub swe_score: Option<f64>,
    pub cost_per_1m_tokens: Option<CostPerMillion>,
    pub allowed_roles: Option<Vec<String>>,
    pub supported: Option<bool>,
}

/// Static list of known (provider, modelId) pairs. Read-only after load.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    providers: BTreeMap<String, Vec<CatalogEntry>>,
}

impl ModelCatalog {
    pub fn load_embedded() -> Result<Self, CatalogError> {
        Self::from_json(EMBEDDED_CATALOG)
    }

    pub fn from_json(text: &str) -> Result<Self, CatalogError> {
        let providers: BTreeMap<String, Vec<CatalogEntry>> = serde_json::from_str(text)?;
        Ok(Self { providers })
    }

    pub fn from_path(path: &Path) -> Result<Self, CatalogError> {
        let text = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn has_provider(&self, provider: &str) -> bool {
        self.providers.contains_key(provider)
    }

    pub fn provider_names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(|k| k.as_str())
    }

    pub fn find(&self, provider: &str, model_id: &str) -> Option<&CatalogEntry> {
        self.providers
            .get(provider)?
            .iter()
            .find(|m| m.id == model_id)
    }

    pub fn models_for(&self, provider: &str) -> &[CatalogEntry] {
        self.providers.get(provider).map(Vec::as_slice).unwrap_or(&[])
    }

    /// USD cost for one invocation, from the catalog's per-1M-token rates.
    /// Unknown models cost zero.
    pub fn cost_for(&self, provider: &str, model_id: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        let Some(cost) = self
            .find(provider, model_id)
            .and_then(|m| m.cost_per_1m_tokens.as_ref())
        else {
            return 0.0;
        };
        let input_rate = cost.input.unwrap_or(0.0);
        let output_rate = cost.output.unwrap_or(0.0);
        (input_tokens as f64 / 1_000_000.0) * input_rate
            + (output_tokens as f64 / 1_000_000.0) * output_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_catalog_parses() {
        let catalog = ModelCatalog::load_embedded().expect("embedded catalog must be valid");
        assert!(catalog.has_provider("anthropic"));
        assert!(catalog.has_provider("perplexity"));
        assert!(catalog.find("perplexity", "sonar-pro").is_some());
    }

    #[test]
    fn malformed_catalog_is_an_error() {
        assert!(ModelCatalog::from_json("{ not json").is_err());
    }

    #[test]
    fn find_is_exact_on_provider_and_id() {
        let catalog = ModelCatalog::from_json(
            r#"{"x": [{"id": "m1", "max_tokens": 500}], "y": [{"id": "m2"}]}"#,
        )
        .unwrap();
        assert_eq!(catalog.find("x", "m1").unwrap().max_tokens, Some(500));
        assert!(catalog.find("x", "m2").is_none());
        assert!(catalog.find("z", "m1").is_none());
    }

    #[test]
    fn cost_uses_per_million_rates() {
        let catalog = ModelCatalog::from_json(
            r#"{"x": [{"id": "m1", "cost_per_1m_tokens": {"input": 2.0, "output": 10.0}}]}"#,
        )
        .unwrap();
        let cost = catalog.cost_for("x", "m1", 1_000_000, 500_000);
        assert!((cost - 7.0).abs() < 1e-9);
        assert_eq!(catalog.cost_for("x", "unknown", 1_000_000, 1_000_000), 0.0);
    }
}
