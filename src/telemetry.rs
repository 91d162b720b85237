use crate::catalog::ModelCatalog;
use crate::providers::Usage;
use serde::Serialize;
use std::collections::BTreeMap;
use time::OffsetDateTime;

/// Usage and cost for one AI invocation.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryData {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub user_id: String,
    pub command_name: String,
    pub provider_name: String,
    pub model_used: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub currency: &'static str,
}

impl TelemetryData {
    pub fn from_usage(
        catalog: &ModelCatalog,
        provider_name: &str,
        model_used: &str,
        command_name: &str,
        user_id: &str,
        usage: Usage,
    ) -> Self {
        let input = u64::from(usage.input_tokens);
        let output = u64::from(usage.output_tokens);
        Self {
            timestamp: OffsetDateTime::now_utc(),
            user_id: user_id.to_string(),
            command_name: command_name.to_string(),
            provider_name: provider_name.to_string(),
            model_used: model_used.to_string(),
            input_tokens: input,
            output_tokens: output,
            total_tokens: u64::from(usage.total_tokens),
            total_cost: catalog.cost_for(provider_name, model_used, input, output),
            currency: "USD",
        }
    }
}

/// Running totals the caller owns across a batch of invocations.
/// Counters are additive; two aggregates can be merged.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TelemetryAggregate {
    pub total_cost: f64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_tokens: u64,
    pub provider_counts: BTreeMap<String, u64>,
    pub successful: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl TelemetryAggregate {
    pub fn record(&mut self, data: &TelemetryData) {
        self.total_cost += data.total_cost;
        self.total_input_tokens += data.input_tokens;
        self.total_output_tokens += data.output_tokens;
        self.total_tokens += data.total_tokens;
        if !data.provider_name.is_empty() {
            *self
                .provider_counts
                .entry(data.provider_name.clone())
                .or_insert(0) += 1;
        }
        self.successful += 1;
    }

    pub fn record_failure(&mut self) {
        self.failed += 1;
    }

    pub fn record_skip(&mut self) {
        self.skipped += 1;
    }

    pub fn merge(&mut self, other: &TelemetryAggregate) {
        self.total_cost += other.total_cost;
        self.total_input_tokens += other.total_input_tokens;
        self.total_output_tokens += other.total_output_tokens;
        self.total_tokens += other.total_tokens;
        for (provider, count) in &other.provider_counts {
            *self.provider_counts.entry(provider.clone()).or_insert(0) += count;
        }
        self.successful += other.successful;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }

    pub fn invocations(&self) -> u64 {
        self.successful + self.failed + self.skipped
    }
}
