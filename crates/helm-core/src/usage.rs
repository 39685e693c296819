use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Usage reported by the agent for a single turn.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub total_cost_usd: f64,
}

impl TurnUsage {
    /// Extract usage from accumulated message metadata.
    ///
    /// Accepts `{usage: {inputTokens, ...}, totalCostUsd}` and the snake_case
    /// equivalents. Returns `None` when neither usage nor cost is present.
    pub fn from_metadata(metadata: &Value) -> Option<Self> {
        let usage = metadata.get("usage");
        let cost = field(metadata, "totalCostUsd", "total_cost_usd").and_then(Value::as_f64);
        if usage.is_none() && cost.is_none() {
            return None;
        }
        let count = |camel: &str, snake: &str| {
            usage
                .and_then(|u| field(u, camel, snake))
                .and_then(Value::as_u64)
                .unwrap_or(0)
        };
        Some(Self {
            input_tokens: count("inputTokens", "input_tokens"),
            output_tokens: count("outputTokens", "output_tokens"),
            cache_read_tokens: count("cacheReadTokens", "cache_read_tokens"),
            cache_creation_tokens: count("cacheCreationTokens", "cache_creation_tokens"),
            total_cost_usd: cost.unwrap_or(0.0),
        })
    }
}

/// Resume token carried in final metadata, when the agent only reports it at the end.
pub fn resume_token_from_metadata(metadata: &Value) -> Option<String> {
    field(metadata, "resumeToken", "resume_token")
        .and_then(Value::as_str)
        .map(str::to_owned)
}

fn field<'a>(v: &'a Value, camel: &str, snake: &str) -> Option<&'a Value> {
    v.get(camel).or_else(|| v.get(snake))
}

/// Session-level accumulated totals (incremented per completed turn).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub total_cost_usd: f64,
    pub turn_count: u32,
}

impl UsageTotals {
    pub fn accumulate(&mut self, turn: &TurnUsage) {
        self.input_tokens += turn.input_tokens;
        self.output_tokens += turn.output_tokens;
        self.cache_read_tokens += turn.cache_read_tokens;
        self.cache_creation_tokens += turn.cache_creation_tokens;
        self.total_cost_usd += turn.total_cost_usd;
        self.turn_count += 1;
    }
}
