use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

const DEFAULT_AI_ACTIONS: &[&str] = &[
    "ai_prompt",
    "ai_summary",
    "ai_research",
    "web_research",
    "find_email",
    "find_phone",
    "company_enrichment",
    "person_enrichment",
];

/// Tunables for the synchronization engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    /// Lower bound for the overscan margin on each side of the visible range.
    pub overscan_min_rows: usize,
    /// Overscan margin as a multiple of the visible row count.
    pub overscan_factor: usize,
    /// Pending growth at or above this size is flushed without waiting.
    pub growth_flush_threshold: usize,
    #[serde(with = "millis")]
    pub growth_frame_delay: Duration,
    /// Wait before re-checking the visible range after the sequence grew.
    #[serde(with = "millis")]
    pub growth_settle_delay: Duration,
    /// Generator keys whose columns are filled by background jobs.
    pub ai_actions: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            overscan_min_rows: 50,
            overscan_factor: 2,
            growth_flush_threshold: 100,
            growth_frame_delay: Duration::from_millis(16),
            growth_settle_delay: Duration::from_millis(100),
            ai_actions: DEFAULT_AI_ACTIONS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            overscan_min_rows: env_parse("ENRICH_OVERSCAN_MIN_ROWS", defaults.overscan_min_rows),
            overscan_factor: env_parse("ENRICH_OVERSCAN_FACTOR", defaults.overscan_factor),
            growth_flush_threshold: env_parse(
                "ENRICH_GROWTH_FLUSH_THRESHOLD",
                defaults.growth_flush_threshold,
            ),
            growth_frame_delay: Duration::from_millis(env_parse(
                "ENRICH_GROWTH_FRAME_DELAY_MS",
                defaults.growth_frame_delay.as_millis() as u64,
            )),
            growth_settle_delay: Duration::from_millis(env_parse(
                "ENRICH_GROWTH_SETTLE_DELAY_MS",
                defaults.growth_settle_delay.as_millis() as u64,
            )),
            ai_actions: match env::var("ENRICH_AI_ACTIONS") {
                Ok(raw) if !raw.trim().is_empty() => raw
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
                _ => defaults.ai_actions,
            },
        }
    }

    /// Margin added on each side of a visible range of `visible` rows.
    pub fn overscan_for(&self, visible: usize) -> usize {
        self.overscan_min_rows
            .max(visible.saturating_mul(self.overscan_factor))
    }

    /// Coalescing delay for a pending growth batch of the given size.
    pub fn growth_delay_for(&self, pending: usize) -> Duration {
        if pending >= self.growth_flush_threshold {
            Duration::ZERO
        } else {
            self.growth_frame_delay
        }
    }
}

fn env_parse<T>(var: &str, default: T) -> T
where
    T: FromStr + Copy,
{
    match env::var(var) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(target = "enrichment::config", var, value = %raw, "ignoring invalid value");
                default
            }
        },
        Err(_) => default,
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
