// Adaptive per-tool-category timeouts

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::trace;

use crate::classifier::ToolCategory;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub interaction_ms: u64,
    pub navigation_ms: u64,
    pub extraction_ms: u64,
    pub bulk_ms: u64,
    pub other_ms: u64,
    /// Adapted timeouts never exceed `base * ceiling_multiplier`
    pub ceiling_multiplier: f64,
    /// Weight of each new latency sample in the moving average
    pub latency_weight: f64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            interaction_ms: 10_000,
            navigation_ms: 30_000,
            extraction_ms: 60_000,
            bulk_ms: 180_000,
            other_ms: 30_000,
            ceiling_multiplier: 3.0,
            latency_weight: 0.2,
        }
    }
}

impl TimeoutConfig {
    pub fn base(&self, category: ToolCategory) -> Duration {
        let ms = match category {
            ToolCategory::Interaction => self.interaction_ms,
            ToolCategory::Navigation => self.navigation_ms,
            ToolCategory::Extraction => self.extraction_ms,
            ToolCategory::Bulk => self.bulk_ms,
            ToolCategory::Other => self.other_ms,
        };
        Duration::from_millis(ms)
    }
}

const LATENCY_HEADROOM: f64 = 3.0;

/// Timeout table that widens for categories observed to run slow
#[derive(Debug, Default)]
pub struct ToolTimeouts {
    config: TimeoutConfig,
    // EMA of successful call latency per category, in milliseconds
    latency_ms: DashMap<ToolCategory, f64>,
}

impl ToolTimeouts {
    pub fn new(config: TimeoutConfig) -> Self {
        Self {
            config,
            latency_ms: DashMap::new(),
        }
    }

    pub fn config(&self) -> &TimeoutConfig {
        &self.config
    }

    pub fn timeout_for(&self, tool_name: &str) -> Duration {
        self.timeout_for_category(ToolCategory::of(tool_name))
    }

    pub fn timeout_for_category(&self, category: ToolCategory) -> Duration {
        let base = self.config.base(category);
        let Some(ema) = self.latency_ms.get(&category).map(|v| *v) else {
            return base;
        };
        let base_ms = base.as_millis() as f64;
        let ceiling_ms = base_ms * self.config.ceiling_multiplier.max(1.0);
        let adapted = (ema * LATENCY_HEADROOM).clamp(base_ms, ceiling_ms);
        Duration::from_millis(adapted.round() as u64)
    }

    /// Feed the latency of a successful call
    pub fn observe(&self, tool_name: &str, latency: Duration) {
        let category = ToolCategory::of(tool_name);
        let sample = latency.as_secs_f64() * 1000.0;
        let weight = self.config.latency_weight.clamp(0.0, 1.0);
        let mut entry = self.latency_ms.entry(category).or_insert(sample);
        *entry = (1.0 - weight) * *entry + weight * sample;
        trace!(category = ?category, ema_ms = *entry, "Updated latency average");
    }
}
