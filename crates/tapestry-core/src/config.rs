//! Configuration — one serde struct covering every tunable, loaded from
//! an optional JSON file with `TAPESTRY_*` environment overrides.
//!
//! The proactivity preset applies a coherent override set on top of the
//! section defaults, so "conservative" and "proactive" stay internally
//! consistent without hand-tuning a dozen knobs.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::confidence::ConfidenceParams;
use crate::extraction::ExtractionConfig;
use crate::proactive::ProactiveConfig;
use crate::queues::outbound::ProbingLimits;
use crate::workers::WorkerSchedules;

// ============================================================================
// SECTIONS
// ============================================================================

/// Proactivity preset — a coherent override set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProactivityPreset {
    Conservative,
    #[default]
    Balanced,
    Proactive,
}

/// LLM provider settings for both tiers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LlmSettings {
    /// "mock" or "anthropic"
    pub provider: String,
    pub small_model: String,
    pub large_model: String,
    /// Read from TAPESTRY_API_KEY when empty
    #[serde(skip_serializing)]
    pub api_key: String,
    pub small_timeout_secs: u64,
    pub large_timeout_secs: u64,
    pub small_daily_tokens: u64,
    pub large_daily_tokens: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            small_model: "claude-haiku-4-5".to_string(),
            large_model: "claude-sonnet-4-5".to_string(),
            api_key: String::new(),
            small_timeout_secs: 20,
            large_timeout_secs: 45,
            small_daily_tokens: 500_000,
            large_daily_tokens: 200_000,
        }
    }
}

/// Privacy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PrivacySettings {
    pub sharing_enabled: bool,
    /// Minimum level a node must be BELOW to ever be shared
    pub sharing_max_level: u8,
    /// Noise budget applied to any shared aggregate
    pub differential_privacy_epsilon: f64,
    pub auto_pii_detection: bool,
    /// Days archived edges are kept before user-requested purges touch them
    pub archive_retention_days: i64,
}

impl Default for PrivacySettings {
    fn default() -> Self {
        Self {
            sharing_enabled: false,
            sharing_max_level: 1,
            differential_privacy_epsilon: 1.0,
            auto_pii_detection: true,
            archive_retention_days: 365,
        }
    }
}

/// External event monitor flags
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventMonitors {
    pub weather_enabled: bool,
    pub weather_interval_minutes: u64,
    pub calendar_enabled: bool,
    pub calendar_interval_minutes: u64,
    pub news_enabled: bool,
    pub news_interval_minutes: u64,
}

impl Default for EventMonitors {
    fn default() -> Self {
        Self {
            weather_enabled: true,
            weather_interval_minutes: 60,
            calendar_enabled: true,
            calendar_interval_minutes: 15,
            news_enabled: false,
            news_interval_minutes: 120,
        }
    }
}

// ============================================================================
// ROOT CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TapestryConfig {
    pub preset: ProactivityPreset,
    pub confidence: ConfidenceParams,
    pub extraction: ExtractionConfig,
    pub probing: ProbingLimits,
    pub proactive: ProactiveConfig,
    pub workers: WorkerSchedules,
    pub llm: LlmSettings,
    pub privacy: PrivacySettings,
    pub event_monitors: EventMonitors,
    /// Duplicate-suppression window for inbound events
    pub inbound_retention_hours: i64,
    pub data_dir: Option<PathBuf>,
    pub dashboard_port: Option<u16>,
}

impl Default for TapestryConfig {
    fn default() -> Self {
        Self {
            preset: ProactivityPreset::default(),
            confidence: ConfidenceParams::default(),
            extraction: ExtractionConfig::default(),
            probing: ProbingLimits::default(),
            proactive: ProactiveConfig::default(),
            workers: WorkerSchedules::default(),
            llm: LlmSettings::default(),
            privacy: PrivacySettings::default(),
            event_monitors: EventMonitors::default(),
            inbound_retention_hours: 72,
            data_dir: None,
            dashboard_port: None,
        }
    }
}

impl TapestryConfig {
    /// Load from an optional JSON file, apply the preset, then overlay
    /// environment variables (env wins).
    pub fn load(path: Option<&Path>) -> std::io::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                serde_json::from_str(&raw).map_err(|e| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("config parse error: {e}"),
                    )
                })?
            }
            None => Self::default(),
        };
        config.apply_preset();
        config.apply_env();
        Ok(config)
    }

    /// Apply the preset's coherent override set.
    pub fn apply_preset(&mut self) {
        match self.preset {
            ProactivityPreset::Conservative => {
                self.probing.max_per_day = 1;
                self.probing.max_per_week = 3;
                self.probing.min_turn = 5;
                self.probing.min_context_fit = 0.40;
                self.proactive.starter_relevance_threshold = 0.70;
                self.workers.inference_enabled = false;
            }
            ProactivityPreset::Balanced => {}
            ProactivityPreset::Proactive => {
                self.probing.max_per_day = 5;
                self.probing.max_per_week = 20;
                self.probing.min_turn = 2;
                self.probing.min_context_fit = 0.10;
                self.proactive.starter_relevance_threshold = 0.35;
                self.workers.inference_cap = 10;
            }
        }
    }

    fn apply_env(&mut self) {
        if let Ok(provider) = std::env::var("TAPESTRY_LLM_PROVIDER") {
            self.llm.provider = provider;
        }
        if let Ok(key) = std::env::var("TAPESTRY_API_KEY") {
            self.llm.api_key = key;
        }
        if let Ok(dir) = std::env::var("TAPESTRY_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(dir));
        }
        if let Ok(port) = std::env::var("TAPESTRY_DASHBOARD_PORT") {
            self.dashboard_port = port.parse().ok();
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_balanced() {
        let config = TapestryConfig::default();
        assert_eq!(config.preset, ProactivityPreset::Balanced);
        assert_eq!(config.probing.max_per_day, 3);
        assert!((config.confidence.base_explicit - 0.90).abs() < 1e-9);
    }

    #[test]
    fn test_conservative_preset_tightens_gates() {
        let mut config = TapestryConfig { preset: ProactivityPreset::Conservative, ..Default::default() };
        config.apply_preset();
        assert_eq!(config.probing.max_per_day, 1);
        assert_eq!(config.probing.min_turn, 5);
        assert!(!config.workers.inference_enabled);
        assert!(config.proactive.starter_relevance_threshold > 0.5);
    }

    #[test]
    fn test_proactive_preset_loosens_gates() {
        let mut config = TapestryConfig { preset: ProactivityPreset::Proactive, ..Default::default() };
        config.apply_preset();
        assert_eq!(config.probing.max_per_day, 5);
        assert!(config.probing.min_context_fit < 0.15);
        assert_eq!(config.workers.inference_cap, 10);
    }

    #[test]
    fn test_load_from_json_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "preset": "conservative",
                "confidence": {"reinforcementBoost": 0.12},
                "probing": {"maxPerWeek": 4}
            }"#,
        )
        .unwrap();

        let config = TapestryConfig::load(Some(&path)).unwrap();
        assert_eq!(config.preset, ProactivityPreset::Conservative);
        assert!((config.confidence.reinforcement_boost - 0.12).abs() < 1e-9);
        // Preset applied after file load
        assert_eq!(config.probing.max_per_day, 1);
        // Unset fields keep defaults
        assert!((config.confidence.base_explicit - 0.90).abs() < 1e-9);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(TapestryConfig::load(Some(&path)).is_err());
    }
}
