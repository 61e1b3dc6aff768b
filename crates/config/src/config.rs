//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// External tool locations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolsConfig {
    /// Directory containing ffmpeg/ffprobe (empty = resolve from PATH)
    #[serde(default)]
    pub ffmpeg_dir: String,
    /// Full path to the standalone x265 binary (dual-layer video stage)
    #[serde(default)]
    pub x265_path: String,
    /// Full path to mkvmerge (dual-layer merge stage)
    #[serde(default = "default_mkvmerge_path")]
    pub mkvmerge_path: String,
    /// Full path to the HDR10+ metadata extraction tool (empty = unset)
    #[serde(default)]
    pub hdr10plus_extractor_path: String,
    /// Full path to the Dolby Vision RPU extraction tool (empty = unset)
    #[serde(default)]
    pub dolby_vision_extractor_path: String,
}

fn default_mkvmerge_path() -> String {
    "mkvmerge".to_string()
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg_dir: String::new(),
            x265_path: String::new(),
            mkvmerge_path: default_mkvmerge_path(),
            hdr10plus_extractor_path: String::new(),
            dolby_vision_extractor_path: String::new(),
        }
    }
}

/// Job queue and retention configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobsConfig {
    /// Maximum number of jobs held in the queue (default 20)
    #[serde(default = "default_max_jobs_in_queue")]
    pub max_jobs_in_queue: usize,
    /// Hours a completed job is retained before eviction (default 1)
    #[serde(default = "default_hours_completed_until_removal")]
    pub hours_completed_until_removal: u64,
    /// Hours an errored job is retained before eviction (default 2)
    #[serde(default = "default_hours_errored_until_removal")]
    pub hours_errored_until_removal: u64,
    /// Whether Dolby Vision dual-layer encoding is enabled (default true)
    #[serde(default = "default_dolby_vision_enabled")]
    pub dolby_vision_enabled: bool,
}

fn default_max_jobs_in_queue() -> usize {
    20
}

fn default_hours_completed_until_removal() -> u64 {
    1
}

fn default_hours_errored_until_removal() -> u64 {
    2
}

fn default_dolby_vision_enabled() -> bool {
    true
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_jobs_in_queue: default_max_jobs_in_queue(),
            hours_completed_until_removal: default_hours_completed_until_removal(),
            hours_errored_until_removal: default_hours_errored_until_removal(),
            dolby_vision_enabled: default_dolby_vision_enabled(),
        }
    }
}

/// Scheduler tick timing configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Seconds to wait before the first tick (default 20)
    #[serde(default = "default_startup_delay_secs")]
    pub startup_delay_secs: u64,
    /// Seconds between ticks (default 5)
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
}

fn default_startup_delay_secs() -> u64 {
    20
}

fn default_tick_secs() -> u64 {
    5
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            startup_delay_secs: default_startup_delay_secs(),
            tick_secs: default_tick_secs(),
        }
    }
}

/// Minimum progress percentages below which a finished encode is treated
/// as having ended prematurely
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThresholdsConfig {
    /// Standard single-pass encode (default 90)
    #[serde(default = "default_standard_min_percent")]
    pub standard_min_percent: u8,
    /// Dual-layer video/audio stage (default 85)
    #[serde(default = "default_dual_layer_stage_min_percent")]
    pub dual_layer_stage_min_percent: u8,
    /// Dual-layer final merge (default 90)
    #[serde(default = "default_dual_layer_final_min_percent")]
    pub dual_layer_final_min_percent: u8,
}

fn default_standard_min_percent() -> u8 {
    90
}

fn default_dual_layer_stage_min_percent() -> u8 {
    85
}

fn default_dual_layer_final_min_percent() -> u8 {
    90
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            standard_min_percent: default_standard_min_percent(),
            dual_layer_stage_min_percent: default_dual_layer_stage_min_percent(),
            dual_layer_final_min_percent: default_dual_layer_final_min_percent(),
        }
    }
}

/// Status HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusServerConfig {
    /// Bind address for the status endpoint (default "127.0.0.1:7979")
    #[serde(default = "default_status_bind_addr")]
    pub bind_addr: String,
}

fn default_status_bind_addr() -> String {
    "127.0.0.1:7979".to_string()
}

impl Default for StatusServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_status_bind_addr(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub thresholds: ThresholdsConfig,
    #[serde(default)]
    pub status_server: StatusServerConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - AED_FFMPEG_DIR -> tools.ffmpeg_dir
    /// - AED_DOLBY_VISION_ENABLED -> jobs.dolby_vision_enabled
    /// - AED_MAX_JOBS_IN_QUEUE -> jobs.max_jobs_in_queue
    /// - AED_STATUS_BIND_ADDR -> status_server.bind_addr
    pub fn apply_env_overrides(&mut self) {
        // AED_FFMPEG_DIR
        if let Ok(val) = env::var("AED_FFMPEG_DIR") {
            self.tools.ffmpeg_dir = val;
        }

        // AED_DOLBY_VISION_ENABLED
        if let Ok(val) = env::var("AED_DOLBY_VISION_ENABLED") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.jobs.dolby_vision_enabled = true,
                "false" | "0" | "no" => self.jobs.dolby_vision_enabled = false,
                _ => {} // Invalid value, keep existing
            }
        }

        // AED_MAX_JOBS_IN_QUEUE
        if let Ok(val) = env::var("AED_MAX_JOBS_IN_QUEUE") {
            if let Ok(max) = val.parse::<usize>() {
                self.jobs.max_jobs_in_queue = max;
            }
        }

        // AED_STATUS_BIND_ADDR
        if let Ok(val) = env::var("AED_STATUS_BIND_ADDR") {
            self.status_server.bind_addr = val;
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to clear all config-related env vars
    fn clear_env_vars() {
        env::remove_var("AED_FFMPEG_DIR");
        env::remove_var("AED_DOLBY_VISION_ENABLED");
        env::remove_var("AED_MAX_JOBS_IN_QUEUE");
        env::remove_var("AED_STATUS_BIND_ADDR");
    }

    // For any valid TOML configuration string, the parsed config reflects every
    // section (tools, jobs, scheduler, thresholds, status_server), and env var
    // overrides win over the file values afterwards.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            max_jobs in 1usize..64,
            hours_completed in 0u64..48,
            hours_errored in 0u64..48,
            dv_enabled in proptest::bool::ANY,
            startup_delay in 0u64..120,
            tick in 1u64..60,
            standard_min in 0u8..=100,
            stage_min in 0u8..=100,
            final_min in 0u8..=100,
        ) {
            // Build a valid TOML config string
            let toml_str = format!(
                r#"
[tools]
ffmpeg_dir = "/opt/ffmpeg/bin"
x265_path = "/usr/local/bin/x265"
mkvmerge_path = "/usr/bin/mkvmerge"
hdr10plus_extractor_path = "/usr/local/bin/hdr10plus_tool"
dolby_vision_extractor_path = "/usr/local/bin/dovi_tool"

[jobs]
max_jobs_in_queue = {}
hours_completed_until_removal = {}
hours_errored_until_removal = {}
dolby_vision_enabled = {}

[scheduler]
startup_delay_secs = {}
tick_secs = {}

[thresholds]
standard_min_percent = {}
dual_layer_stage_min_percent = {}
dual_layer_final_min_percent = {}

[status_server]
bind_addr = "0.0.0.0:9000"
"#,
                max_jobs, hours_completed, hours_errored, dv_enabled,
                startup_delay, tick, standard_min, stage_min, final_min
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            // Verify all sections parsed correctly
            prop_assert_eq!(config.tools.ffmpeg_dir, "/opt/ffmpeg/bin");
            prop_assert_eq!(config.tools.x265_path, "/usr/local/bin/x265");
            prop_assert_eq!(config.tools.mkvmerge_path, "/usr/bin/mkvmerge");
            prop_assert_eq!(config.tools.hdr10plus_extractor_path, "/usr/local/bin/hdr10plus_tool");
            prop_assert_eq!(config.tools.dolby_vision_extractor_path, "/usr/local/bin/dovi_tool");
            prop_assert_eq!(config.jobs.max_jobs_in_queue, max_jobs);
            prop_assert_eq!(config.jobs.hours_completed_until_removal, hours_completed);
            prop_assert_eq!(config.jobs.hours_errored_until_removal, hours_errored);
            prop_assert_eq!(config.jobs.dolby_vision_enabled, dv_enabled);
            prop_assert_eq!(config.scheduler.startup_delay_secs, startup_delay);
            prop_assert_eq!(config.scheduler.tick_secs, tick);
            prop_assert_eq!(config.thresholds.standard_min_percent, standard_min);
            prop_assert_eq!(config.thresholds.dual_layer_stage_min_percent, stage_min);
            prop_assert_eq!(config.thresholds.dual_layer_final_min_percent, final_min);
            prop_assert_eq!(config.status_server.bind_addr, "0.0.0.0:9000");
        }

        #[test]
        fn prop_env_overrides_ffmpeg_dir(
            dir in "[a-z/]{1,30}",
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let mut config = Config::parse_toml("").expect("Valid TOML");

            // Set env var and apply override
            env::set_var("AED_FFMPEG_DIR", &dir);
            config.apply_env_overrides();
            clear_env_vars();

            // Env var should override the config value
            prop_assert_eq!(config.tools.ffmpeg_dir, dir);
        }

        #[test]
        fn prop_env_overrides_max_jobs_in_queue(
            initial_max in 1usize..32,
            override_max in 1usize..64,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!(
                r#"
[jobs]
max_jobs_in_queue = {}
"#,
                initial_max
            );

            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("AED_MAX_JOBS_IN_QUEUE", override_max.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.jobs.max_jobs_in_queue, override_max);
        }

        #[test]
        fn prop_env_overrides_dolby_vision_enabled(
            initial_enabled in proptest::bool::ANY,
            override_enabled in proptest::bool::ANY,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!(
                r#"
[jobs]
dolby_vision_enabled = {}
"#,
                initial_enabled
            );

            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            // Test with "true"/"false" string format
            env::set_var("AED_DOLBY_VISION_ENABLED", override_enabled.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.jobs.dolby_vision_enabled, override_enabled);
        }

        #[test]
        fn prop_env_overrides_status_bind_addr(
            port in 1024u16..65535,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let mut config = Config::parse_toml("").expect("Valid TOML");
            let addr = format!("127.0.0.1:{}", port);

            env::set_var("AED_STATUS_BIND_ADDR", &addr);
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.status_server.bind_addr, addr);
        }
    }

    // Test that missing sections use defaults
    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.tools.ffmpeg_dir, "");
        assert_eq!(config.tools.x265_path, "");
        assert_eq!(config.tools.mkvmerge_path, "mkvmerge");
        assert_eq!(config.tools.hdr10plus_extractor_path, "");
        assert_eq!(config.tools.dolby_vision_extractor_path, "");
        assert_eq!(config.jobs.max_jobs_in_queue, 20);
        assert_eq!(config.jobs.hours_completed_until_removal, 1);
        assert_eq!(config.jobs.hours_errored_until_removal, 2);
        assert!(config.jobs.dolby_vision_enabled);
        assert_eq!(config.scheduler.startup_delay_secs, 20);
        assert_eq!(config.scheduler.tick_secs, 5);
        assert_eq!(config.thresholds.standard_min_percent, 90);
        assert_eq!(config.thresholds.dual_layer_stage_min_percent, 85);
        assert_eq!(config.thresholds.dual_layer_final_min_percent, 90);
        assert_eq!(config.status_server.bind_addr, "127.0.0.1:7979");
    }

    // Test partial config with some sections missing
    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let toml_str = r#"
[tools]
ffmpeg_dir = "/opt/ffmpeg/bin"

[jobs]
max_jobs_in_queue = 5
"#;
        let config = Config::parse_toml(toml_str).expect("Partial TOML should parse");

        assert_eq!(config.tools.ffmpeg_dir, "/opt/ffmpeg/bin");
        assert_eq!(config.tools.mkvmerge_path, "mkvmerge"); // default
        assert_eq!(config.jobs.max_jobs_in_queue, 5);
        assert_eq!(config.jobs.hours_completed_until_removal, 1); // default
        assert!(config.jobs.dolby_vision_enabled); // default
        assert_eq!(config.scheduler.tick_secs, 5); // default
        assert_eq!(config.thresholds.standard_min_percent, 90); // default
        assert_eq!(config.status_server.bind_addr, "127.0.0.1:7979"); // default
    }

    #[test]
    fn test_invalid_toml_is_rejected() {
        let result = Config::parse_toml("[jobs\nmax_jobs_in_queue = 5");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_load_from_missing_file_is_io_error() {
        let result = Config::load_from_file("/nonexistent/path/config.toml");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
