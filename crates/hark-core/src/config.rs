use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{HarkError, Result};

/// Timer handles are 16-bit, so no more timers than this can be armed.
pub const MAX_TIMER_IDS: usize = 1 << 16;

/// Top-level configuration for the Hark voice-trigger service.
///
/// Loaded from `hark.toml` by default. Every section falls back to its
/// defaults when absent, so an empty file is a valid configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarkConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub timer: TimerConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub wakeup: WakeupConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub trigger: TriggerConfig,
}

impl HarkConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: HarkConfig = toml::from_str(&content)?;
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Reject values that would leave the service unable to run.
    pub fn validate(&self) -> Result<()> {
        if self.timer.max_timers == 0 || self.timer.max_timers > MAX_TIMER_IDS {
            return Err(HarkError::Config(format!(
                "timer.max_timers must be in 1..={MAX_TIMER_IDS}"
            )));
        }
        if self.dispatch.queue_capacity == 0 {
            return Err(HarkError::Config(
                "dispatch.queue_capacity must be > 0".into(),
            ));
        }
        if self.capture.min_buffer_size == 0 {
            return Err(HarkError::Config(
                "capture.min_buffer_size must be > 0".into(),
            ));
        }
        if self.capture.bits_per_sample % 8 != 0 || self.capture.bits_per_sample == 0 {
            return Err(HarkError::Config(
                "capture.bits_per_sample must be a non-zero multiple of 8".into(),
            ));
        }
        Ok(())
    }
}

/// General service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Timer service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    /// Maximum number of simultaneously armed timers.
    pub max_timers: usize,
    /// Name given to the timer worker thread.
    pub thread_name: String,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            max_timers: 10,
            thread_name: "hark-timer".to_string(),
        }
    }
}

/// State dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Bounded inbound queue length per state machine.
    pub queue_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { queue_capacity: 64 }
    }
}

/// Wait-until timeouts for one wake-engine profile, in milliseconds.
///
/// Zero means the state has no wait-until timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileTimeouts {
    pub recognizing_ms: u64,
    pub recognized_ms: u64,
    pub read_capturer_ms: u64,
}

impl Default for ProfileTimeouts {
    fn default() -> Self {
        Self {
            recognizing_ms: 10_000,
            recognized_ms: 2_000,
            read_capturer_ms: 10_000,
        }
    }
}

fn non_zero_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl ProfileTimeouts {
    pub fn recognizing(&self) -> Option<Duration> {
        non_zero_millis(self.recognizing_ms)
    }

    pub fn recognized(&self) -> Option<Duration> {
        non_zero_millis(self.recognized_ms)
    }

    pub fn read_capturer(&self) -> Option<Duration> {
        non_zero_millis(self.read_capturer_ms)
    }
}

/// Per-profile wake-engine timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WakeupConfig {
    pub standard: ProfileTimeouts,
    pub headset: ProfileTimeouts,
    pub single_stage: ProfileTimeouts,
}

impl Default for WakeupConfig {
    fn default() -> Self {
        Self {
            standard: ProfileTimeouts::default(),
            headset: ProfileTimeouts {
                recognizing_ms: 10_000,
                recognized_ms: 1,
                read_capturer_ms: 10_000,
            },
            single_stage: ProfileTimeouts {
                recognizing_ms: 0,
                recognized_ms: 2_000,
                read_capturer_ms: 10_000,
            },
        }
    }
}

/// Audio capture format and buffering.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Minimum capture buffer size per channel, in bytes.
    pub min_buffer_size: u32,
    /// Capture callback interval in milliseconds.
    pub interval_ms: u32,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    /// How long a read waits for each channel frame.
    pub read_wait_ms: u64,
    /// Frames kept per channel before the oldest is dropped.
    pub max_queued_frames: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            min_buffer_size: 640,
            interval_ms: 100,
            sample_rate: 16_000,
            bits_per_sample: 16,
            read_wait_ms: 1_000,
            max_queued_frames: 50,
        }
    }
}

impl CaptureConfig {
    /// Width of one sample in bytes.
    pub fn bytes_per_sample(&self) -> usize {
        usize::from(self.bits_per_sample / 8).max(1)
    }

    pub fn read_wait(&self) -> Duration {
        Duration::from_millis(self.read_wait_ms)
    }
}

/// Trigger connector settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// Parameters pushed to the connector module at startup.
    pub params: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = HarkConfig::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.timer.max_timers, 10);
        assert_eq!(config.dispatch.queue_capacity, 64);
        assert_eq!(config.wakeup.standard.recognizing_ms, 10_000);
        assert_eq!(config.wakeup.standard.recognized_ms, 2_000);
        assert_eq!(config.wakeup.headset.recognized_ms, 1);
        assert_eq!(config.wakeup.single_stage.recognizing(), None);
        assert_eq!(config.capture.min_buffer_size, 640);
        assert_eq!(config.capture.sample_rate, 16_000);
        assert!(config.trigger.params.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_valid_config() {
        let content = r#"
[general]
log_level = "debug"

[timer]
max_timers = 32
thread_name = "timers"

[wakeup.standard]
recognizing_ms = 5000
recognized_ms = 100
read_capturer_ms = 3000

[capture]
read_wait_ms = 250

[trigger.params]
wakeup_source_channel = "2"
"#;
        let file = create_temp_config(content);
        let config = HarkConfig::load(file.path()).unwrap();
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.timer.max_timers, 32);
        assert_eq!(config.timer.thread_name, "timers");
        assert_eq!(
            config.wakeup.standard.recognizing(),
            Some(Duration::from_millis(5000))
        );
        assert_eq!(config.capture.read_wait(), Duration::from_millis(250));
        assert_eq!(
            config.trigger.params.get("wakeup_source_channel").map(String::as_str),
            Some("2")
        );
    }

    #[test]
    fn test_load_partial_config_uses_defaults() {
        let content = r#"
[general]
log_level = "warn"
"#;
        let file = create_temp_config(content);
        let config = HarkConfig::load(file.path()).unwrap();
        assert_eq!(config.general.log_level, "warn");
        // Remaining fields use defaults
        assert_eq!(config.timer.max_timers, 10);
        assert_eq!(config.capture.interval_ms, 100);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = HarkConfig::load_or_default(Path::new("/nonexistent/hark.toml"));
        assert_eq!(config.timer.max_timers, 10);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hark.toml");

        let mut config = HarkConfig::default();
        config
            .trigger
            .params
            .insert("fold_posture".to_string(), "1".to_string());
        config.save(&path).unwrap();

        let reloaded = HarkConfig::load(&path).unwrap();
        assert_eq!(reloaded.timer.max_timers, config.timer.max_timers);
        assert_eq!(reloaded.wakeup.headset, config.wakeup.headset);
        assert_eq!(reloaded.wakeup.single_stage.recognizing(), None);
        assert_eq!(reloaded.trigger.params, config.trigger.params);
    }

    #[test]
    fn test_config_load_invalid_toml() {
        let file = create_temp_config("this is [not valid toml");
        let result = HarkConfig::load(file.path());
        assert!(matches!(result, Err(HarkError::Config(_))));
    }

    #[test]
    fn test_config_rejects_zero_timers() {
        let file = create_temp_config("[timer]\nmax_timers = 0\n");
        let result = HarkConfig::load(file.path());
        assert!(matches!(result, Err(HarkError::Config(_))));
    }

    #[test]
    fn test_config_rejects_timers_beyond_handle_range() {
        let mut config = HarkConfig::default();
        config.timer.max_timers = MAX_TIMER_IDS;
        assert!(config.validate().is_ok());
        config.timer.max_timers = MAX_TIMER_IDS + 1;
        assert!(matches!(config.validate(), Err(HarkError::Config(_))));
    }

    #[test]
    fn test_bytes_per_sample() {
        let mut capture = CaptureConfig::default();
        assert_eq!(capture.bytes_per_sample(), 2);
        capture.bits_per_sample = 24;
        assert_eq!(capture.bytes_per_sample(), 3);
    }

    #[test]
    fn test_config_rejects_odd_sample_width() {
        let mut config = HarkConfig::default();
        config.capture.bits_per_sample = 12;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_save_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("hark.toml");
        HarkConfig::default().save(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_config_empty_toml_uses_all_defaults() {
        let file = create_temp_config("");
        let config = HarkConfig::load(file.path()).unwrap();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.dispatch.queue_capacity, 64);
        assert_eq!(config.capture.bits_per_sample, 16);
    }

    #[test]
    fn test_sub_config_defaults() {
        let timeouts = ProfileTimeouts::default();
        assert_eq!(timeouts.recognizing(), Some(Duration::from_secs(10)));
        assert_eq!(timeouts.recognized(), Some(Duration::from_secs(2)));
        assert_eq!(timeouts.read_capturer(), Some(Duration::from_secs(10)));

        let capture = CaptureConfig::default();
        assert_eq!(capture.read_wait(), Duration::from_secs(1));
        assert_eq!(capture.max_queued_frames, 50);
    }
}
