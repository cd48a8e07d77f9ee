use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Top-level Strand configuration, loaded from strand.toml.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrandConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub bindings: BindingConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Commands one buffer may hold before recording is a fatal overflow
    #[serde(default = "default_command_buffer_capacity")]
    pub command_buffer_capacity: usize,
    /// Command buffers queued ahead of the execution thread before flush blocks
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Start the execution thread paused
    #[serde(default)]
    pub start_paused: bool,
    /// GPU retirement polling interval while submissions are in flight
    #[serde(default = "default_retire_poll_interval_us")]
    pub retire_poll_interval_us: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,
    /// Physical device index (vulkan)
    #[serde(default)]
    pub device_index: u32,
    /// Enable VK_LAYER_KHRONOS_validation (vulkan)
    #[serde(default)]
    pub validation: bool,
}

/// Backend selection. Chosen once at start-up and fixed for the process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
    #[default]
    #[serde(rename = "headless")]
    Headless,
    #[serde(rename = "vulkan")]
    Vulkan,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingConfig {
    /// Content-addressed native sets retained before the oldest retired one is reused
    #[serde(default = "default_set_cache_capacity")]
    pub set_cache_capacity: usize,
    /// Native sets allocated per native descriptor pool
    #[serde(default = "default_sets_per_pool")]
    pub sets_per_pool: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub acquire_failure: AcquireFailurePolicy,
    #[serde(default)]
    pub device_error: DeviceErrorPolicy,
}

/// What to do when a presentable image cannot be acquired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcquireFailurePolicy {
    #[default]
    #[serde(rename = "panic")]
    Panic,
    /// Drop the frame's swap-chain pass and present, retry next frame
    #[serde(rename = "skip_frame")]
    SkipFrame,
}

/// What to do when native object creation or submission fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceErrorPolicy {
    #[default]
    #[serde(rename = "panic")]
    Panic,
    /// Latch device-lost, stop executing, keep retiring so waiters wake
    #[serde(rename = "report_device_lost")]
    ReportDeviceLost,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command_buffer_capacity: default_command_buffer_capacity(),
            queue_depth: default_queue_depth(),
            start_paused: false,
            retire_poll_interval_us: default_retire_poll_interval_us(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            device_index: 0,
            validation: false,
        }
    }
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            set_cache_capacity: default_set_cache_capacity(),
            sets_per_pool: default_sets_per_pool(),
        }
    }
}

impl StrandConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, CoreError> {
        let config: StrandConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file if it exists, otherwise return defaults.
    pub fn load_or_default(path: &str) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(CoreError::Io(_)) => Self::default(),
            Err(e) => {
                tracing::warn!(path, error = %e, "ignoring invalid configuration");
                Self::default()
            }
        }
    }

    fn validate(&self) -> Result<(), CoreError> {
        if self.engine.command_buffer_capacity == 0 {
            return Err(CoreError::ConfigError(
                "engine.command_buffer_capacity must be at least 1".to_string(),
            ));
        }
        if self.engine.queue_depth == 0 {
            return Err(CoreError::ConfigError(
                "engine.queue_depth must be at least 1".to_string(),
            ));
        }
        if self.bindings.sets_per_pool == 0 {
            return Err(CoreError::ConfigError(
                "bindings.sets_per_pool must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Returns the default config file path.
/// Search order:
/// 1. System-wide config: `/etc/strand/strand.toml`
/// 2. Local fallback: `./strand.toml`
pub fn default_config_path() -> String {
    let system_path = "/etc/strand/strand.toml";
    if std::path::Path::new(system_path).exists() {
        return system_path.to_string();
    }
    "strand.toml".to_string()
}

fn default_command_buffer_capacity() -> usize {
    16384
}

fn default_queue_depth() -> usize {
    3
}

fn default_retire_poll_interval_us() -> u64 {
    500
}

fn default_set_cache_capacity() -> usize {
    1024
}

fn default_sets_per_pool() -> u32 {
    64
}
