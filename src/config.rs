//! Configuration types for the admission and processing core
//!
//! Limits are fixed once the service is constructed; nothing here is mutable
//! at runtime. `ServiceConfig::from_env` reads the same variables the hosted
//! deployment uses and falls back to the defaults below.

use crate::error::{Result, ServiceError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable names understood by [`ServiceConfig::from_env`]
pub mod env {
    pub const DAILY_LIMIT: &str = "DAILY_LIMIT";
    pub const ABUSE_THRESHOLD: &str = "ABUSE_THRESHOLD";
    pub const VIDEO_BATCH_SIZE: &str = "VIDEO_BATCH_SIZE";
    pub const VIDEO_FRAMERATE: &str = "VIDEO_FRAMERATE";
    pub const ARTIFACT_RETENTION_SECS: &str = "ARTIFACT_RETENTION_SECS";
    pub const TOOL_TIMEOUT_SECS: &str = "TOOL_TIMEOUT_SECS";
    pub const MAX_UPLOAD_BYTES: &str = "MAX_UPLOAD_BYTES";
    pub const SCRATCH_DIR: &str = "BGREMOVE_SCRATCH_DIR";
    pub const OUTPUT_DIR: &str = "BGREMOVE_OUTPUT_DIR";

    /// Every variable, in reporting order
    pub const ALL: &[&str] = &[
        DAILY_LIMIT,
        ABUSE_THRESHOLD,
        VIDEO_BATCH_SIZE,
        VIDEO_FRAMERATE,
        ARTIFACT_RETENTION_SECS,
        TOOL_TIMEOUT_SECS,
        MAX_UPLOAD_BYTES,
        SCRATCH_DIR,
        OUTPUT_DIR,
    ];
}

/// Per-client request limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Requests per client per calendar day before `LimitExceeded`
    pub daily_limit: u64,
    /// Requests per client per calendar day before the client is blocked
    pub abuse_threshold: u64,
    /// How often stale counters are swept
    pub sweep_interval: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            daily_limit: 50,
            abuse_threshold: 100,
            sweep_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Accelerator arbitration bounds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArbiterConfig {
    /// Upper bound on moving a model onto the accelerator (None = unbounded)
    pub activation_timeout: Option<Duration>,
    /// Leases idle for longer than this are force-released (None = never)
    pub lease_ceiling: Option<Duration>,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            activation_timeout: Some(Duration::from_secs(60)),
            lease_ceiling: None,
        }
    }
}

/// Video pipeline tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConfig {
    /// Frames transformed between progress updates
    pub batch_size: usize,
    /// Output frame rate
    pub framerate: u32,
    /// Wall-clock bound on each ffmpeg/ffprobe invocation (None = unbounded)
    pub tool_timeout: Option<Duration>,
    /// Completed artifacts older than this are deleted
    pub artifact_retention: Duration,
    /// How often the artifact sweep runs
    pub artifact_sweep_interval: Duration,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            batch_size: 3,
            framerate: 24,
            tool_timeout: Some(Duration::from_secs(10 * 60)),
            artifact_retention: Duration::from_secs(10 * 60),
            artifact_sweep_interval: Duration::from_secs(10 * 60),
        }
    }
}

/// Filesystem locations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Parent of the per-job scratch directories
    pub scratch_dir: PathBuf,
    /// Where finished video artifacts are written
    pub output_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("bgremove-service");
        Self {
            scratch_dir: std::env::temp_dir().join("bgremove-service"),
            output_dir: base.join("outputs"),
        }
    }
}

/// Configuration for the whole service core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub admission: AdmissionConfig,
    pub arbiter: ArbiterConfig,
    pub video: VideoConfig,
    pub storage: StorageConfig,
    /// Largest accepted upload, images and videos alike
    pub max_upload_bytes: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            admission: AdmissionConfig::default(),
            arbiter: ArbiterConfig::default(),
            video: VideoConfig::default(),
            storage: StorageConfig::default(),
            max_upload_bytes: 100 * 1024 * 1024,
        }
    }
}

/// Outcome of inspecting one environment variable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvVarReport {
    pub name: &'static str,
    pub value: Option<String>,
    /// Parse error, if the value is set but unusable
    pub problem: Option<String>,
}

impl ServiceConfig {
    /// Create a new configuration builder
    ///
    /// # Examples
    ///
    /// ```rust
    /// use bgremove_service::ServiceConfig;
    ///
    /// let config = ServiceConfig::builder()
    ///     .daily_limit(5)
    ///     .abuse_threshold(10)
    ///     .build()
    ///     .unwrap();
    /// assert_eq!(config.admission.daily_limit, 5);
    /// ```
    #[must_use]
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder::default()
    }

    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let mut builder = Self::builder()
            .daily_limit(parse_var(&lookup, env::DAILY_LIMIT, defaults.admission.daily_limit)?)
            .abuse_threshold(parse_var(
                &lookup,
                env::ABUSE_THRESHOLD,
                defaults.admission.abuse_threshold,
            )?)
            .batch_size(parse_var(&lookup, env::VIDEO_BATCH_SIZE, defaults.video.batch_size)?)
            .framerate(parse_var(&lookup, env::VIDEO_FRAMERATE, defaults.video.framerate)?)
            .artifact_retention(Duration::from_secs(parse_var(
                &lookup,
                env::ARTIFACT_RETENTION_SECS,
                defaults.video.artifact_retention.as_secs(),
            )?))
            .max_upload_bytes(parse_var(&lookup, env::MAX_UPLOAD_BYTES, defaults.max_upload_bytes)?);

        if let Some(secs) = lookup(env::TOOL_TIMEOUT_SECS) {
            let secs: u64 = parse_value(env::TOOL_TIMEOUT_SECS, &secs)?;
            builder = builder.tool_timeout((secs > 0).then(|| Duration::from_secs(secs)));
        }
        if let Some(dir) = lookup(env::SCRATCH_DIR) {
            builder = builder.scratch_dir(dir);
        }
        if let Some(dir) = lookup(env::OUTPUT_DIR) {
            builder = builder.output_dir(dir);
        }

        builder.build()
    }

    /// Describe every known environment variable and whether it parses
    pub fn env_report<F>(lookup: F) -> Vec<EnvVarReport>
    where
        F: Fn(&str) -> Option<String>,
    {
        env::ALL
            .iter()
            .map(|&name| {
                let value = lookup(name);
                let problem = value.as_deref().and_then(|raw| match name {
                    env::SCRATCH_DIR | env::OUTPUT_DIR => {
                        raw.trim().is_empty().then(|| "path must not be empty".to_string())
                    },
                    _ => parse_value::<u64>(name, raw).err().map(|e| e.to_string()),
                });
                EnvVarReport {
                    name,
                    value,
                    problem,
                }
            })
            .collect()
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.admission.daily_limit == 0 {
            return Err(ServiceError::config_value_error(
                "daily limit",
                self.admission.daily_limit,
                ">= 1",
                Some(50),
            ));
        }

        if self.admission.abuse_threshold < self.admission.daily_limit {
            return Err(ServiceError::invalid_config(format!(
                "abuse threshold ({}) must not be below the daily limit ({})",
                self.admission.abuse_threshold, self.admission.daily_limit
            )));
        }

        if !(1..=64).contains(&self.video.batch_size) {
            return Err(ServiceError::config_value_error(
                "video batch size",
                self.video.batch_size,
                "1-64",
                Some(3),
            ));
        }

        if !(1..=240).contains(&self.video.framerate) {
            return Err(ServiceError::config_value_error(
                "video framerate",
                self.video.framerate,
                "1-240",
                Some(24),
            ));
        }

        if self.max_upload_bytes == 0 {
            return Err(ServiceError::invalid_config("max upload size must be positive"));
        }

        if self.admission.sweep_interval.is_zero() || self.video.artifact_sweep_interval.is_zero() {
            return Err(ServiceError::invalid_config("sweep intervals must be positive"));
        }

        if self.storage.scratch_dir.as_os_str().is_empty()
            || self.storage.output_dir.as_os_str().is_empty()
        {
            return Err(ServiceError::invalid_config("storage directories must be set"));
        }

        Ok(())
    }
}

fn parse_value<T>(name: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| {
        ServiceError::invalid_config(format!("{name}='{raw}' is not a valid number: {e}"))
    })
}

fn parse_var<T, F>(lookup: &F, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(name).map_or(Ok(default), |raw| parse_value(name, &raw))
}

/// Builder for `ServiceConfig`
#[derive(Debug, Default)]
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    #[must_use]
    pub fn daily_limit(mut self, limit: u64) -> Self {
        self.config.admission.daily_limit = limit;
        self
    }

    #[must_use]
    pub fn abuse_threshold(mut self, threshold: u64) -> Self {
        self.config.admission.abuse_threshold = threshold;
        self
    }

    #[must_use]
    pub fn admission_sweep_interval(mut self, interval: Duration) -> Self {
        self.config.admission.sweep_interval = interval;
        self
    }

    #[must_use]
    pub fn activation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.arbiter.activation_timeout = timeout;
        self
    }

    #[must_use]
    pub fn lease_ceiling(mut self, ceiling: Option<Duration>) -> Self {
        self.config.arbiter.lease_ceiling = ceiling;
        self
    }

    /// Set batch size for frame processing
    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.config.video.batch_size = batch_size.max(1);
        self
    }

    #[must_use]
    pub fn framerate(mut self, framerate: u32) -> Self {
        self.config.video.framerate = framerate;
        self
    }

    #[must_use]
    pub fn tool_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.video.tool_timeout = timeout;
        self
    }

    #[must_use]
    pub fn artifact_retention(mut self, retention: Duration) -> Self {
        self.config.video.artifact_retention = retention;
        self
    }

    #[must_use]
    pub fn artifact_sweep_interval(mut self, interval: Duration) -> Self {
        self.config.video.artifact_sweep_interval = interval;
        self
    }

    #[must_use]
    pub fn scratch_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.config.storage.scratch_dir = dir.into();
        self
    }

    #[must_use]
    pub fn output_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.config.storage.output_dir = dir.into();
        self
    }

    #[must_use]
    pub fn max_upload_bytes(mut self, bytes: u64) -> Self {
        self.config.max_upload_bytes = bytes;
        self
    }

    /// Build the final configuration with validation
    pub fn build(self) -> Result<ServiceConfig> {
        let config = self.config;
        config.validate()?;
        Ok(config)
    }
}
