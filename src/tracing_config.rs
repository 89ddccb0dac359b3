//! Tracing configuration for the command-line front end
//!
//! The library only emits events; the binary installs the subscriber here.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Configuration for tracing output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracingFormat {
    /// Human-readable console output with colors (default for CLI)
    Console,
    /// Compact console output for CI environments
    Compact,
    /// JSON structured logging for production environments
    #[cfg(feature = "tracing-json")]
    Json,
}

/// Configuration for tracing output destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TracingOutput {
    /// Output to stderr (default)
    Console,
    /// Output to a daily rolling file
    #[cfg(feature = "tracing-files")]
    File(std::path::PathBuf),
}

/// Keeps buffered log writers alive; flushes on drop
#[derive(Debug, Default)]
#[must_use = "dropping the guard stops file logging"]
pub struct TracingGuard {
    #[cfg(feature = "tracing-files")]
    _file: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Tracing configuration builder
#[derive(Debug)]
pub struct TracingConfig {
    /// Verbosity level (maps to log levels)
    pub verbosity: u8,
    /// Output format
    pub format: TracingFormat,
    /// Output destination
    pub output: TracingOutput,
    /// Environment filter string (overrides verbosity if set)
    pub env_filter: Option<String>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            verbosity: 0,
            format: TracingFormat::Console,
            output: TracingOutput::Console,
            env_filter: None,
        }
    }
}

impl TracingConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set verbosity level (0-3+)
    #[must_use]
    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: TracingFormat) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn with_output(mut self, output: TracingOutput) -> Self {
        self.output = output;
        self
    }

    /// Set custom environment filter
    #[must_use]
    pub fn with_env_filter<S: Into<String>>(mut self, filter: S) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    /// Convert verbosity level to tracing filter string
    ///
    /// Dependencies stay at `warn` unless the filter is overridden.
    #[must_use]
    pub fn verbosity_to_filter(&self) -> &'static str {
        match self.verbosity {
            0 => "warn,bgremove_service=info",
            1 => "warn,bgremove_service=debug",
            _ => "info,bgremove_service=trace",
        }
    }

    /// Install the global subscriber
    pub fn init(self) -> anyhow::Result<TracingGuard> {
        let filter = match &self.env_filter {
            Some(directives) => EnvFilter::try_new(directives)?,
            None => EnvFilter::try_new(self.verbosity_to_filter())?,
        };
        let registry = Registry::default().with(filter);

        match &self.output {
            TracingOutput::Console => {
                match self.format {
                    TracingFormat::Console => registry
                        .with(
                            fmt::layer()
                                .with_writer(std::io::stderr)
                                .with_ansi(true)
                                .with_target(false)
                                .compact(),
                        )
                        .try_init()?,
                    TracingFormat::Compact => registry
                        .with(
                            fmt::layer()
                                .with_writer(std::io::stderr)
                                .with_ansi(false)
                                .with_target(false)
                                .compact(),
                        )
                        .try_init()?,
                    #[cfg(feature = "tracing-json")]
                    TracingFormat::Json => registry
                        .with(
                            fmt::layer()
                                .json()
                                .with_writer(std::io::stderr)
                                .with_current_span(true)
                                .with_span_list(true),
                        )
                        .try_init()?,
                }
                Ok(TracingGuard::default())
            },

            #[cfg(feature = "tracing-files")]
            TracingOutput::File(path) => {
                use tracing_appender::{non_blocking, rolling};

                let file_appender = rolling::daily(
                    path.parent().unwrap_or_else(|| std::path::Path::new(".")),
                    path.file_name()
                        .unwrap_or_else(|| std::ffi::OsStr::new("bgremove-service.log")),
                );
                let (file_writer, guard) = non_blocking(file_appender);

                match self.format {
                    TracingFormat::Console | TracingFormat::Compact => registry
                        .with(fmt::layer().with_ansi(false).with_writer(file_writer).compact())
                        .try_init()?,
                    #[cfg(feature = "tracing-json")]
                    TracingFormat::Json => registry
                        .with(
                            fmt::layer()
                                .json()
                                .with_writer(file_writer)
                                .with_current_span(true)
                                .with_span_list(true),
                        )
                        .try_init()?,
                }
                Ok(TracingGuard { _file: Some(guard) })
            },
        }
    }
}

/// Initialize tracing with CLI-friendly defaults, honoring `RUST_LOG`
pub fn init_cli_tracing(verbosity: u8, json: bool) -> anyhow::Result<TracingGuard> {
    let mut config = TracingConfig::new().with_verbosity(verbosity);
    if let Ok(directives) = std::env::var(EnvFilter::DEFAULT_ENV) {
        config = config.with_env_filter(directives);
    }
    if json {
        #[cfg(feature = "tracing-json")]
        {
            config = config.with_format(TracingFormat::Json);
        }
        #[cfg(not(feature = "tracing-json"))]
        anyhow::bail!("JSON logs need the `tracing-json` feature");
    }
    config.init()
}

/// Span creation helpers for request handling
pub mod spans {
    use tracing::{Level, Span};

    /// Span covering one CLI invocation
    #[must_use]
    pub fn session(command: &str, method: &str) -> Span {
        tracing::span!(Level::INFO, "session", command = %command, method = %method)
    }

    /// Span covering a polled video job
    #[must_use]
    pub fn video_job(job_id: &str, input: &std::path::Path) -> Span {
        tracing::span!(
            Level::INFO,
            "video_job",
            job_id = %job_id,
            input = %input.display()
        )
    }
}
