//! Configuration conversion utilities for CLI arguments

use crate::cli::main_impl::{Cli, Command};
use crate::config::ServiceConfig;
use crate::segmentation::{PassthroughSegmenter, SegmenterRegistry};
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// Convert CLI arguments to a validated `ServiceConfig`
pub(crate) struct CliConfigBuilder;

impl CliConfigBuilder {
    /// Environment configuration with CLI overrides applied on top
    pub(crate) fn from_cli(cli: &Cli) -> Result<ServiceConfig> {
        let base = ServiceConfig::from_env().context("Invalid service environment")?;
        Self::apply_overrides(base, cli)
    }

    fn apply_overrides(mut config: ServiceConfig, cli: &Cli) -> Result<ServiceConfig> {
        if let Some(dir) = &cli.scratch_dir {
            config.storage.scratch_dir.clone_from(dir);
        }
        if let Some(dir) = &cli.output_dir {
            config.storage.output_dir.clone_from(dir);
        }

        if let Command::Video {
            batch_size,
            framerate,
            ..
        } = &cli.command
        {
            if let Some(batch_size) = batch_size {
                config.video.batch_size = *batch_size;
            }
            if let Some(framerate) = framerate {
                config.video.framerate = *framerate;
            }
        }

        config.validate().context("Invalid command-line options")?;
        Ok(config)
    }

    /// Passthrough plus every ONNX model found in `models_dir`
    pub(crate) fn registry(models_dir: Option<&Path>) -> SegmenterRegistry {
        let mut registry = SegmenterRegistry::new();
        registry.register(Arc::new(PassthroughSegmenter::new()));

        #[cfg(feature = "tract")]
        if let Some(dir) = models_dir {
            let found = crate::backends::TractSegmenter::discover(dir);
            if found.is_empty() {
                warn!(dir = %dir.display(), "No ONNX models found");
            }
            for segmenter in found {
                registry.register(Arc::new(segmenter));
            }
        }

        #[cfg(not(feature = "tract"))]
        if models_dir.is_some() {
            warn!("--models-dir ignored: built without the `tract` feature");
        }

        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::path::PathBuf;

    #[test]
    fn test_overrides_apply_to_config() {
        let cli = Cli::try_parse_from([
            "bgremove-service",
            "--scratch-dir",
            "/tmp/scratch",
            "--output-dir",
            "/tmp/out",
            "video",
            "clip.mp4",
            "--batch-size",
            "4",
            "--framerate",
            "24",
        ])
        .unwrap();

        let config = CliConfigBuilder::apply_overrides(ServiceConfig::default(), &cli).unwrap();
        assert_eq!(config.storage.scratch_dir, PathBuf::from("/tmp/scratch"));
        assert_eq!(config.storage.output_dir, PathBuf::from("/tmp/out"));
        assert_eq!(config.video.batch_size, 4);
        assert_eq!(config.video.framerate, 24);
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let cli =
            Cli::try_parse_from(["bgremove-service", "video", "clip.mp4", "--batch-size", "0"]).unwrap();
        assert!(CliConfigBuilder::apply_overrides(ServiceConfig::default(), &cli).is_err());
    }

    #[test]
    fn test_registry_always_has_passthrough() {
        let registry = CliConfigBuilder::registry(None);
        assert_eq!(registry.methods(), vec!["passthrough".to_string()]);
    }
}
