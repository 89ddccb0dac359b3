//! Alpha-preserving output codecs
//!
//! Transformed frames carry transparency, so only codecs that keep an alpha
//! plane are offered.

use crate::error::{Result, ServiceError};
use std::fmt;

/// Output codec for transparent video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlphaCodec {
    /// Lossless VP9 with alpha in WebM (plays in browsers)
    #[default]
    Vp9Lossless,
    /// Apple ProRes 4444 in QuickTime
    ProRes4444,
    /// PNG-in-QuickTime, lossless RGBA
    PngMov,
}

impl AlphaCodec {
    /// Get FFmpeg codec name
    #[must_use]
    pub fn ffmpeg_name(&self) -> &'static str {
        match self {
            Self::Vp9Lossless => "libvpx-vp9",
            Self::ProRes4444 => "prores_ks",
            Self::PngMov => "png",
        }
    }

    /// Pixel format that keeps the alpha plane
    #[must_use]
    pub fn pixel_format(&self) -> &'static str {
        match self {
            Self::Vp9Lossless => "yuva420p",
            Self::ProRes4444 => "yuva444p10le",
            Self::PngMov => "rgba",
        }
    }

    /// Container extension for the output artifact
    #[must_use]
    pub fn container_extension(&self) -> &'static str {
        match self {
            Self::Vp9Lossless => "webm",
            Self::ProRes4444 | Self::PngMov => "mov",
        }
    }

    /// Codec-specific ffmpeg output arguments
    #[must_use]
    pub fn ffmpeg_args(&self) -> Vec<String> {
        let mut args = vec![
            "-c:v".to_string(),
            self.ffmpeg_name().to_string(),
            "-pix_fmt".to_string(),
            self.pixel_format().to_string(),
        ];
        match self {
            Self::Vp9Lossless => {
                args.extend(["-lossless".to_string(), "1".to_string()]);
            },
            Self::ProRes4444 => {
                args.extend(["-profile:v".to_string(), "4444".to_string()]);
            },
            Self::PngMov => {},
        }
        args
    }

    /// Parse codec from string
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "vp9" | "webm" | "libvpx-vp9" => Ok(Self::Vp9Lossless),
            "prores" | "prores4444" | "prores_ks" => Ok(Self::ProRes4444),
            "png" | "png-mov" => Ok(Self::PngMov),
            _ => Err(ServiceError::invalid_config(format!(
                "Unsupported alpha codec: {s} (expected vp9, prores or png)"
            ))),
        }
    }
}

impl fmt::Display for AlphaCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Vp9Lossless => "vp9",
            Self::ProRes4444 => "prores",
            Self::PngMov => "png",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_parsing() {
        assert_eq!(AlphaCodec::parse("VP9").unwrap(), AlphaCodec::Vp9Lossless);
        assert_eq!(AlphaCodec::parse("prores").unwrap(), AlphaCodec::ProRes4444);
        assert!(AlphaCodec::parse("h264").is_err());
        for codec in [AlphaCodec::Vp9Lossless, AlphaCodec::ProRes4444, AlphaCodec::PngMov] {
            assert_eq!(AlphaCodec::parse(&codec.to_string()).unwrap(), codec);
        }
    }

    #[test]
    fn test_ffmpeg_args_keep_alpha() {
        let args = AlphaCodec::Vp9Lossless.ffmpeg_args();
        assert!(args.windows(2).any(|w| w == ["-pix_fmt", "yuva420p"]));
        assert!(args.windows(2).any(|w| w == ["-lossless", "1"]));
        assert_eq!(AlphaCodec::default().container_extension(), "webm");
    }
}
