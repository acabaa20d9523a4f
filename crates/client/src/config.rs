// Copyright 2024 Soft KVM Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Capture configuration management

use crate::{CaptureError, CaptureResult};
use devcap_core::VideoCodec;
use devcap_protocol::StreamRequest;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// 0 keeps the device resolution
pub const DEFAULT_MAX_SIZE: u32 = 0;
pub const DEFAULT_VIDEO_BIT_RATE: u32 = 2_000_000;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SERVER_PATH: &str = "bin/scrcpy-server";

/// Wait windows used by connection and capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureTimeouts {
    /// How long a second caller waits for an in-flight connection
    pub connect_grace: Duration,
    /// Ceiling for the first parameter sets after connecting
    pub first_keyframe: Duration,
    /// Short window for a genuinely fresh keyframe
    pub fresh_keyframe: Duration,
    /// Long wait used when nothing is cached yet
    pub fallback_keyframe: Duration,
    pub decoder_probe: Duration,
}

impl Default for CaptureTimeouts {
    fn default() -> Self {
        CaptureTimeouts {
            connect_grace: Duration::from_secs(1),
            first_keyframe: Duration::from_secs(5),
            fresh_keyframe: Duration::from_millis(500),
            fallback_keyframe: Duration::from_secs(5),
            decoder_probe: Duration::from_secs(10),
        }
    }
}

/// Resolved capture options for one manager
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureOptions {
    pub max_size: u32,
    pub video_bit_rate: u32,
    /// Zero disables idle disconnect
    pub idle_timeout: Duration,
    pub codec: VideoCodec,
    pub server_path: PathBuf,
    pub ffmpeg_path: Option<PathBuf>,
    pub timeouts: CaptureTimeouts,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        CaptureOptions {
            max_size: DEFAULT_MAX_SIZE,
            video_bit_rate: DEFAULT_VIDEO_BIT_RATE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            codec: VideoCodec::default(),
            server_path: PathBuf::from(DEFAULT_SERVER_PATH),
            ffmpeg_path: None,
            timeouts: CaptureTimeouts::default(),
        }
    }
}

impl CaptureOptions {
    /// Stream negotiation for still capture
    pub fn stream_request(&self) -> StreamRequest {
        StreamRequest::still_capture(self.codec, self.max_size, self.video_bit_rate)
    }
}

/// Physical display metrics of the device
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplayMetrics {
    pub physical_width: u32,
    pub physical_height: u32,
    pub dpr: f64,
}

/// User-supplied overrides, every field optional
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CaptureConfigFile {
    pub enabled: Option<bool>,
    pub max_size: Option<u32>,
    pub video_bit_rate: Option<u32>,
    pub idle_timeout_ms: Option<u64>,
    pub codec: Option<String>,
    pub server_path: Option<PathBuf>,
    pub ffmpeg_path: Option<PathBuf>,
}

impl CaptureConfigFile {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> CaptureResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: CaptureConfigFile = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> CaptureResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Per-user config file location
    pub fn default_path() -> CaptureResult<PathBuf> {
        let base_dirs = directories::BaseDirs::new()
            .ok_or_else(|| CaptureError::Config("Failed to get base directories".to_string()))?;

        #[cfg(windows)]
        {
            Ok(base_dirs.config_dir().join("Devcap").join("capture.json"))
        }
        #[cfg(not(windows))]
        {
            Ok(base_dirs.config_dir().join("devcap").join("capture.json"))
        }
    }

    /// Load the file at `path`, or defaults when it does not exist
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> CaptureResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("No capture config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    /// Merge overrides with defaults.
    ///
    /// Without an explicit `maxSize`, the stream is scaled to the logical
    /// screen size: the longest physical edge times `resize_scale`, or
    /// `1 / dpr` when no scale is given.
    pub fn resolve(
        &self,
        display: Option<&DisplayMetrics>,
        resize_scale: Option<f64>,
    ) -> CaptureResult<CaptureOptions> {
        let defaults = CaptureOptions::default();

        let max_size = match (self.max_size, display) {
            (Some(max_size), _) => max_size,
            (None, Some(display)) => auto_max_size(display, resize_scale)?,
            (None, None) => defaults.max_size,
        };

        let codec = match &self.codec {
            Some(codec) => codec.parse::<VideoCodec>()?,
            None => defaults.codec,
        };

        Ok(CaptureOptions {
            max_size,
            video_bit_rate: self.video_bit_rate.unwrap_or(defaults.video_bit_rate),
            idle_timeout: self
                .idle_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.idle_timeout),
            codec,
            server_path: self.server_path.clone().unwrap_or(defaults.server_path),
            ffmpeg_path: self.ffmpeg_path.clone(),
            timeouts: defaults.timeouts,
        })
    }
}

fn auto_max_size(display: &DisplayMetrics, resize_scale: Option<f64>) -> CaptureResult<u32> {
    let physical_max = display.physical_width.max(display.physical_height);
    let scale = match resize_scale {
        Some(scale) => scale,
        None if display.dpr > 0.0 => 1.0 / display.dpr,
        None => return Err(CaptureError::Config(format!("Invalid device pixel ratio: {}", display.dpr))),
    };
    if !(scale > 0.0) {
        return Err(CaptureError::Config(format!("Invalid resize scale: {}", scale)));
    }

    let max_size = (physical_max as f64 * scale).round() as u32;
    debug!(
        "Auto-calculated max size: {} (physical={}, scale={:.3}, {})",
        max_size,
        physical_max,
        scale,
        if resize_scale.is_some() { "from resize scale" } else { "from 1/dpr" }
    );
    Ok(max_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PHONE: DisplayMetrics = DisplayMetrics {
        physical_width: 1080,
        physical_height: 1920,
        dpr: 2.625,
    };

    #[test]
    fn test_defaults() {
        let options = CaptureConfigFile::default().resolve(None, None).unwrap();

        assert_eq!(options.max_size, 0);
        assert_eq!(options.video_bit_rate, 2_000_000);
        assert_eq!(options.idle_timeout, Duration::from_secs(30));
        assert_eq!(options.codec, VideoCodec::H265);
        assert!(CaptureConfigFile::default().is_enabled());
    }

    #[test]
    fn test_partial_override() {
        let config = CaptureConfigFile {
            max_size: Some(512),
            codec: Some("h264".to_string()),
            ..Default::default()
        };
        let options = config.resolve(Some(&PHONE), None).unwrap();

        assert_eq!(options.max_size, 512);
        assert_eq!(options.codec, VideoCodec::H264);
        assert_eq!(options.video_bit_rate, DEFAULT_VIDEO_BIT_RATE);
    }

    #[test]
    fn test_auto_max_size_from_dpr() {
        let options = CaptureConfigFile::default().resolve(Some(&PHONE), None).unwrap();
        // 1920 / 2.625
        assert_eq!(options.max_size, 731);
    }

    #[test]
    fn test_auto_max_size_from_resize_scale() {
        let options = CaptureConfigFile::default().resolve(Some(&PHONE), Some(0.5)).unwrap();
        assert_eq!(options.max_size, 960);
    }

    #[test]
    fn test_invalid_codec() {
        let config = CaptureConfigFile {
            codec: Some("vp8".to_string()),
            ..Default::default()
        };
        assert!(matches!(config.resolve(None, None), Err(CaptureError::Core(_))));
    }

    #[test]
    fn test_camel_case_file() {
        let config: CaptureConfigFile =
            serde_json::from_str(r#"{"enabled": false, "maxSize": 1024, "idleTimeoutMs": 0}"#).unwrap();
        let options = config.resolve(None, None).unwrap();

        assert!(!config.is_enabled());
        assert_eq!(options.max_size, 1024);
        assert_eq!(options.idle_timeout, Duration::ZERO);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.json");
        let config = CaptureConfigFile {
            video_bit_rate: Some(4_000_000),
            ..Default::default()
        };

        config.save(&path).unwrap();
        assert_eq!(CaptureConfigFile::load(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = CaptureConfigFile::load_or_default(dir.path().join("absent.json")).unwrap();

        assert_eq!(config, CaptureConfigFile::default());
        assert!(matches!(
            CaptureConfigFile::load(dir.path().join("absent.json")),
            Err(CaptureError::Io(_))
        ));
    }
}
