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

//! Core types for Devcap

use crate::{DevcapError, DevcapResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Connection state of a capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState::Disconnected
    }
}

/// Video resolution reported by the device stream
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VideoResolution {
    pub width: u32,
    pub height: u32,
}

impl VideoResolution {
    pub fn new(width: u32, height: u32) -> Self {
        VideoResolution { width, height }
    }

    /// Longest edge in pixels
    pub fn max_dimension(&self) -> u32 {
        self.width.max(self.height)
    }
}

impl fmt::Display for VideoResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Elementary stream codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    H265,
}

impl VideoCodec {
    /// Codec name understood by the streaming server
    pub fn server_name(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::H265 => "h265",
        }
    }

    /// Demuxer name for a raw Annex-B stream in ffmpeg
    pub fn ffmpeg_format(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::H265 => "hevc",
        }
    }
}

impl Default for VideoCodec {
    fn default() -> Self {
        VideoCodec::H265
    }
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.server_name())
    }
}

impl FromStr for VideoCodec {
    type Err = DevcapError;

    fn from_str(s: &str) -> DevcapResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "h264" | "avc" => Ok(VideoCodec::H264),
            "h265" | "hevc" => Ok(VideoCodec::H265),
            other => Err(DevcapError::UnsupportedCodec(other.to_string())),
        }
    }
}

/// Where the frame behind a screenshot came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FrameSource {
    /// A keyframe that arrived during the short wait window
    Fresh,
    /// The last keyframe seen on the stream
    Cached,
    /// A keyframe that arrived during the long fallback wait
    FreshRetry,
}

impl fmt::Display for FrameSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameSource::Fresh => "fresh",
            FrameSource::Cached => "cached",
            FrameSource::FreshRetry => "fresh-retry",
        };
        f.write_str(name)
    }
}
