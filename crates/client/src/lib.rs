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

//! # Devcap Client
//!
//! Attaches to a device's video stream and turns the freshest keyframe into a
//! PNG on demand.

pub mod adapter;
pub mod config;
pub mod consumer;
pub mod decoder;
pub mod frames;
pub mod idle;
pub mod manager;
pub mod waiters;

pub use adapter::{DeviceCaptureAdapter, ScreenSize, TransportConnector};
pub use config::{CaptureConfigFile, CaptureOptions, CaptureTimeouts, DisplayMetrics};
pub use decoder::{EnvironmentValidator, FfmpegDecoder, StillImageDecoder};
pub use frames::{CachedKeyframe, SessionFrames};
pub use manager::{CaptureManager, CaptureTimings, Screenshot};
pub use waiters::{FrameWaitRegistry, KeyframeWaiter};

use devcap_core::DevcapError;
use devcap_protocol::ProtocolError;

/// Capture result type
pub type CaptureResult<T> = Result<T, CaptureError>;

/// Capture errors
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Core error: {0}")]
    Core(#[from] DevcapError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Still image decoder is not available: {0}")]
    DecoderUnavailable(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection failed: another connection attempt did not complete in time")]
    ConnectInProgress,

    #[error("Not connected to device")]
    NotConnected,

    #[error("No keyframe received within {waited_ms}ms. Device may have a long GOP interval or video encoding issues. Please retry.")]
    NoKeyframe { waited_ms: u64 },

    #[error("No fresh keyframe received within {timeout_ms}ms")]
    KeyframeTimeout { timeout_ms: u64 },

    #[error("Video stream closed while waiting for a keyframe")]
    StreamClosed,

    #[error("Frame decode failed: {0}")]
    Decode(String),
}
