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

//! Device transport abstraction
//!
//! The capture engine never talks to a concrete ADB library. It only needs a
//! handle that can push the streaming server, open a negotiated video session
//! and hand back a packet reader.

use crate::ProtocolResult;
use async_trait::async_trait;
use bytes::Bytes;
use devcap_core::{VideoCodec, VideoResolution};
use std::path::Path;
use tokio::sync::mpsc;
use tracing::debug;

/// Video stream negotiation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub codec: VideoCodec,
    /// Longest edge of the encoded picture, 0 keeps the device resolution
    pub max_size: u32,
    pub video_bit_rate: u32,
    /// Seconds between keyframes, 0 makes every frame a keyframe
    pub i_frame_interval: u32,
    pub audio: bool,
    pub control: bool,
    pub send_frame_meta: bool,
}

impl StreamRequest {
    /// Profile used for still capture: video only, every frame a keyframe
    pub fn still_capture(codec: VideoCodec, max_size: u32, video_bit_rate: u32) -> Self {
        StreamRequest {
            codec,
            max_size,
            video_bit_rate,
            i_frame_interval: 0,
            audio: false,
            control: false,
            send_frame_meta: false,
        }
    }

    /// Render the request as `key=value` streaming server arguments
    pub fn to_server_args(&self) -> Vec<String> {
        vec![
            format!("video_codec={}", self.codec.server_name()),
            format!("max_size={}", self.max_size),
            format!("video_bit_rate={}", self.video_bit_rate),
            format!("video_codec_options=i-frame-interval={}", self.i_frame_interval),
            format!("audio={}", self.audio),
            format!("control={}", self.control),
            format!("send_frame_meta={}", self.send_frame_meta),
        ]
    }
}

/// Metadata announced when the video stream opens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamMetadata {
    pub width: u32,
    pub height: u32,
}

impl StreamMetadata {
    pub fn resolution(&self) -> VideoResolution {
        VideoResolution::new(self.width, self.height)
    }
}

/// An opened video stream
pub struct VideoStream {
    pub metadata: StreamMetadata,
    pub reader: Box<dyn PacketReader>,
}

/// Packet source of a video stream
#[async_trait]
pub trait PacketReader: Send {
    /// Read the next packet, `None` once the stream has ended
    async fn read(&mut self) -> ProtocolResult<Option<Bytes>>;
}

/// A negotiated streaming session on the device
#[async_trait]
pub trait VideoSession: Send {
    /// Wait for the video stream, `None` if the session carries no video
    async fn video_stream(&mut self) -> ProtocolResult<Option<VideoStream>>;

    /// Stop the server and release the session
    async fn close(&mut self) -> ProtocolResult<()>;
}

/// Authenticated connection to a device
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Upload the streaming server binary to the device
    async fn push_server(&self, local_path: &Path) -> ProtocolResult<()>;

    /// Start the streaming server with the given request
    async fn start_session(&self, request: &StreamRequest) -> ProtocolResult<Box<dyn VideoSession>>;
}

/// Packet reader fed through an mpsc channel
pub struct ChannelPacketReader {
    receiver: mpsc::Receiver<ProtocolResult<Bytes>>,
}

impl ChannelPacketReader {
    /// Create a reader and the sender that feeds it
    pub fn channel(capacity: usize) -> (mpsc::Sender<ProtocolResult<Bytes>>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, ChannelPacketReader { receiver: rx })
    }
}

#[async_trait]
impl PacketReader for ChannelPacketReader {
    async fn read(&mut self) -> ProtocolResult<Option<Bytes>> {
        match self.receiver.recv().await {
            Some(Ok(packet)) => Ok(Some(packet)),
            Some(Err(e)) => Err(e),
            None => {
                debug!("Packet channel closed");
                Ok(None)
            }
        }
    }
}
