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

//! Background stream consumer
//!
//! Reads packets off the session's video stream, captures the parameter-set
//! header, keeps the latest keyframe and wakes keyframe waiters.

use crate::frames::SessionFrames;
use bytes::Bytes;
use devcap_protocol::nal::contains_irap_picture;
use devcap_protocol::{
    detect_keyframe, extract_parameter_sets, with_parameter_sets, PacketReader, ProtocolError,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Log a progress line every this many packets
const FRAME_LOG_INTERVAL: u64 = 20;

/// Why the consumer loop stopped
#[derive(Debug)]
pub enum ConsumerExit {
    Cancelled,
    Ended,
    Failed(ProtocolError),
}

pub struct FrameConsumer {
    frames: Arc<SessionFrames>,
    packets: u64,
    keyframes: u64,
}

impl FrameConsumer {
    pub fn new(frames: Arc<SessionFrames>) -> Self {
        FrameConsumer {
            frames,
            packets: 0,
            keyframes: 0,
        }
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }

    pub fn keyframes(&self) -> u64 {
        self.keyframes
    }

    /// Handle one packet. Returns true when it was cached as a keyframe.
    pub fn process_packet(&mut self, packet: Bytes) -> bool {
        self.packets += 1;
        let codec = self.frames.codec();
        let is_keyframe = detect_keyframe(&packet, codec);

        if is_keyframe || self.packets % FRAME_LOG_INTERVAL == 0 {
            debug!(
                "Packet #{}: {} bytes, keyframe={}, header={}",
                self.packets,
                packet.len(),
                is_keyframe,
                self.frames.has_parameter_sets()
            );
        }

        if !is_keyframe {
            trace!("Skipping non-keyframe packet ({} bytes)", packet.len());
            return false;
        }

        let header = match self.frames.parameter_sets() {
            Some(header) => header,
            None => match extract_parameter_sets(&packet, codec) {
                Ok(header) => {
                    self.frames.set_parameter_sets(header.clone());
                    header
                }
                Err(e) => {
                    debug!("Keyframe without complete parameter sets, retrying on next: {}", e);
                    return false;
                }
            },
        };

        // Config-only packets seed the header but carry no picture
        if !contains_irap_picture(&packet, codec) {
            return false;
        }

        self.keyframes += 1;
        let waiters = self.frames.waiters();
        if waiters.has_waiters() {
            waiters.fulfill(with_parameter_sets(&header, &packet));
        }
        self.frames.store_keyframe(packet);
        true
    }

    /// Pump the reader until cancelled, the stream ends, or a read fails
    pub async fn run(
        mut self,
        mut reader: Box<dyn PacketReader>,
        cancel: CancellationToken,
    ) -> ConsumerExit {
        debug!("Frame consumer started");

        let exit = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break ConsumerExit::Cancelled,
                read = reader.read() => match read {
                    Ok(Some(packet)) => {
                        self.process_packet(packet);
                    }
                    Ok(None) => break ConsumerExit::Ended,
                    Err(e) => break ConsumerExit::Failed(e),
                },
            }
        };

        match &exit {
            ConsumerExit::Cancelled => debug!("Frame consumer cancelled after {} packets", self.packets),
            ConsumerExit::Ended => debug!("Video stream ended after {} packets", self.packets),
            ConsumerExit::Failed(e) => warn!("Video stream read failed: {}", e),
        }
        exit
    }
}
