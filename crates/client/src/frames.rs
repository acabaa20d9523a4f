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

//! Per-session frame state: parameter-set header, latest keyframe and waiters

use crate::waiters::FrameWaitRegistry;
use crate::{CaptureError, CaptureResult};
use bytes::Bytes;
use devcap_core::VideoCodec;
use devcap_protocol::with_parameter_sets;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
enum HeaderState {
    Pending,
    Ready(Bytes),
    Closed,
}

/// The most recent keyframe seen on the stream
#[derive(Debug, Clone)]
pub struct CachedKeyframe {
    pub data: Bytes,
    pub received_at: Instant,
}

impl CachedKeyframe {
    pub fn age(&self) -> Duration {
        self.received_at.elapsed()
    }
}

/// Frame state owned by one streaming session.
///
/// Everything here dies with the session, so a reconnect always starts
/// with an empty header and cache.
pub struct SessionFrames {
    codec: VideoCodec,
    header: watch::Sender<HeaderState>,
    latest: Mutex<Option<CachedKeyframe>>,
    waiters: FrameWaitRegistry,
}

impl SessionFrames {
    pub fn new(codec: VideoCodec) -> Self {
        let (header, _) = watch::channel(HeaderState::Pending);
        SessionFrames {
            codec,
            header,
            latest: Mutex::new(None),
            waiters: FrameWaitRegistry::new(),
        }
    }

    pub fn codec(&self) -> VideoCodec {
        self.codec
    }

    /// Concatenated parameter sets, once captured
    pub fn parameter_sets(&self) -> Option<Bytes> {
        match &*self.header.borrow() {
            HeaderState::Ready(header) => Some(header.clone()),
            _ => None,
        }
    }

    pub fn has_parameter_sets(&self) -> bool {
        self.parameter_sets().is_some()
    }

    /// Store the header. Only the first call per session has any effect.
    pub fn set_parameter_sets(&self, header: Bytes) -> bool {
        let len = header.len();
        let stored = self.header.send_if_modified(|state| {
            if matches!(state, HeaderState::Pending) {
                *state = HeaderState::Ready(header);
                true
            } else {
                false
            }
        });
        if stored {
            debug!("Captured {} parameter sets ({} bytes)", self.codec, len);
        }
        stored
    }

    /// Replace the cached keyframe
    pub fn store_keyframe(&self, data: Bytes) {
        *self.latest.lock() = Some(CachedKeyframe {
            data,
            received_at: Instant::now(),
        });
    }

    pub fn cached_keyframe(&self) -> Option<CachedKeyframe> {
        self.latest.lock().clone()
    }

    /// Cached keyframe prefixed with the header, when both are available
    pub fn cached_frame_with_header(&self) -> Option<Bytes> {
        let header = self.parameter_sets()?;
        let cached = self.cached_keyframe()?;
        Some(with_parameter_sets(&header, &cached.data))
    }

    pub fn waiters(&self) -> &FrameWaitRegistry {
        &self.waiters
    }

    /// Wait until the first parameter sets arrive
    pub async fn wait_for_parameter_sets(&self, timeout: Duration) -> CaptureResult<Bytes> {
        let mut receiver = self.header.subscribe();
        let wait = receiver.wait_for(|state| !matches!(state, HeaderState::Pending));

        let header = match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(state)) => match &*state {
                HeaderState::Ready(header) => Ok(header.clone()),
                _ => Err(CaptureError::StreamClosed),
            },
            Ok(Err(_)) => Err(CaptureError::StreamClosed),
            Err(_) => Err(CaptureError::NoKeyframe {
                waited_ms: timeout.as_millis() as u64,
            }),
        };
        header
    }

    /// Drop header and cache, and fail anyone still waiting
    pub fn close(&self) {
        self.header.send_replace(HeaderState::Closed);
        self.latest.lock().take();
        self.waiters.close();
    }
}
