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

//! Capture manager: connection lifecycle and the screenshot fallback chain

use crate::config::CaptureOptions;
use crate::consumer::{ConsumerExit, FrameConsumer};
use crate::decoder::{EnvironmentValidator, FfmpegDecoder, StillImageDecoder};
use crate::frames::SessionFrames;
use crate::idle::IdleSupervisor;
use crate::{CaptureError, CaptureResult};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use devcap_core::{FrameSource, SessionState, VideoResolution};
use devcap_protocol::{with_parameter_sets, DeviceTransport, PacketReader, ProtocolError, VideoSession};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where the time of one capture went
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureTimings {
    pub connect: Duration,
    pub keyframe_wait: Duration,
    pub decode: Duration,
    pub total: Duration,
}

/// A decoded still image
#[derive(Debug, Clone)]
pub struct Screenshot {
    pub png: Bytes,
    pub source: FrameSource,
    pub captured_at: DateTime<Utc>,
    pub timings: CaptureTimings,
}

/// Captures still images from a device's video stream.
///
/// One manager owns at most one live streaming session. The session is
/// opened lazily by the first capture and closed again on error, on idle
/// timeout or on [`disconnect`](CaptureManager::disconnect).
#[derive(Clone)]
pub struct CaptureManager {
    inner: Arc<ManagerInner>,
}

impl CaptureManager {
    /// Create a manager decoding through ffmpeg
    pub fn new(transport: Arc<dyn DeviceTransport>, options: CaptureOptions) -> Self {
        let decoder = Arc::new(FfmpegDecoder::from_options(&options));
        Self::with_decoder(transport, decoder, options)
    }

    pub fn with_decoder(
        transport: Arc<dyn DeviceTransport>,
        decoder: Arc<dyn StillImageDecoder>,
        options: CaptureOptions,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        let idle = IdleSupervisor::new(options.idle_timeout);

        CaptureManager {
            inner: Arc::new(ManagerInner {
                transport,
                decoder,
                options,
                state,
                slot: Mutex::new(SessionSlot::default()),
                idle,
                validator: EnvironmentValidator::new(),
            }),
        }
    }

    pub fn options(&self) -> &CaptureOptions {
        &self.inner.options
    }

    /// Check once that the still-image decoder can run
    pub async fn validate_environment(&self) -> CaptureResult<()> {
        self.inner.validate_environment().await
    }

    /// Connect unless a session is already live
    pub async fn ensure_connected(&self) -> CaptureResult<()> {
        self.inner.ensure_connected().await
    }

    /// Capture the freshest available frame as PNG, with its provenance
    pub async fn capture_screenshot(&self) -> CaptureResult<Screenshot> {
        self.inner.capture_screenshot().await
    }

    pub async fn get_screenshot_png(&self) -> CaptureResult<Bytes> {
        Ok(self.capture_screenshot().await?.png)
    }

    /// Resolution announced by the live session
    pub fn get_resolution(&self) -> Option<VideoResolution> {
        self.inner.slot.lock().active.as_ref().map(|active| active.resolution)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Frame state of the live session
    pub fn session_frames(&self) -> Option<Arc<SessionFrames>> {
        self.inner
            .slot
            .lock()
            .active
            .as_ref()
            .map(|active| Arc::clone(&active.frames))
    }

    /// Close the live session, if any. Never fails.
    pub async fn disconnect(&self) {
        self.inner.teardown(None, "disconnect requested").await;
    }
}

#[derive(Default)]
struct SessionSlot {
    /// Bumped by every claim and every teardown
    generation: u64,
    active: Option<ActiveSession>,
}

struct ActiveSession {
    generation: u64,
    handle: Box<dyn VideoSession>,
    resolution: VideoResolution,
    frames: Arc<SessionFrames>,
    reader_cancel: CancellationToken,
    consumer: JoinHandle<()>,
}

impl ActiveSession {
    async fn shutdown(mut self) {
        self.frames.close();
        self.reader_cancel.cancel();

        if let Err(e) = self.consumer.await {
            if !e.is_cancelled() {
                warn!("Frame consumer task failed: {}", e);
            }
        }

        if let Err(e) = self.handle.close().await {
            warn!("Failed to close video session {}: {}", self.generation, e);
        }
        debug!("Video session {} closed", self.generation);
    }
}

struct ManagerInner {
    transport: Arc<dyn DeviceTransport>,
    decoder: Arc<dyn StillImageDecoder>,
    options: CaptureOptions,
    state: watch::Sender<SessionState>,
    slot: Mutex<SessionSlot>,
    idle: IdleSupervisor,
    validator: EnvironmentValidator,
}

/// Owns the Connecting claim until the attempt returns.
///
/// A superseded attempt keeps the claim until it has closed its session, so
/// no second negotiation can start alongside it.
struct ConnectAttempt<'a> {
    inner: &'a ManagerInner,
    generation: u64,
    completed: bool,
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        let slot = self.inner.slot.lock();
        if slot.active.is_none() {
            self.inner.state.send_replace(SessionState::Disconnected);
            debug!("Connection attempt {} released", self.generation);
        }
    }
}

impl ManagerInner {
    async fn validate_environment(&self) -> CaptureResult<()> {
        self.validator.validate(self.decoder.as_ref()).await
    }

    async fn ensure_connected(self: &Arc<Self>) -> CaptureResult<()> {
        loop {
            let state = *self.state.borrow();
            match state {
                SessionState::Connected => {
                    self.reset_idle_timer();
                    return Ok(());
                }
                SessionState::Connecting => return self.wait_for_inflight().await,
                SessionState::Disconnected => {
                    if let Some(generation) = self.try_claim() {
                        return self.connect(generation).await;
                    }
                    // Lost the race for the claim, look at the new state
                }
            }
        }
    }

    fn try_claim(&self) -> Option<u64> {
        let mut slot = self.slot.lock();
        let claimed = self.state.send_if_modified(|state| {
            if *state == SessionState::Disconnected {
                *state = SessionState::Connecting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return None;
        }
        slot.generation += 1;
        Some(slot.generation)
    }

    async fn wait_for_inflight(self: &Arc<Self>) -> CaptureResult<()> {
        let grace = self.options.timeouts.connect_grace;
        debug!("Connection already in progress, waiting up to {:?}", grace);

        let mut receiver = self.state.subscribe();
        let outcome = tokio::time::timeout(
            grace,
            receiver.wait_for(|state| *state != SessionState::Connecting),
        )
        .await;

        let settled = match outcome {
            Ok(Ok(state)) => *state,
            Ok(Err(_)) => SessionState::Disconnected,
            Err(_) => return Err(CaptureError::ConnectInProgress),
        };

        match settled {
            SessionState::Connected => {
                self.reset_idle_timer();
                Ok(())
            }
            _ => Err(CaptureError::ConnectInProgress),
        }
    }

    async fn connect(self: &Arc<Self>, generation: u64) -> CaptureResult<()> {
        let mut attempt = ConnectAttempt {
            inner: self,
            generation,
            completed: false,
        };
        let started = Instant::now();
        let request = self.options.stream_request();

        info!(
            "Connecting video stream (codec={}, max_size={}, bit_rate={})",
            request.codec, request.max_size, request.video_bit_rate
        );

        self.transport.push_server(&self.options.server_path).await?;
        let mut handle = self.transport.start_session(&request).await?;

        let stream = match handle.video_stream().await {
            Ok(Some(stream)) => stream,
            Ok(None) => {
                close_quietly(handle).await;
                return Err(ProtocolError::StreamUnavailable.into());
            }
            Err(e) => {
                close_quietly(handle).await;
                return Err(e.into());
            }
        };

        let resolution = stream.metadata.resolution();
        let frames = Arc::new(SessionFrames::new(request.codec));
        let reader_cancel = CancellationToken::new();

        let rejected = {
            let mut slot = self.slot.lock();
            if slot.generation != generation {
                Some(handle)
            } else {
                let consumer = self.spawn_consumer(
                    generation,
                    Arc::clone(&frames),
                    stream.reader,
                    reader_cancel.clone(),
                );
                slot.active = Some(ActiveSession {
                    generation,
                    handle,
                    resolution,
                    frames,
                    reader_cancel,
                    consumer,
                });
                self.state.send_replace(SessionState::Connected);
                None
            }
        };

        if let Some(handle) = rejected {
            info!("Connection attempt {} superseded by disconnect", generation);
            close_quietly(handle).await;
            return Err(CaptureError::Connection(
                "connection attempt superseded by disconnect".to_string(),
            ));
        }

        attempt.completed = true;
        self.reset_idle_timer();
        info!(
            "Video stream connected at {} in {:?}",
            resolution,
            started.elapsed()
        );
        Ok(())
    }

    fn spawn_consumer(
        self: &Arc<Self>,
        generation: u64,
        frames: Arc<SessionFrames>,
        reader: Box<dyn PacketReader>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager: Weak<ManagerInner> = Arc::downgrade(self);

        tokio::spawn(async move {
            let exit = FrameConsumer::new(frames).run(reader, cancel).await;
            let reason = match exit {
                ConsumerExit::Cancelled => return,
                ConsumerExit::Ended => "video stream ended",
                ConsumerExit::Failed(_) => "video stream failed",
            };

            // Teardown joins this task, so it has to run on its own
            if let Some(manager) = manager.upgrade() {
                tokio::spawn(async move {
                    manager.teardown(Some(generation), reason).await;
                });
            }
        })
    }

    fn reset_idle_timer(self: &Arc<Self>) {
        if !self.idle.is_enabled() {
            return;
        }
        let Some(generation) = self.slot.lock().active.as_ref().map(|active| active.generation) else {
            return;
        };

        let manager = Arc::downgrade(self);
        self.idle.reset(move || async move {
            if let Some(manager) = manager.upgrade() {
                manager.teardown(Some(generation), "idle timeout").await;
            }
        });
    }

    /// Tear the session down.
    ///
    /// With `expected` set, only that session generation is torn down; a
    /// newer session is left alone.
    async fn teardown(&self, expected: Option<u64>, reason: &str) {
        let taken = {
            let mut slot = self.slot.lock();
            if let Some(generation) = expected {
                let current = slot.active.as_ref().map(|active| active.generation);
                if current != Some(generation) {
                    debug!("Skipping teardown of stale session {} ({})", generation, reason);
                    return;
                }
            }
            slot.generation += 1;
            let active = slot.active.take();
            // An in-flight attempt is only invalidated; it releases its own claim
            if active.is_some() {
                self.state.send_replace(SessionState::Disconnected);
            }
            active
        };

        self.idle.cancel();

        match taken {
            Some(active) => {
                info!("Disconnecting video session {}: {}", active.generation, reason);
                active.shutdown().await;
            }
            None => debug!("No active video session to disconnect ({})", reason),
        }
    }

    async fn capture_screenshot(self: &Arc<Self>) -> CaptureResult<Screenshot> {
        let timeouts = &self.options.timeouts;
        let started = Instant::now();

        self.validate_environment().await?;
        self.ensure_connected().await?;
        let connect = started.elapsed();

        let frames = self
            .slot
            .lock()
            .active
            .as_ref()
            .map(|active| Arc::clone(&active.frames))
            .ok_or(CaptureError::NotConnected)?;

        let wait_started = Instant::now();
        let header = frames.wait_for_parameter_sets(timeouts.first_keyframe).await?;

        let (frame, source) = match frames
            .waiters()
            .wait_for_next_keyframe(timeouts.fresh_keyframe)
            .await
        {
            Ok(frame) => (frame, FrameSource::Fresh),
            Err(CaptureError::KeyframeTimeout { .. }) => match frames.cached_keyframe() {
                Some(cached) => {
                    debug!(
                        "No fresh keyframe within {:?}, using cached keyframe ({:?} old)",
                        timeouts.fresh_keyframe,
                        cached.age()
                    );
                    (with_parameter_sets(&header, &cached.data), FrameSource::Cached)
                }
                None => {
                    debug!(
                        "No fresh or cached keyframe, waiting up to {:?}",
                        timeouts.fallback_keyframe
                    );
                    let frame = frames
                        .waiters()
                        .wait_for_next_keyframe(timeouts.fallback_keyframe)
                        .await?;
                    (frame, FrameSource::FreshRetry)
                }
            },
            Err(e) => return Err(e),
        };
        let keyframe_wait = wait_started.elapsed();
        let captured_at = Utc::now();

        self.reset_idle_timer();

        let decode_started = Instant::now();
        let png = Bytes::from(self.decoder.decode(frame).await?);

        let timings = CaptureTimings {
            connect,
            keyframe_wait,
            decode: decode_started.elapsed(),
            total: started.elapsed(),
        };
        debug!(
            "Screenshot captured: source={}, {} bytes, connect={:?}, keyframe_wait={:?}, decode={:?}, total={:?}",
            source,
            png.len(),
            timings.connect,
            timings.keyframe_wait,
            timings.decode,
            timings.total
        );

        Ok(Screenshot {
            png,
            source,
            captured_at,
            timings,
        })
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        if let Some(active) = self.slot.get_mut().active.take() {
            warn!("Capture manager dropped with live video session {}", active.generation);
            active.reader_cancel.cancel();
        }
    }
}

async fn close_quietly(mut handle: Box<dyn VideoSession>) {
    if let Err(e) = handle.close().await {
        warn!("Failed to close video session: {}", e);
    }
}
