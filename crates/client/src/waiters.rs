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

//! Pending keyframe waiters
//!
//! A capture that needs a fresh keyframe registers here. The stream consumer
//! fulfils every pending waiter with the next keyframe it sees.

use crate::{CaptureError, CaptureResult};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Default)]
struct RegistryState {
    next_id: u64,
    pending: HashMap<u64, oneshot::Sender<Bytes>>,
    closed: bool,
}

/// Registry of callers waiting for the next keyframe
#[derive(Clone, Default)]
pub struct FrameWaitRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl FrameWaitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for the next keyframe.
    ///
    /// The waiter is removed again when it resolves, times out or is dropped.
    pub fn register(&self) -> KeyframeWaiter {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();

        let id = state.next_id;
        state.next_id += 1;
        // A closed registry drops the sender at once so the waiter fails fast
        if !state.closed {
            state.pending.insert(id, tx);
        }

        KeyframeWaiter {
            id,
            receiver: rx,
            registry: Arc::clone(&self.state),
        }
    }

    /// Register and wait for the next keyframe
    pub async fn wait_for_next_keyframe(&self, timeout: Duration) -> CaptureResult<Bytes> {
        self.register().wait(timeout).await
    }

    pub fn has_waiters(&self) -> bool {
        !self.state.lock().pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hand `frame` to every pending waiter and clear the set.
    ///
    /// Returns the number of waiters that received it.
    pub fn fulfill(&self, frame: Bytes) -> usize {
        let pending = std::mem::take(&mut self.state.lock().pending);
        let mut delivered = 0;
        for (_, sender) in pending {
            if sender.send(frame.clone()).is_ok() {
                delivered += 1;
            }
        }
        if delivered > 0 {
            debug!("Delivered keyframe ({} bytes) to {} waiter(s)", frame.len(), delivered);
        }
        delivered
    }

    /// Fail every pending waiter and refuse new ones
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        let dropped = state.pending.len();
        state.pending.clear();
        if dropped > 0 {
            debug!("Closed frame wait registry with {} pending waiter(s)", dropped);
        }
    }
}

/// A single registration for the next keyframe
pub struct KeyframeWaiter {
    id: u64,
    receiver: oneshot::Receiver<Bytes>,
    registry: Arc<Mutex<RegistryState>>,
}

impl KeyframeWaiter {
    /// Wait until the keyframe arrives or `timeout` passes
    pub async fn wait(mut self, timeout: Duration) -> CaptureResult<Bytes> {
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(CaptureError::StreamClosed),
            Err(_) => Err(CaptureError::KeyframeTimeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

impl Drop for KeyframeWaiter {
    fn drop(&mut self) {
        self.registry.lock().pending.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fulfill_wakes_all_waiters() {
        let registry = FrameWaitRegistry::new();
        let first = registry.register();
        let second = registry.register();
        assert_eq!(registry.len(), 2);

        let frame = Bytes::from_static(&[0, 0, 0, 1, 0x26]);
        assert_eq!(registry.fulfill(frame.clone()), 2);
        assert!(!registry.has_waiters());

        assert_eq!(first.wait(Duration::from_millis(50)).await.unwrap(), frame);
        assert_eq!(second.wait(Duration::from_millis(50)).await.unwrap(), frame);
    }

    #[tokio::test]
    async fn test_timeout_deregisters() {
        let registry = FrameWaitRegistry::new();
        let result = registry.wait_for_next_keyframe(Duration::from_millis(10)).await;

        assert!(matches!(result, Err(CaptureError::KeyframeTimeout { timeout_ms: 10 })));
        assert!(!registry.has_waiters());
        assert_eq!(registry.fulfill(Bytes::from_static(&[1])), 0);
    }

    #[tokio::test]
    async fn test_dropped_waiter_is_removed() {
        let registry = FrameWaitRegistry::new();
        let waiter = registry.register();
        assert!(registry.has_waiters());

        drop(waiter);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_new_waiters() {
        let registry = FrameWaitRegistry::new();
        let pending = registry.register();

        registry.close();

        assert!(matches!(
            pending.wait(Duration::from_secs(1)).await,
            Err(CaptureError::StreamClosed)
        ));
        assert!(matches!(
            registry.wait_for_next_keyframe(Duration::from_secs(1)).await,
            Err(CaptureError::StreamClosed)
        ));
    }

    #[tokio::test]
    async fn test_waiter_resolves_from_another_task() {
        let registry = FrameWaitRegistry::new();
        let waiter = registry.register();

        let producer = registry.clone();
        tokio::spawn(async move {
            producer.fulfill(Bytes::from_static(&[7, 7]));
        });

        assert_eq!(
            waiter.wait(Duration::from_secs(1)).await.unwrap(),
            Bytes::from_static(&[7, 7])
        );
    }
}
