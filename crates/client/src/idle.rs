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

//! Idle disconnect timer

use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Fires a callback once no capture has happened for `timeout`.
///
/// Every [`reset`](IdleSupervisor::reset) restarts the countdown. A zero
/// timeout disables the supervisor.
pub struct IdleSupervisor {
    timeout: Duration,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl IdleSupervisor {
    pub fn new(timeout: Duration) -> Self {
        IdleSupervisor {
            timeout,
            timer: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.timeout.is_zero()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Restart the countdown, replacing any pending one
    pub fn reset<F, Fut>(&self, on_idle: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if !self.is_enabled() {
            return;
        }

        let timeout = self.timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            info!("No capture for {:?}, disconnecting idle session", timeout);
            // Detached so cancelling this timer cannot interrupt the callback
            tokio::spawn(on_idle());
        });

        if let Some(previous) = self.timer.lock().replace(timer) {
            previous.abort();
        }
    }

    /// Stop the countdown without firing
    pub fn cancel(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
            debug!("Idle timer cancelled");
        }
    }

    pub fn is_armed(&self) -> bool {
        self.timer
            .lock()
            .as_ref()
            .map_or(false, |timer| !timer.is_finished())
    }
}

impl Drop for IdleSupervisor {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.get_mut().take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter_callback(count: &Arc<AtomicUsize>) -> impl FnOnce() -> std::future::Ready<()> + Send + 'static {
        let count = Arc::clone(count);
        move || {
            count.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test]
    async fn test_fires_after_timeout() {
        let fired = Arc::new(AtomicUsize::new(0));
        let idle = IdleSupervisor::new(Duration::from_millis(30));

        idle.reset(counter_callback(&fired));
        assert!(idle.is_armed());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!idle.is_armed());
    }

    #[tokio::test]
    async fn test_reset_restarts_countdown() {
        let fired = Arc::new(AtomicUsize::new(0));
        let idle = IdleSupervisor::new(Duration::from_millis(80));

        idle.reset(counter_callback(&fired));
        tokio::time::sleep(Duration::from_millis(40)).await;
        idle.reset(counter_callback(&fired));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_prevents_firing() {
        let fired = Arc::new(AtomicUsize::new(0));
        let idle = IdleSupervisor::new(Duration::from_millis(20));

        idle.reset(counter_callback(&fired));
        idle.cancel();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!idle.is_armed());
    }

    #[tokio::test]
    async fn test_zero_timeout_disables() {
        let fired = Arc::new(AtomicUsize::new(0));
        let idle = IdleSupervisor::new(Duration::ZERO);

        idle.reset(counter_callback(&fired));
        assert!(!idle.is_enabled());
        assert!(!idle.is_armed());
    }
}
