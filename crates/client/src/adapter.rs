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

//! Device-facing capture adapter
//!
//! Resolves capture options from the device's display metrics, builds the
//! [`CaptureManager`] on first use and exposes screenshots as data URLs.

use crate::config::{CaptureConfigFile, CaptureOptions, DisplayMetrics};
use crate::decoder::StillImageDecoder;
use crate::manager::CaptureManager;
use crate::{CaptureError, CaptureResult};
use async_trait::async_trait;
use base64::Engine;
use devcap_core::VideoResolution;
use devcap_protocol::DeviceTransport;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Opens a transport to a device by id
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, device_id: &str) -> CaptureResult<Arc<dyn DeviceTransport>>;
}

/// Screen size as seen through the capture stream
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScreenSize {
    pub width: u32,
    pub height: u32,
    pub dpr: f64,
}

pub struct DeviceCaptureAdapter {
    device_id: String,
    connector: Arc<dyn TransportConnector>,
    config: CaptureConfigFile,
    resize_scale: Option<f64>,
    decoder: Option<Arc<dyn StillImageDecoder>>,
    resolved: Mutex<Option<CaptureOptions>>,
    manager: Mutex<Option<CaptureManager>>,
    init: tokio::sync::Mutex<()>,
}

impl DeviceCaptureAdapter {
    pub fn new(
        device_id: impl Into<String>,
        connector: Arc<dyn TransportConnector>,
        config: CaptureConfigFile,
        resize_scale: Option<f64>,
    ) -> Self {
        DeviceCaptureAdapter {
            device_id: device_id.into(),
            connector,
            config,
            resize_scale,
            decoder: None,
            resolved: Mutex::new(None),
            manager: Mutex::new(None),
            init: tokio::sync::Mutex::new(()),
        }
    }

    /// Decode with `decoder` instead of locating ffmpeg
    pub fn with_decoder(mut self, decoder: Arc<dyn StillImageDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn is_enabled(&self) -> bool {
        self.config.is_enabled()
    }

    /// Resolve options once per adapter lifetime
    pub fn resolve_config(&self, display: &DisplayMetrics) -> CaptureResult<CaptureOptions> {
        let mut resolved = self.resolved.lock();
        if let Some(options) = resolved.as_ref() {
            return Ok(options.clone());
        }
        let options = self.config.resolve(Some(display), self.resize_scale)?;
        *resolved = Some(options.clone());
        Ok(options)
    }

    /// Get the manager, connecting a transport on first use
    pub async fn ensure_manager(&self, display: &DisplayMetrics) -> CaptureResult<CaptureManager> {
        if let Some(manager) = self.manager.lock().clone() {
            return Ok(manager);
        }

        let _init = self.init.lock().await;
        if let Some(manager) = self.manager.lock().clone() {
            return Ok(manager);
        }

        if !self.is_enabled() {
            return Err(CaptureError::Config(format!(
                "Stream capture is disabled for device {}",
                self.device_id
            )));
        }

        debug!("Initializing capture manager for {}", self.device_id);
        let options = self.resolve_config(display)?;
        let transport = self.connector.connect(&self.device_id).await.map_err(|e| {
            CaptureError::Connection(format!(
                "Failed to initialize stream capture for device {}. \
                 Ensure the ADB server is running and the device is connected. Error: {}",
                self.device_id, e
            ))
        })?;

        let manager = match &self.decoder {
            Some(decoder) => CaptureManager::with_decoder(transport, Arc::clone(decoder), options),
            None => CaptureManager::new(transport, options),
        };
        *self.manager.lock() = Some(manager.clone());
        debug!("Capture manager initialized for {}", self.device_id);
        Ok(manager)
    }

    /// Capture a screenshot as a `data:image/png;base64,` URL
    pub async fn screenshot_base64(&self, display: &DisplayMetrics) -> CaptureResult<String> {
        let manager = self.ensure_manager(display).await?;
        let png = manager.get_screenshot_png().await?;
        Ok(format!(
            "data:image/png;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(&png)
        ))
    }

    /// Stream resolution, once connected
    pub fn resolution(&self) -> Option<VideoResolution> {
        self.manager.lock().as_ref()?.get_resolution()
    }

    pub fn size(&self, display: &DisplayMetrics) -> Option<ScreenSize> {
        let resolution = self.resolution()?;
        debug!("Using stream resolution {}", resolution);
        Some(ScreenSize {
            width: resolution.width,
            height: resolution.height,
            dpr: display.dpr,
        })
    }

    /// Ratio of stream width to physical screen width
    pub fn scaling_ratio(&self, physical_width: u32) -> Option<f64> {
        let resolution = self.resolution()?;
        if physical_width == 0 {
            return None;
        }
        Some(resolution.width as f64 / physical_width as f64)
    }

    /// Drop the manager and forget the resolved options
    pub async fn disconnect(&self) {
        let _init = self.init.lock().await;
        let manager = self.manager.lock().take();
        if let Some(manager) = manager {
            manager.disconnect().await;
        } else {
            debug!("Capture adapter for {} was not initialized", self.device_id);
        }
        self.resolved.lock().take();
    }
}
