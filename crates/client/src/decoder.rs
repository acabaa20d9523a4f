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

//! Still-image decoding through an external ffmpeg process

use crate::config::CaptureOptions;
use crate::{CaptureError, CaptureResult};
use async_trait::async_trait;
use bytes::Bytes;
use devcap_core::VideoCodec;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Environment variable that overrides the ffmpeg location
pub const FFMPEG_ENV: &str = "DEVCAP_FFMPEG";

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// Turns a single keyframe into a PNG image
#[async_trait]
pub trait StillImageDecoder: Send + Sync {
    /// Check that the decoder can run at all
    async fn probe(&self) -> CaptureResult<()>;

    /// Decode one parameter-set-prefixed keyframe to PNG bytes
    async fn decode(&self, frame: Bytes) -> CaptureResult<Vec<u8>>;
}

/// ffmpeg-backed decoder, one short-lived process per frame
#[derive(Debug, Clone)]
pub struct FfmpegDecoder {
    program: PathBuf,
    codec: VideoCodec,
    probe_timeout: Duration,
}

impl FfmpegDecoder {
    pub fn new(program: impl Into<PathBuf>, codec: VideoCodec) -> Self {
        FfmpegDecoder {
            program: program.into(),
            codec,
            probe_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn from_options(options: &CaptureOptions) -> Self {
        Self::new(Self::locate(options.ffmpeg_path.as_deref()), options.codec)
            .with_probe_timeout(options.timeouts.decoder_probe)
    }

    /// Resolve the ffmpeg executable.
    ///
    /// Order: explicit path, `DEVCAP_FFMPEG`, `PATH` lookup, bare `ffmpeg`.
    pub fn locate(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        if let Some(path) = std::env::var_os(FFMPEG_ENV).filter(|value| !value.is_empty()) {
            debug!("Using ffmpeg from {}", FFMPEG_ENV);
            return PathBuf::from(path);
        }
        match which::which("ffmpeg") {
            Ok(path) => path,
            Err(_) => PathBuf::from("ffmpeg"),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn decode_args(&self) -> Vec<&'static str> {
        vec![
            "-f",
            self.codec.ffmpeg_format(),
            "-i",
            "pipe:0",
            "-vframes",
            "1",
            "-f",
            "image2pipe",
            "-vcodec",
            "png",
            "-loglevel",
            "error",
            "pipe:1",
        ]
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);

        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        cmd
    }

    fn unavailable(&self, e: std::io::Error) -> CaptureError {
        CaptureError::DecoderUnavailable(format!("Failed to run {}: {}", self.program.display(), e))
    }
}

#[async_trait]
impl StillImageDecoder for FfmpegDecoder {
    async fn probe(&self) -> CaptureResult<()> {
        let mut cmd = self.command();
        cmd.kill_on_drop(true);
        cmd.arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = match tokio::time::timeout(self.probe_timeout, cmd.output()).await {
            Ok(result) => result.map_err(|e| self.unavailable(e))?,
            Err(_) => {
                return Err(CaptureError::DecoderUnavailable(format!(
                    "{} -version did not finish within {:?}",
                    self.program.display(),
                    self.probe_timeout
                )))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CaptureError::DecoderUnavailable(format!(
                "{} -version exited with {}: {}",
                self.program.display(),
                output.status,
                stderr.trim()
            )));
        }

        let version = String::from_utf8_lossy(&output.stdout);
        info!(
            "Found decoder: {}",
            version.lines().next().unwrap_or_default().trim()
        );
        Ok(())
    }

    /// Runs on its own task, so a dropped caller never cuts a decode short
    async fn decode(&self, frame: Bytes) -> CaptureResult<Vec<u8>> {
        let decoder = self.clone();
        tokio::spawn(async move { decoder.run_decode(frame).await })
            .await
            .map_err(|e| CaptureError::Decode(format!("decode task failed: {}", e)))?
    }
}

impl FfmpegDecoder {
    async fn run_decode(&self, frame: Bytes) -> CaptureResult<Vec<u8>> {
        let mut cmd = self.command();
        cmd.args(self.decode_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| self.unavailable(e))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| CaptureError::Decode("decoder stdin is not available".to_string()))?;

        let input_len = frame.len();
        let writer = tokio::spawn(async move {
            stdin.write_all(&frame).await?;
            stdin.shutdown().await
        });

        let output = child.wait_with_output().await?;

        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Decoder closed its input early: {}", e),
            Err(e) => warn!("Decoder input task failed: {}", e),
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CaptureError::Decode(format!(
                "ffmpeg exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        if !output.stdout.starts_with(&PNG_SIGNATURE) {
            return Err(CaptureError::Decode(format!(
                "decoder produced no PNG image ({} bytes)",
                output.stdout.len()
            )));
        }

        debug!("Decoded {} byte frame into {} byte PNG", input_len, output.stdout.len());
        Ok(output.stdout)
    }
}

/// Remembers the outcome of the first decoder probe.
///
/// Concurrent callers share one probe; a failure is reported again on every
/// later call without re-probing.
#[derive(Default)]
pub struct EnvironmentValidator {
    outcome: OnceCell<Result<(), String>>,
}

impl EnvironmentValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn validate(&self, decoder: &dyn StillImageDecoder) -> CaptureResult<()> {
        let outcome = self
            .outcome
            .get_or_init(|| async {
                match decoder.probe().await {
                    Ok(()) => Ok(()),
                    Err(CaptureError::DecoderUnavailable(reason)) => {
                        warn!("Still image decoder unavailable: {}", reason);
                        Err(reason)
                    }
                    Err(e) => {
                        warn!("Still image decoder probe failed: {}", e);
                        Err(e.to_string())
                    }
                }
            })
            .await;

        outcome.clone().map_err(CaptureError::DecoderUnavailable)
    }

    /// Cached outcome, `None` before the first probe
    pub fn cached(&self) -> Option<bool> {
        self.outcome.get().map(|outcome| outcome.is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDecoder {
        probes: AtomicUsize,
        healthy: bool,
    }

    #[async_trait]
    impl StillImageDecoder for CountingDecoder {
        async fn probe(&self) -> CaptureResult<()> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.healthy {
                Ok(())
            } else {
                Err(CaptureError::DecoderUnavailable("ffmpeg not found".to_string()))
            }
        }

        async fn decode(&self, frame: Bytes) -> CaptureResult<Vec<u8>> {
            Ok(frame.to_vec())
        }
    }

    #[test]
    fn test_decode_args_follow_codec() {
        let hevc = FfmpegDecoder::new("ffmpeg", VideoCodec::H265);
        let avc = FfmpegDecoder::new("ffmpeg", VideoCodec::H264);

        assert_eq!(&hevc.decode_args()[..4], &["-f", "hevc", "-i", "pipe:0"]);
        assert_eq!(avc.decode_args()[1], "h264");
        assert_eq!(hevc.decode_args().last(), Some(&"pipe:1"));
    }

    #[test]
    fn test_locate_prefers_explicit_path() {
        let path = FfmpegDecoder::locate(Some(Path::new("/opt/ffmpeg/bin/ffmpeg")));
        assert_eq!(path, PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));
    }

    #[tokio::test]
    async fn test_validator_probes_once() {
        let decoder = CountingDecoder {
            probes: AtomicUsize::new(0),
            healthy: true,
        };
        let validator = EnvironmentValidator::new();
        assert_eq!(validator.cached(), None);

        validator.validate(&decoder).await.unwrap();
        validator.validate(&decoder).await.unwrap();

        assert_eq!(decoder.probes.load(Ordering::SeqCst), 1);
        assert_eq!(validator.cached(), Some(true));
    }

    #[tokio::test]
    async fn test_validator_rethrows_cached_failure() {
        let decoder = CountingDecoder {
            probes: AtomicUsize::new(0),
            healthy: false,
        };
        let validator = EnvironmentValidator::new();

        for _ in 0..2 {
            let err = validator.validate(&decoder).await.unwrap_err();
            assert!(matches!(err, CaptureError::DecoderUnavailable(ref msg) if msg == "ffmpeg not found"));
            assert_eq!(err.to_string(), "Still image decoder is not available: ffmpeg not found");
        }
        assert_eq!(decoder.probes.load(Ordering::SeqCst), 1);
        assert_eq!(validator.cached(), Some(false));
    }

    #[tokio::test]
    async fn test_missing_program_is_unavailable() {
        let decoder = FfmpegDecoder::new("/nonexistent/devcap-ffmpeg", VideoCodec::H265);

        assert!(matches!(decoder.probe().await, Err(CaptureError::DecoderUnavailable(_))));
        assert!(matches!(
            decoder.decode(Bytes::from_static(&[0, 0, 0, 1])).await,
            Err(CaptureError::DecoderUnavailable(_))
        ));
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn script(dir: &tempfile::TempDir, body: &str) -> PathBuf {
            let path = dir.path().join("fake-ffmpeg");
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        #[tokio::test]
        async fn test_probe_and_decode_through_pipe() {
            let dir = tempfile::tempdir().unwrap();
            let program = script(
                &dir,
                r#"if [ "$1" = "-version" ]; then echo "ffmpeg version test"; exit 0; fi
cat"#,
            );
            let decoder = FfmpegDecoder::new(program, VideoCodec::H265);

            decoder.probe().await.unwrap();

            let mut png = PNG_SIGNATURE.to_vec();
            png.extend_from_slice(b"IHDR");
            let output = decoder.decode(Bytes::from(png.clone())).await.unwrap();
            assert_eq!(output, png);
        }

        #[tokio::test]
        async fn test_decoder_failure_reports_stderr() {
            let dir = tempfile::tempdir().unwrap();
            let program = script(&dir, "cat > /dev/null\necho 'Invalid data found' >&2\nexit 1");
            let decoder = FfmpegDecoder::new(program, VideoCodec::H265);

            let err = decoder.decode(Bytes::from_static(&[0, 0, 0, 1, 0x26])).await.unwrap_err();
            assert!(matches!(err, CaptureError::Decode(ref msg) if msg.contains("Invalid data found")));
        }

        #[tokio::test]
        async fn test_non_png_output_is_rejected() {
            let dir = tempfile::tempdir().unwrap();
            let program = script(&dir, "cat");
            let decoder = FfmpegDecoder::new(program, VideoCodec::H265);

            let err = decoder.decode(Bytes::from_static(b"not a png")).await.unwrap_err();
            assert!(matches!(err, CaptureError::Decode(_)));
        }

        #[tokio::test]
        async fn test_dropped_caller_lets_decode_finish() {
            let dir = tempfile::tempdir().unwrap();
            let marker = dir.path().join("finished");
            let program = script(
                &dir,
                &format!("cat > /dev/null\nsleep 0.2\nprintf done > '{}'", marker.display()),
            );
            let decoder = FfmpegDecoder::new(program, VideoCodec::H265);

            let abandoned =
                tokio::time::timeout(Duration::from_millis(50), decoder.decode(Bytes::from_static(&[0, 0, 1]))).await;
            assert!(abandoned.is_err());

            tokio::time::sleep(Duration::from_millis(800)).await;
            assert!(marker.exists(), "decoder process was killed with its caller");
        }

        #[tokio::test]
        async fn test_failed_probe() {
            let dir = tempfile::tempdir().unwrap();
            let program = script(&dir, "echo 'missing libs' >&2\nexit 127");
            let decoder = FfmpegDecoder::new(program, VideoCodec::H265);

            let err = decoder.probe().await.unwrap_err();
            assert!(matches!(err, CaptureError::DecoderUnavailable(ref msg) if msg.contains("missing libs")));
        }
    }
}
