//! Screen capture pipeline.
//!
//! A single loop, independent of connection count, that repeatedly:
//!
//! 1. captures an image via the [`ScreenSource`] collaborator,
//! 2. encodes it as JPEG at a configurable quality factor,
//! 3. publishes it into the latest-frame slot, and
//! 4. self-tunes its target rate from encode time + consumer pull gap.
//!
//! The slot is overwrite-on-publish: slow consumers see frame drops,
//! never backlog. The loop checks its stop flag once per cycle, so a
//! stop request may be delayed by up to one frame interval.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::config::CaptureConfig;
use crate::platform::{RawImage, ScreenSource};
use visor_core::VisorError;

// ── RateController ───────────────────────────────────────────────

/// Adaptive frame-rate state, clamped to `[min, max]` at all times.
///
/// Auto-adjust policy: when the busy time of a cycle (encode duration
/// plus the gap since the previous consumer pull) exceeds 80% of the
/// frame interval, the target drops by one; under 40%, it rises by
/// one. Setting an explicit target disables auto-adjust until
/// re-enabled.
#[derive(Debug)]
pub struct RateController {
    fps: AtomicU32,
    auto: AtomicBool,
    min: u32,
    max: u32,
}

impl RateController {
    pub fn new(min: u32, max: u32, initial: u32, auto: bool) -> Self {
        let min = min.max(1);
        let max = max.max(min);
        Self {
            fps: AtomicU32::new(initial.clamp(min, max)),
            auto: AtomicBool::new(auto),
            min,
            max,
        }
    }

    /// Current target rate in frames per second.
    pub fn current(&self) -> u32 {
        self.fps.load(Ordering::Relaxed)
    }

    /// Frame interval at the current target rate.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(1000 / self.current() as u64)
    }

    /// Manual override; disables auto-adjust.
    pub fn set_target(&self, fps: u32) {
        self.fps.store(fps.clamp(self.min, self.max), Ordering::Relaxed);
        self.auto.store(false, Ordering::Relaxed);
    }

    /// Enable or disable auto-adjustment.
    pub fn set_auto(&self, enable: bool) {
        self.auto.store(enable, Ordering::Relaxed);
    }

    pub fn auto_enabled(&self) -> bool {
        self.auto.load(Ordering::Relaxed)
    }

    /// Feed one cycle's busy time into the controller.
    pub fn observe(&self, busy: Duration) {
        if !self.auto_enabled() {
            return;
        }
        let fps = self.current();
        let interval_ms = 1000 / fps as u64;
        let busy_ms = busy.as_millis() as u64;

        if busy_ms * 10 > interval_ms * 8 {
            self.fps
                .store(fps.saturating_sub(1).max(self.min), Ordering::Relaxed);
        } else if busy_ms * 10 < interval_ms * 4 && fps < self.max {
            self.fps.store(fps + 1, Ordering::Relaxed);
        }
    }
}

// ── FrameSlot ────────────────────────────────────────────────────

/// The most recently encoded screen image.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: Bytes,
    /// When the encode finished, relative to pipeline start.
    pub encoded_at: Duration,
}

/// Single-slot, overwrite-on-publish frame buffer.
///
/// One writer (the pipeline), many readers (session pushers). Readers
/// clone an `Arc` out under a read guard — they may see the same
/// frame twice or skip frames; publish is a pointer replace. The slot
/// also tracks the gap between consumer pulls, which feeds the rate
/// controller.
#[derive(Debug)]
struct FrameSlot {
    latest: RwLock<Option<Arc<EncodedFrame>>>,
    /// Millis since pipeline start at the last pull; 0 = never pulled.
    last_pull_ms: AtomicU64,
    /// Gap between the last two pulls, in millis.
    pull_gap_ms: AtomicU64,
    epoch: Instant,
}

impl FrameSlot {
    fn new(epoch: Instant) -> Self {
        Self {
            latest: RwLock::new(None),
            last_pull_ms: AtomicU64::new(0),
            pull_gap_ms: AtomicU64::new(0),
            epoch,
        }
    }

    fn publish(&self, frame: EncodedFrame) {
        *self.latest.write().expect("frame slot lock poisoned") = Some(Arc::new(frame));
    }

    fn pull(&self) -> Option<Arc<EncodedFrame>> {
        let now = self.epoch.elapsed().as_millis() as u64;
        let last = self.last_pull_ms.swap(now, Ordering::Relaxed);
        if last > 0 {
            // Concurrent pulls can interleave, leaving `last` ahead
            // of `now`; treat that as a zero gap rather than wrapping.
            self.pull_gap_ms
                .store(now.saturating_sub(last), Ordering::Relaxed);
        }
        self.latest.read().expect("frame slot lock poisoned").clone()
    }

    fn pull_gap(&self) -> Duration {
        Duration::from_millis(self.pull_gap_ms.load(Ordering::Relaxed))
    }
}

// ── CapturePipeline ──────────────────────────────────────────────

/// The continuously-running capture/encode pipeline.
///
/// # Lifetime
///
/// Spawn [`run`](Self::run) on the runtime; call
/// [`stop`](Self::stop) (or flip the [`stop_handle`](Self::stop_handle))
/// to end it. Capture or encode failures skip the cycle and are
/// retried next interval; they never stop the pipeline.
pub struct CapturePipeline {
    source: Arc<dyn ScreenSource>,
    slot: FrameSlot,
    rate: RateController,
    /// JPEG quality as a 1–100 percentage.
    quality_pct: AtomicU32,
    running: Arc<AtomicBool>,
}

impl CapturePipeline {
    pub fn new(source: Arc<dyn ScreenSource>, config: &CaptureConfig) -> Self {
        Self {
            source,
            slot: FrameSlot::new(Instant::now()),
            rate: RateController::new(
                config.min_fps,
                config.max_fps,
                config.default_fps,
                config.auto_adjust,
            ),
            quality_pct: AtomicU32::new(quality_to_pct(config.quality)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cloneable handle for stopping the loop from another task.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Current target rate, for session pushers pacing themselves.
    pub fn current_fps(&self) -> u32 {
        self.rate.current()
    }

    /// Manual rate override (disables auto-adjust).
    pub fn set_target_fps(&self, fps: u32) {
        self.rate.set_target(fps);
    }

    /// Re-enable (or disable) rate auto-adjustment.
    pub fn set_auto_adjust(&self, enable: bool) {
        self.rate.set_auto(enable);
    }

    pub fn auto_adjust_enabled(&self) -> bool {
        self.rate.auto_enabled()
    }

    /// Change the JPEG quality factor (0.0–1.0) for subsequent frames.
    pub fn set_quality(&self, quality: f32) {
        self.quality_pct
            .store(quality_to_pct(quality), Ordering::Relaxed);
    }

    /// Latest published frame, if any. Also records the consumer pull
    /// gap used by the adaptive policy.
    pub fn latest_frame(&self) -> Option<Arc<EncodedFrame>> {
        self.slot.pull()
    }

    /// Run the capture loop until stopped.
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        let mut last_capture = Instant::now();

        while self.running.load(Ordering::SeqCst) {
            let interval = self.rate.interval();

            match self.cycle() {
                Ok(encode_time) => {
                    self.rate.observe(encode_time + self.slot.pull_gap());
                }
                Err(e) => {
                    // Skip this cycle; retry next interval.
                    warn!("capture cycle failed: {e}");
                }
            }

            let elapsed = last_capture.elapsed();
            if elapsed < interval {
                tokio::time::sleep(interval - elapsed).await;
            }
            last_capture = Instant::now();
        }
        debug!("capture pipeline stopped");
    }

    /// One capture→encode→publish cycle. Returns the encode duration.
    fn cycle(&self) -> Result<Duration, VisorError> {
        let raw = self.source.capture()?;
        let started = Instant::now();
        let quality = self.quality_pct.load(Ordering::Relaxed) as u8;
        let data = encode_jpeg(&raw, quality)?;
        let encode_time = started.elapsed();

        self.slot.publish(EncodedFrame {
            data,
            encoded_at: self.slot.epoch.elapsed(),
        });
        Ok(encode_time)
    }
}

fn quality_to_pct(quality: f32) -> u32 {
    (quality.clamp(0.01, 1.0) * 100.0).round() as u32
}

/// Encode a raw RGB image as JPEG at the given quality percentage.
fn encode_jpeg(raw: &RawImage, quality_pct: u8) -> Result<Bytes, VisorError> {
    if raw.rgb.len() != raw.expected_len() {
        return Err(VisorError::Capture(format!(
            "image buffer is {} bytes, expected {} for {}x{}",
            raw.rgb.len(),
            raw.expected_len(),
            raw.width,
            raw.height,
        )));
    }

    let mut buf = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality_pct);
    encoder
        .encode(&raw.rgb, raw.width, raw.height, image::ColorType::Rgb8)
        .map_err(|e| VisorError::Encode(e.to_string()))?;
    Ok(Bytes::from(buf))
}

// ── Tests ────────────────────────────────────────────────────────
