//! Lokale Medien - Mikrofon Capture
//!
//! Verwendet cpal für Cross-Platform Audio Input. Der cpal-Stream ist nicht
//! `Send`, deshalb lebt er auf einem eigenen Capture-Thread; nach außen
//! sind nur die Track-Flags und der Pegel sichtbar.

use super::transport::TrackKind;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use thiserror::Error;
use tokio::sync::oneshot;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz, passend zu Opus)
pub const SAMPLE_RATE: u32 = 48000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),

    #[error("Capture thread failed: {0}")]
    CaptureThread(String),

    #[error("Media access denied: {0}")]
    Denied(String),
}

// ============================================================================
// TRAITS
// ============================================================================

/// Ein erworbener lokaler Medienstrom
///
/// Wird über Transport-Neuaufbauten hinweg wiederverwendet und erst beim
/// Call-Ende gestoppt.
pub trait LocalMedia: Send {
    fn tracks(&self) -> Vec<TrackKind>;

    fn is_audio_enabled(&self) -> bool;

    fn set_audio_enabled(&mut self, enabled: bool);

    fn is_video_enabled(&self) -> bool;

    fn set_video_enabled(&mut self, enabled: bool);

    fn stop(&mut self);
}

/// Quelle für lokale Medien (Kamera/Mikrofon)
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn LocalMedia>, MediaError>;
}

// ============================================================================
// DEVICE MEDIA (cpal)
// ============================================================================

#[derive(Debug)]
struct CaptureShared {
    audio_enabled: AtomicBool,
    input_level: Mutex<f32>,
}

/// Mikrofon-Capture über das Standard-Eingabegerät
#[derive(Debug, Default, Clone, Copy)]
pub struct DeviceMediaSource;

impl DeviceMediaSource {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaSource for DeviceMediaSource {
    async fn acquire(&self) -> Result<Box<dyn LocalMedia>, MediaError> {
        let shared = Arc::new(CaptureShared {
            audio_enabled: AtomicBool::new(true),
            input_level: Mutex::new(0.0),
        });

        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), MediaError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let thread_shared = Arc::clone(&shared);

        std::thread::Builder::new()
            .name("callcore-capture".to_string())
            .spawn(move || {
                let stream = match open_capture_stream(&thread_shared) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Blockiert bis stop() oder Drop des Senders
                let _ = stop_rx.recv();
                drop(stream);
                tracing::info!("Audio capture stopped");
            })
            .map_err(|e| MediaError::CaptureThread(e.to_string()))?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(Box::new(DeviceMedia {
                shared,
                video_enabled: true,
                stop_tx: Some(stop_tx),
            })),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(MediaError::CaptureThread(
                "capture thread exited before reporting".to_string(),
            )),
        }
    }
}

/// Laufender Mikrofon-Capture
pub struct DeviceMedia {
    shared: Arc<CaptureShared>,
    video_enabled: bool,
    stop_tx: Option<std_mpsc::Sender<()>>,
}

impl DeviceMedia {
    /// Aktueller Eingangspegel (0.0 - 1.0)
    pub fn input_level(&self) -> f32 {
        *self.shared.input_level.lock()
    }
}

impl LocalMedia for DeviceMedia {
    fn tracks(&self) -> Vec<TrackKind> {
        // Kein Kamera-Backend, nur Audio
        vec![TrackKind::Audio]
    }

    fn is_audio_enabled(&self) -> bool {
        self.shared.audio_enabled.load(Ordering::Relaxed)
    }

    fn set_audio_enabled(&mut self, enabled: bool) {
        self.shared.audio_enabled.store(enabled, Ordering::Relaxed);
        tracing::debug!("Audio enabled: {}", enabled);
    }

    fn is_video_enabled(&self) -> bool {
        self.video_enabled
    }

    fn set_video_enabled(&mut self, enabled: bool) {
        self.video_enabled = enabled;
        tracing::debug!("Video enabled: {}", enabled);
    }

    fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
    }
}

impl Drop for DeviceMedia {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for DeviceMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMedia")
            .field("audio_enabled", &self.is_audio_enabled())
            .field("video_enabled", &self.video_enabled)
            .field("input_level", &self.input_level())
            .finish()
    }
}

// ============================================================================
// CPAL HELPERS
// ============================================================================

/// Öffnet und startet den Capture-Stream (läuft auf dem Capture-Thread)
fn open_capture_stream(shared: &Arc<CaptureShared>) -> Result<Stream, MediaError> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or_else(|| {
        tracing::warn!("No audio input device found");
        MediaError::NoInputDevice
    })?;

    let config = find_best_input_config(&device)?;

    tracing::info!(
        "Starting audio capture: {} Hz, {} channels",
        config.sample_rate.0,
        config.channels
    );

    let level_shared = Arc::clone(shared);
    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if data.is_empty() {
                    return;
                }

                // Stummgeschaltet: Pegel auf 0
                if !level_shared.audio_enabled.load(Ordering::Relaxed) {
                    *level_shared.input_level.lock() = 0.0;
                    return;
                }

                let rms: f32 =
                    (data.iter().map(|s| s * s).sum::<f32>() / data.len() as f32).sqrt();
                *level_shared.input_level.lock() = rms.min(1.0);
            },
            |err| {
                tracing::error!("Audio capture error: {}", err);
            },
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                MediaError::Denied("input device not available".to_string())
            }
            other => MediaError::StreamBuildError(other.to_string()),
        })?;

    stream
        .play()
        .map_err(|e| MediaError::StreamPlayError(e.to_string()))?;

    Ok(stream)
}

fn find_best_input_config(device: &Device) -> Result<StreamConfig, MediaError> {
    let configs = device
        .supported_input_configs()
        .map_err(|e| MediaError::UnsupportedConfig(e.to_string()))?;

    select_best_config(configs.collect())
}

/// Wählt die beste Konfiguration: 48kHz bevorzugt, F32 bevorzugt
fn select_best_config(
    configs: Vec<SupportedStreamConfigRange>,
) -> Result<StreamConfig, MediaError> {
    let target_rate = cpal::SampleRate(SAMPLE_RATE);
    let supports_target = |c: &SupportedStreamConfigRange| {
        c.min_sample_rate() <= target_rate && c.max_sample_rate() >= target_rate
    };

    if let Some(config) = configs
        .iter()
        .find(|c| supports_target(c) && c.sample_format() == SampleFormat::F32)
    {
        return Ok(config.with_sample_rate(target_rate).into());
    }

    if let Some(config) = configs.iter().find(|c| c.sample_format() == SampleFormat::F32) {
        let rate = if supports_target(config) {
            target_rate
        } else {
            config.max_sample_rate()
        };
        return Ok(config.with_sample_rate(rate).into());
    }

    configs
        .first()
        .map(|c| c.with_max_sample_rate().into())
        .ok_or_else(|| {
            MediaError::UnsupportedConfig("No suitable audio configuration found".to_string())
        })
}

// ============================================================================
// TESTS
// ============================================================================
