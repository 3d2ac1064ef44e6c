//! Relay audio encoder.
//!
//! Turns captured float audio into PCM16 relay frames:
//!
//! ```text
//!   capture (e.g. 48 kHz) ─▶ RNNoise (optional) ─▶ resample to 16 kHz
//!        ─▶ 4096-sample frames ─▶ silence gate ─▶ voice:audio-chunk
//! ```
//!
//! The gate drops frames whose RMS energy is below the silence threshold and
//! frames that are almost entirely near-zero samples (silent or corrupt
//! buffers). Frames are broadcast to the room, not addressed per peer.

use crate::capture::LocalTrack;
use crate::signaling::SignalingConsumer;
use chrono::{DateTime, Utc};
use nnnoiseless::{DenoiseState, FRAME_SIZE};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use watchroom_common::config::VoiceConfig;
use watchroom_common::{UserId, VoiceError, VoiceResult};

const PCM_NEG_SCALE: f32 = 32_768.0;
const PCM_POS_SCALE: f32 = 32_767.0;

/// RNNoise operates on 48 kHz input only.
const DENOISE_RATE: u32 = 48_000;

/// One relay audio frame.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayFrame {
    pub peer_id: UserId,
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub capture_timestamp: DateTime<Utc>,
}

impl RelayFrame {
    pub fn new(peer_id: UserId, samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            peer_id,
            samples,
            sample_rate,
            capture_timestamp: Utc::now(),
        }
    }

    /// Decode a little-endian PCM16 payload.
    pub fn from_bytes(peer_id: UserId, bytes: &[u8], sample_rate: u32) -> VoiceResult<Self> {
        if bytes.is_empty() {
            return Err(VoiceError::decode("empty audio payload"));
        }
        if bytes.len() % 2 != 0 {
            return Err(VoiceError::decode(format!(
                "odd payload length {}",
                bytes.len()
            )));
        }
        if sample_rate == 0 {
            return Err(VoiceError::decode("zero sample rate"));
        }
        let samples = bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        Ok(Self::new(peer_id, samples, sample_rate))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    pub fn duration(&self) -> Duration {
        let nanos = self.samples.len() as u64 * 1_000_000_000 / u64::from(self.sample_rate);
        Duration::from_nanos(nanos)
    }

    pub fn to_float(&self) -> Vec<f32> {
        self.samples.iter().copied().map(pcm16_to_float).collect()
    }
}

pub fn float_to_pcm16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * PCM_NEG_SCALE) as i16
    } else {
        (s * PCM_POS_SCALE) as i16
    }
}

pub fn pcm16_to_float(sample: i16) -> f32 {
    let s = f32::from(sample);
    if sample < 0 {
        s / PCM_NEG_SCALE
    } else {
        s / PCM_POS_SCALE
    }
}

pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// What the gate decided for one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameVerdict {
    Send(Vec<i16>),
    Silent { rms: f32 },
    Degenerate { near_zero_ratio: f32 },
}

/// The two cheap filters applied before a frame is transmitted.
#[derive(Debug, Clone)]
pub struct SilenceGate {
    rms_threshold: f32,
    near_zero_amplitude: u16,
    max_near_zero_ratio: f32,
}

impl SilenceGate {
    pub fn from_config(config: &VoiceConfig) -> Self {
        Self {
            rms_threshold: config.silence_rms_threshold,
            near_zero_amplitude: config.near_zero_amplitude.unsigned_abs(),
            max_near_zero_ratio: config.max_near_zero_ratio,
        }
    }

    pub fn evaluate(&self, frame: &[f32]) -> FrameVerdict {
        let energy = rms(frame);
        if frame.is_empty() || energy < self.rms_threshold || energy.is_nan() {
            return FrameVerdict::Silent { rms: energy };
        }

        let pcm: Vec<i16> = frame.iter().copied().map(float_to_pcm16).collect();
        let near_zero = pcm
            .iter()
            .filter(|s| s.unsigned_abs() < self.near_zero_amplitude)
            .count();
        let near_zero_ratio = near_zero as f32 / pcm.len() as f32;
        if near_zero_ratio > self.max_near_zero_ratio {
            return FrameVerdict::Degenerate { near_zero_ratio };
        }

        FrameVerdict::Send(pcm)
    }
}

/// Streaming linear-interpolation resampler.
#[derive(Debug)]
struct LinearResampler {
    step: f64,
    pos: f64,
    last: Option<f32>,
}

impl LinearResampler {
    fn new(input_rate: u32, output_rate: u32) -> Self {
        Self {
            step: f64::from(input_rate) / f64::from(output_rate),
            pos: 0.0,
            last: None,
        }
    }

    fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        let mut buf = Vec::with_capacity(input.len() + 1);
        buf.extend(self.last);
        buf.extend_from_slice(input);
        if buf.is_empty() {
            return;
        }

        while self.pos + 1.0 < buf.len() as f64 {
            let i = self.pos.floor() as usize;
            let frac = (self.pos - i as f64) as f32;
            out.push(buf[i] + (buf[i + 1] - buf[i]) * frac);
            self.pos += self.step;
        }

        // the final sample carries into the next block as index 0
        self.pos -= (buf.len() - 1) as f64;
        self.last = buf.last().copied();
    }
}

/// RNNoise over 480-sample frames; input and output in -1.0..=1.0.
struct Denoiser {
    state: Box<DenoiseState<'static>>,
    pending: Vec<f32>,
    out: [f32; FRAME_SIZE],
}

impl Denoiser {
    fn new() -> Self {
        Self {
            state: DenoiseState::new(),
            pending: Vec::with_capacity(FRAME_SIZE * 2),
            out: [0.0; FRAME_SIZE],
        }
    }

    fn process(&mut self, input: &[f32], output: &mut Vec<f32>) {
        // rnnoise expects samples scaled to the i16 range
        self.pending
            .extend(input.iter().map(|s| s.clamp(-1.0, 1.0) * PCM_POS_SCALE));
        while self.pending.len() >= FRAME_SIZE {
            let frame: Vec<f32> = self.pending.drain(..FRAME_SIZE).collect();
            self.state.process_frame(&mut self.out, &frame);
            output.extend(self.out.iter().map(|s| s / PCM_POS_SCALE));
        }
    }
}

/// Counters for the relay send path.
#[derive(Debug, Default)]
pub struct RelayStats {
    frames_sent: AtomicU64,
    frames_silent: AtomicU64,
    frames_degenerate: AtomicU64,
    send_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayStatsSnapshot {
    pub frames_sent: u64,
    pub frames_silent: u64,
    pub frames_degenerate: u64,
    pub send_errors: u64,
}

impl RelayStats {
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_silent: self.frames_silent.load(Ordering::Relaxed),
            frames_degenerate: self.frames_degenerate.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
        }
    }
}

/// Synchronous encode pipeline for one capture track.
pub struct RelayEncoder {
    gate: SilenceGate,
    target_rate: u32,
    frame_samples: usize,
    denoiser: Option<Denoiser>,
    resampler: Option<LinearResampler>,
    staged: Vec<f32>,
    stats: Arc<RelayStats>,
}

impl RelayEncoder {
    pub fn new(config: &VoiceConfig, capture_rate: u32) -> VoiceResult<Self> {
        if capture_rate == 0 {
            return Err(VoiceError::relay_start("capture track reports a 0 Hz sample rate"));
        }
        if config.relay_sample_rate == 0 {
            return Err(VoiceError::relay_start("relay sample rate must be non-zero"));
        }

        let denoiser = if config.noise_suppression && capture_rate == DENOISE_RATE {
            Some(Denoiser::new())
        } else {
            if config.noise_suppression {
                tracing::debug!(rate = capture_rate, "Noise suppression skipped for non-48kHz capture");
            }
            None
        };
        let resampler = (capture_rate != config.relay_sample_rate)
            .then(|| LinearResampler::new(capture_rate, config.relay_sample_rate));

        Ok(Self {
            gate: SilenceGate::from_config(config),
            target_rate: config.relay_sample_rate,
            frame_samples: config.relay_frame_samples.max(1),
            denoiser,
            resampler,
            staged: Vec::with_capacity(config.relay_frame_samples * 2),
            stats: Arc::new(RelayStats::default()),
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.target_rate
    }

    pub fn stats(&self) -> Arc<RelayStats> {
        self.stats.clone()
    }

    /// Feed one captured block; returns the frames worth transmitting.
    pub fn push(&mut self, block: &[f32]) -> Vec<Vec<i16>> {
        let mut cleaned = Vec::new();
        let input: &[f32] = match &mut self.denoiser {
            Some(denoiser) => {
                denoiser.process(block, &mut cleaned);
                &cleaned
            }
            None => block,
        };

        match &mut self.resampler {
            Some(resampler) => resampler.process(input, &mut self.staged),
            None => self.staged.extend_from_slice(input),
        }

        let mut ready = Vec::new();
        while self.staged.len() >= self.frame_samples {
            let frame: Vec<f32> = self.staged.drain(..self.frame_samples).collect();
            match self.gate.evaluate(&frame) {
                FrameVerdict::Send(pcm) => ready.push(pcm),
                FrameVerdict::Silent { .. } => {
                    self.stats.frames_silent.fetch_add(1, Ordering::Relaxed);
                }
                FrameVerdict::Degenerate { near_zero_ratio } => {
                    tracing::trace!(ratio = near_zero_ratio, "Dropping near-zero frame");
                    self.stats.frames_degenerate.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        ready
    }
}

/// The running relay send task. Aborted on stop or drop.
pub struct RelaySender {
    handle: JoinHandle<()>,
    stats: Arc<RelayStats>,
    track_id: uuid::Uuid,
}

impl RelaySender {
    /// Start relaying `track`. The track must be live and unmuted.
    pub fn start(
        track: &LocalTrack,
        signaling: SignalingConsumer,
        config: &VoiceConfig,
    ) -> VoiceResult<Self> {
        if !track.is_live() {
            return Err(VoiceError::relay_start("microphone track has ended"));
        }
        if !track.is_enabled() {
            return Err(VoiceError::relay_start("microphone is muted"));
        }

        let mut encoder = RelayEncoder::new(config, track.sample_rate())?;
        let stats = encoder.stats();
        let rate = encoder.sample_rate();
        let mut blocks = track.subscribe();
        let task_track = track.clone();
        let task_stats = stats.clone();
        let self_id = signaling.self_id();

        let handle = tokio::spawn(async move {
            loop {
                let block = match blocks.recv().await {
                    Ok(block) => block,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Relay encoder fell behind capture");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                if !task_track.is_live() {
                    break;
                }
                if !task_track.is_enabled() {
                    continue;
                }

                for pcm in encoder.push(&block) {
                    if !signaling.is_connected() {
                        continue;
                    }
                    let frame = RelayFrame::new(self_id, pcm, rate);
                    match signaling.send_audio_chunk(frame.to_bytes(), rate).await {
                        Ok(()) => {
                            task_stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            task_stats.send_errors.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(error = %e, "Failed to send relay chunk");
                        }
                    }
                }
            }
            tracing::debug!("Relay encoder task finished");
        });

        tracing::info!(track = %track.id(), rate, "Relay send started");
        Ok(Self {
            handle,
            stats,
            track_id: track.id(),
        })
    }

    pub fn track_id(&self) -> uuid::Uuid {
        self.track_id
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn stop(self) {
        tracing::info!(track = %self.track_id, "Relay send stopped");
        drop(self);
    }
}

impl Drop for RelaySender {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
