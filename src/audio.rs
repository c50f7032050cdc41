//! Sound-card backend on cpal with G.711 µ-law (PCMU) framing.
//!
//! cpal streams are not `Send`, so each one is built and kept alive on its
//! own thread until told to stop. Samples cross into tokio over channels.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::MediaError;
use crate::link::RemoteAudio;
use crate::media::{AudioBackend, AudioConstraints, AudioSink, CaptureHandle, LocalAudioTrack, CLOCK_RATE};

/// 20 ms at 8 kHz.
pub const FRAME_SAMPLES: usize = 160;
const FRAME_DURATION: Duration = Duration::from_millis(20);
/// µ-law encoding of a zero sample.
pub const ULAW_SILENCE: u8 = 0xFF;
/// Cap on queued playback, one second at the device rate.
const MAX_BUFFERED_SECS: usize = 1;

const BIAS: i32 = 0x84;
const CLIP: i32 = 32635;

pub fn linear_to_ulaw(sample: i16) -> u8 {
    let mut magnitude = sample as i32;
    let sign = if magnitude < 0 {
        magnitude = -magnitude;
        0x80
    } else {
        0
    };
    magnitude = magnitude.min(CLIP) + BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && magnitude & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (magnitude >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}

pub fn ulaw_to_linear(byte: u8) -> i16 {
    let byte = (!byte) as i32;
    let exponent = (byte >> 4) & 0x07;
    let mantissa = byte & 0x0F;
    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;
    if byte & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Streaming linear-interpolation resampler. Good enough for speech.
///
/// The read position carries across chunks, so arbitrary callback sizes
/// produce the same stream as one long buffer would.
pub struct Resampler {
    /// Input samples per output sample.
    step: f64,
    /// Next read position relative to the start of the next chunk. Lies in
    /// `[-1, 0)` when it falls between the previous chunk and this one.
    pos: f64,
    prev: Option<f32>,
    passthrough: bool,
}

impl Resampler {
    pub fn new(from: u32, to: u32) -> Self {
        Self {
            step: from as f64 / to as f64,
            pos: 0.0,
            prev: None,
            passthrough: from == to,
        }
    }

    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if self.passthrough || input.is_empty() {
            return input.to_vec();
        }
        let last = (input.len() - 1) as f64;
        let mut out = Vec::with_capacity((input.len() as f64 / self.step) as usize + 1);
        while self.pos < last {
            let floor = self.pos.floor();
            let frac = (self.pos - floor) as f32;
            let a = if floor < 0.0 {
                self.prev.unwrap_or(input[0])
            } else {
                input[floor as usize]
            };
            let b = input[(floor + 1.0) as usize];
            out.push(a + (b - a) * frac);
            self.pos += self.step;
        }
        self.pos -= input.len() as f64;
        self.prev = input.last().copied();
        out
    }
}

fn encode_frame(frame: &[f32]) -> Vec<u8> {
    frame
        .iter()
        .map(|s| linear_to_ulaw((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16))
        .collect()
}

fn decode_frame(payload: &[u8]) -> Vec<f32> {
    payload
        .iter()
        .map(|b| ulaw_to_linear(*b) as f32 / i16::MAX as f32)
        .collect()
}

fn backend_error(description: String) -> MediaError {
    let lower = description.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized")
    {
        MediaError::PermissionDenied(description)
    } else {
        MediaError::DeviceBusy(description)
    }
}

fn classify_config(err: cpal::DefaultStreamConfigError) -> MediaError {
    match err {
        cpal::DefaultStreamConfigError::DeviceNotAvailable => {
            MediaError::DeviceNotFound("device disappeared".into())
        }
        cpal::DefaultStreamConfigError::StreamTypeNotSupported => {
            MediaError::DeviceNotFound("device cannot stream audio".into())
        }
        cpal::DefaultStreamConfigError::BackendSpecific { err } => backend_error(err.description),
    }
}

fn classify_build(err: cpal::BuildStreamError) -> MediaError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => {
            MediaError::DeviceBusy("device not available".into())
        }
        cpal::BuildStreamError::BackendSpecific { err } => backend_error(err.description),
        other => MediaError::DeviceBusy(other.to_string()),
    }
}

fn classify_play(err: cpal::PlayStreamError) -> MediaError {
    match err {
        cpal::PlayStreamError::DeviceNotAvailable => {
            MediaError::DeviceBusy("device not available".into())
        }
        cpal::PlayStreamError::BackendSpecific { err } => backend_error(err.description),
    }
}

fn find_device(input: bool, name: Option<&str>) -> Result<cpal::Device, MediaError> {
    let host = cpal::default_host();
    let kind = if input { "input" } else { "output" };
    match name {
        None => {
            let device = if input {
                host.default_input_device()
            } else {
                host.default_output_device()
            };
            device.ok_or_else(|| MediaError::DeviceNotFound(format!("no default {kind} device")))
        }
        Some(name) => {
            let devices: Vec<cpal::Device> = if input {
                host.input_devices().map(|d| d.collect())
            } else {
                host.output_devices().map(|d| d.collect())
            }
            .map_err(|e| backend_error(e.to_string()))?;
            devices
                .into_iter()
                .find(|d| d.name().is_ok_and(|n| n == name))
                .ok_or_else(|| MediaError::DeviceNotFound(format!("no {kind} device named {name}")))
        }
    }
}

/// Plays and records through the host's sound devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

struct CpalCapture {
    stop: Option<oneshot::Sender<()>>,
    encoder: JoinHandle<()>,
}

impl CaptureHandle for CpalCapture {
    fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.encoder.abort();
    }
}

struct CpalSink {
    stop: Option<oneshot::Sender<()>>,
    reader: JoinHandle<()>,
}

impl AudioSink for CpalSink {
    fn close(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.reader.abort();
    }
}

#[async_trait]
impl AudioBackend for CpalBackend {
    async fn start_capture(
        &self,
        constraints: &AudioConstraints,
        track: LocalAudioTrack,
    ) -> Result<Box<dyn CaptureHandle>, MediaError> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let (samples_tx, samples_rx) = mpsc::unbounded_channel();
        let device_name = constraints.input_device.clone();

        std::thread::Builder::new()
            .name("meshvoice-capture".into())
            .spawn(move || {
                let stream = match open_input(device_name.as_deref(), samples_tx) {
                    Ok((stream, rate)) => {
                        let _ = ready_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = stop_rx.blocking_recv();
                drop(stream);
                debug!("Capture stream closed");
            })
            .map_err(|e| MediaError::DeviceBusy(e.to_string()))?;

        let rate = ready_rx
            .await
            .map_err(|_| MediaError::DeviceBusy("capture thread exited".into()))??;
        info!(rate, "Microphone open");

        let encoder = tokio::spawn(encode_loop(samples_rx, rate, track));
        Ok(Box::new(CpalCapture {
            stop: Some(stop_tx),
            encoder,
        }))
    }

    async fn open_sink(
        &self,
        constraints: &AudioConstraints,
        peer: &str,
        remote: Arc<dyn RemoteAudio>,
    ) -> Result<Box<dyn AudioSink>, MediaError> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let (pcm_tx, pcm_rx) = mpsc::unbounded_channel();
        let device_name = constraints.output_device.clone();

        std::thread::Builder::new()
            .name(format!("meshvoice-sink-{peer}"))
            .spawn(move || {
                let stream = match open_output(device_name.as_deref(), pcm_rx) {
                    Ok((stream, rate)) => {
                        let _ = ready_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = stop_rx.blocking_recv();
                drop(stream);
            })
            .map_err(|e| MediaError::DeviceBusy(e.to_string()))?;

        let rate = ready_rx
            .await
            .map_err(|_| MediaError::DeviceBusy("playback thread exited".into()))??;
        debug!(peer, rate, "Speaker open");

        let peer = peer.to_string();
        let reader = tokio::spawn(async move {
            let mut resampler = Resampler::new(CLOCK_RATE, rate);
            while let Some(payload) = remote.read_packet().await {
                let pcm = resampler.process(&decode_frame(&payload));
                if pcm_tx.send(pcm).is_err() {
                    break;
                }
            }
            debug!(peer = %peer, "Remote audio ended");
        });
        Ok(Box::new(CpalSink {
            stop: Some(stop_tx),
            reader,
        }))
    }
}

async fn encode_loop(mut samples: mpsc::UnboundedReceiver<Vec<f32>>, rate: u32, track: LocalAudioTrack) {
    let sample_track = track.sample_track();
    let mut resampler = Resampler::new(rate, CLOCK_RATE);
    let mut pending: Vec<f32> = Vec::with_capacity(FRAME_SAMPLES * 2);
    while let Some(chunk) = samples.recv().await {
        pending.extend(resampler.process(&chunk));
        while pending.len() >= FRAME_SAMPLES {
            let frame: Vec<f32> = pending.drain(..FRAME_SAMPLES).collect();
            let payload = if track.is_enabled() {
                encode_frame(&frame)
            } else {
                vec![ULAW_SILENCE; FRAME_SAMPLES]
            };
            let sample = webrtc::media::Sample {
                data: Bytes::from(payload),
                duration: FRAME_DURATION,
                ..Default::default()
            };
            if let Err(e) = sample_track.write_sample(&sample).await {
                debug!(error = %e, "Dropped outgoing frame");
            }
        }
    }
}

fn open_input(
    name: Option<&str>,
    tx: mpsc::UnboundedSender<Vec<f32>>,
) -> Result<(cpal::Stream, u32), MediaError> {
    let device = find_device(true, name)?;
    let supported = device.default_input_config().map_err(classify_config)?;
    let rate = supported.sample_rate().0;
    let config: cpal::StreamConfig = supported.config();

    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_input::<f32>(&device, &config, tx),
        SampleFormat::I16 => build_input::<i16>(&device, &config, tx),
        SampleFormat::U16 => build_input::<u16>(&device, &config, tx),
        other => {
            return Err(MediaError::DeviceNotFound(format!(
                "unsupported input sample format {other:?}"
            )))
        }
    }
    .map_err(classify_build)?;
    stream.play().map_err(classify_play)?;
    Ok((stream, rate))
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    tx: mpsc::UnboundedSender<Vec<f32>>,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let mono: Vec<f32> = data
                .chunks(channels)
                .map(|frame| {
                    frame.iter().map(|s| f32::from_sample(*s)).sum::<f32>() / frame.len() as f32
                })
                .collect();
            let _ = tx.send(mono);
        },
        |err| warn!(error = %err, "Input stream error"),
        None,
    )
}

fn open_output(
    name: Option<&str>,
    rx: mpsc::UnboundedReceiver<Vec<f32>>,
) -> Result<(cpal::Stream, u32), MediaError> {
    let device = find_device(false, name)?;
    let supported = device.default_output_config().map_err(classify_config)?;
    let rate = supported.sample_rate().0;
    let config: cpal::StreamConfig = supported.config();

    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_output::<f32>(&device, &config, rx),
        SampleFormat::I16 => build_output::<i16>(&device, &config, rx),
        SampleFormat::U16 => build_output::<u16>(&device, &config, rx),
        other => {
            return Err(MediaError::DeviceNotFound(format!(
                "unsupported output sample format {other:?}"
            )))
        }
    }
    .map_err(classify_build)?;
    stream.play().map_err(classify_play)?;
    Ok((stream, rate))
}

fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut rx: mpsc::UnboundedReceiver<Vec<f32>>,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    let max_buffered = config.sample_rate.0 as usize * MAX_BUFFERED_SECS;
    let mut pending: VecDeque<f32> = VecDeque::new();
    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            while let Ok(chunk) = rx.try_recv() {
                pending.extend(chunk);
            }
            if pending.len() > max_buffered {
                let excess = pending.len() - max_buffered;
                pending.drain(..excess);
            }
            for frame in data.chunks_mut(channels) {
                let value = T::from_sample(pending.pop_front().unwrap_or(0.0));
                for out in frame.iter_mut() {
                    *out = value;
                }
            }
        },
        |err| warn!(error = %err, "Output stream error"),
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ulaw_known_values() {
        assert_eq!(linear_to_ulaw(0), ULAW_SILENCE);
        assert_eq!(linear_to_ulaw(1000), 0xCE);
        assert_eq!(ulaw_to_linear(0xCE), 988);
        assert_eq!(ulaw_to_linear(linear_to_ulaw(-1000)), -988);
        assert_eq!(ulaw_to_linear(ULAW_SILENCE), 0);
    }

    #[test]
    fn ulaw_clips_extremes() {
        let loud = ulaw_to_linear(linear_to_ulaw(i16::MAX));
        let quiet = ulaw_to_linear(linear_to_ulaw(i16::MIN + 1));
        assert_eq!(loud, -quiet);
        assert!(loud > 30000);
    }

    #[test]
    fn resampler_scales_length() {
        let input = vec![0.0; 480];
        assert_eq!(Resampler::new(48_000, 8_000).process(&input).len(), 80);
        assert_eq!(Resampler::new(8_000, 8_000).process(&input).len(), 480);
    }

    #[test]
    fn odd_callback_sizes_keep_the_fractional_position() {
        // One second at 44.1 kHz delivered in 512-sample callbacks.
        let mut resampler = Resampler::new(44_100, 8_000);
        let chunk = vec![0.0; 512];
        let produced: usize = (0..100).map(|_| resampler.process(&chunk).len()).sum();
        let exact = 51_200.0 * 8_000.0 / 44_100.0;
        assert!((produced as f64 - exact).abs() <= 1.0, "{produced} vs {exact}");

        let mut up = Resampler::new(8_000, 48_000);
        let frame = vec![0.0; FRAME_SAMPLES];
        let produced: usize = (0..50).map(|_| up.process(&frame).len()).sum();
        assert!((47_990..=48_000).contains(&produced), "{produced}");
    }

    #[test]
    fn resampler_interpolates_across_chunk_boundaries() {
        let mut resampler = Resampler::new(1, 2);
        assert_eq!(resampler.process(&[0.0, 1.0]), vec![0.0, 0.5]);
        assert_eq!(resampler.process(&[2.0, 3.0]), vec![1.0, 1.5, 2.0, 2.5]);
    }

    #[test]
    fn frames_survive_the_codec() {
        let frame: Vec<f32> = (0..FRAME_SAMPLES).map(|i| (i as f32 / 80.0) - 1.0).collect();
        let decoded = decode_frame(&encode_frame(&frame));
        assert_eq!(decoded.len(), FRAME_SAMPLES);
        for (a, b) in frame.iter().zip(decoded.iter()) {
            assert!((a - b).abs() < 0.05, "{a} vs {b}");
        }
    }

    #[test]
    fn backend_messages_classify_permission_problems() {
        assert!(matches!(
            backend_error("Access denied by the OS".into()),
            MediaError::PermissionDenied(_)
        ));
        assert!(matches!(
            backend_error("device in exclusive use".into()),
            MediaError::DeviceBusy(_)
        ));
    }
}
