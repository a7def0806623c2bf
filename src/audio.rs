//! Microphone capture and remote-track playback.
//!
//! cpal streams are not `Send`, so each stream lives on its own thread and
//! talks to the async side over plain channels. Samples cross the wire as
//! little-endian f32 PCM inside media samples; codec work is delegated to
//! the transport layer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use tracing::{debug, warn};
use webrtc::media::Sample as MediaSample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{Error, Result};

/// Owns the microphone input stream. `stop` is idempotent; dropping the
/// handle stops the stream as well.
pub struct AudioCapture {
    stop_tx: Option<std_mpsc::Sender<()>>,
}

impl AudioCapture {
    /// Starts capturing into `track`. While `enabled` is false the callback
    /// discards input without touching the track.
    pub fn start(track: Arc<TrackLocalStaticSample>, enabled: Arc<AtomicBool>) -> Result<Self> {
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<()>>();

        let spawned = std::thread::Builder::new()
            .name("jamlink-capture".to_owned())
            .spawn(move || {
                let stream = match open_input(track, enabled) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Keep the stream alive until stop is requested or the
                // handle is dropped.
                let _ = stop_rx.recv();
                drop(stream);
            });
        if let Err(e) = spawned {
            return Err(Error::MediaAccessDenied(format!(
                "failed to spawn capture thread: {e}"
            )));
        }

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                stop_tx: Some(stop_tx),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::MediaAccessDenied(
                "capture thread exited before opening a device".to_owned(),
            )),
        }
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_input(track: Arc<TrackLocalStaticSample>, enabled: Arc<AtomicBool>) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| Error::MediaAccessDenied("no input device available".to_owned()))?;
    let config = device
        .default_input_config()
        .map_err(|e| Error::MediaAccessDenied(e.to_string()))?;
    debug!(?config, "opening input device");

    let stream = match config.sample_format() {
        SampleFormat::F32 => build_input_stream::<f32>(&device, &config.into(), track, enabled)?,
        SampleFormat::I16 => build_input_stream::<i16>(&device, &config.into(), track, enabled)?,
        SampleFormat::U16 => build_input_stream::<u16>(&device, &config.into(), track, enabled)?,
        other => {
            return Err(Error::MediaAccessDenied(format!(
                "unsupported sample format: {other:?}"
            )))
        }
    };
    stream
        .play()
        .map_err(|e| Error::MediaAccessDenied(e.to_string()))?;
    Ok(stream)
}

fn build_input_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
) -> Result<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let err_fn = |err| warn!(error = %err, "input stream error");
    let sample_rate = config.sample_rate.0.max(1);
    let channels = config.channels.max(1) as usize;

    let stream = device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if !enabled.load(Ordering::Relaxed) {
                    return;
                }
                let mut bytes = Vec::with_capacity(data.len() * 4);
                for s in data {
                    bytes.extend_from_slice(&f32::from_sample(*s).to_le_bytes());
                }
                let frames = data.len() / channels;
                let sample = MediaSample {
                    data: bytes.into(),
                    duration: Duration::from_secs_f64(frames as f64 / sample_rate as f64),
                    ..Default::default()
                };
                if let Err(e) = futures::executor::block_on(track.write_sample(&sample)) {
                    debug!(error = %e, "failed to write capture sample");
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| Error::MediaAccessDenied(e.to_string()))?;
    Ok(stream)
}

/// Plays a remote audio track on the default output device. Fire-and-forget:
/// playback ends when the track's transport closes.
pub struct AudioPlayback;

impl AudioPlayback {
    pub fn spawn(track: Arc<TrackRemote>) {
        let (sample_tx, sample_rx) = std_mpsc::channel::<Vec<f32>>();
        let (done_tx, done_rx) = std_mpsc::channel::<()>();

        tokio::spawn(async move {
            while let Ok((rtp, _)) = track.read_rtp().await {
                let samples: Vec<f32> = rtp
                    .payload
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                if sample_tx.send(samples).is_err() {
                    break;
                }
            }
            let _ = done_tx.send(());
        });

        let spawned = std::thread::Builder::new()
            .name("jamlink-playback".to_owned())
            .spawn(move || {
                let stream = match open_output(sample_rx) {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(error = %e, "audio playback unavailable");
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    warn!(error = %e, "failed to start playback stream");
                    return;
                }
                let _ = done_rx.recv();
            });
        if let Err(e) = spawned {
            warn!(error = %e, "failed to spawn playback thread");
        }
    }
}

fn open_output(sample_rx: std_mpsc::Receiver<Vec<f32>>) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::MediaAccessDenied("no output device available".to_owned()))?;
    let config = device
        .default_output_config()
        .map_err(|e| Error::MediaAccessDenied(e.to_string()))?;
    debug!(?config, "opening output device");

    match config.sample_format() {
        SampleFormat::F32 => build_output_stream::<f32>(&device, &config.into(), sample_rx),
        SampleFormat::I16 => build_output_stream::<i16>(&device, &config.into(), sample_rx),
        SampleFormat::U16 => build_output_stream::<u16>(&device, &config.into(), sample_rx),
        other => Err(Error::MediaAccessDenied(format!(
            "unsupported sample format: {other:?}"
        ))),
    }
}

fn build_output_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_rx: std_mpsc::Receiver<Vec<f32>>,
) -> Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let err_fn = |err| warn!(error = %err, "output stream error");

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| match sample_rx.try_recv() {
                Ok(samples) => {
                    let mut src = samples.into_iter();
                    for out in data.iter_mut() {
                        *out = T::from_sample(src.next().unwrap_or(0.0));
                    }
                }
                Err(_) => {
                    // No samples queued; output silence.
                    for out in data.iter_mut() {
                        *out = T::from_sample(0.0f32);
                    }
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| Error::MediaAccessDenied(e.to_string()))?;
    Ok(stream)
}
