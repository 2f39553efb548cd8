use std::{
    sync::{Arc, Mutex, PoisonError},
    thread,
    time::Duration,
};

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig,
};
use tracing::{debug, error, info};

use crate::{analysis::TempoEstimator, config::AudioConfig, HueTempoError, Result};

/// Produces one raw tempo estimate per call, blocking for a full
/// capture-and-analyse cycle.
pub trait TempoSource: Send {
    fn sample(&mut self) -> Result<f32>;

    /// How long the sampling loop waits before retrying after an error.
    fn retry_delay(&self) -> Duration {
        Duration::from_secs(1)
    }
}

impl<S: TempoSource + ?Sized> TempoSource for Box<S> {
    fn sample(&mut self) -> Result<f32> {
        (**self).sample()
    }

    fn retry_delay(&self) -> Duration {
        (**self).retry_delay()
    }
}

/// Records a clip from an input device and estimates its tempo.
///
/// The stream lives only for the duration of one capture, so the source
/// itself holds no backend handles and can move between threads.
#[derive(Debug)]
pub struct MicrophoneTempoSource {
    device: Option<usize>,
    capture_window: Duration,
    bpm_multiplier: f32,
    estimator: TempoEstimator,
}

impl MicrophoneTempoSource {
    /// Creates a source for the configured device, or the host default.
    pub fn from_config(config: &AudioConfig) -> Self {
        Self {
            device: config.device,
            capture_window: config.capture_window(),
            bpm_multiplier: config.bpm_multiplier,
            estimator: TempoEstimator::from_config(config),
        }
    }

    /// Captures one mono clip. Returns the samples and their sample rate.
    pub fn capture(&self) -> Result<(Vec<f32>, u32)> {
        let device = select_device(self.device)?;
        let supported = device
            .default_input_config()
            .map_err(HueTempoError::audio)?;
        let config: StreamConfig = supported.config();
        let sample_rate = config.sample_rate.0;

        let capacity = (self.capture_window.as_secs_f32() * sample_rate as f32) as usize;
        let buffer = Arc::new(Mutex::new(Vec::with_capacity(capacity)));
        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_stream::<f32>(&device, &config, buffer.clone())?,
            SampleFormat::I16 => build_stream::<i16>(&device, &config, buffer.clone())?,
            SampleFormat::U16 => build_stream::<u16>(&device, &config, buffer.clone())?,
            other => {
                return Err(HueTempoError::Audio(format!(
                    "unsupported sample format: {other}"
                )))
            }
        };

        debug!(sample_rate, window = ?self.capture_window, "listening");
        stream.play().map_err(HueTempoError::audio)?;
        thread::sleep(self.capture_window);
        drop(stream);

        let clip = std::mem::take(&mut *buffer.lock().unwrap_or_else(PoisonError::into_inner));
        Ok((clip, sample_rate))
    }
}

impl TempoSource for MicrophoneTempoSource {
    fn sample(&mut self) -> Result<f32> {
        let (clip, sample_rate) = self.capture()?;
        match self.estimator.estimate(&clip, sample_rate)? {
            Some(estimate) => {
                let bpm = estimate.bpm * self.bpm_multiplier;
                info!(bpm, confidence = estimate.confidence, "heard tempo");
                Ok(bpm)
            }
            None => {
                debug!(samples = clip.len(), "no tempo in capture");
                Ok(0.0)
            }
        }
    }

    fn retry_delay(&self) -> Duration {
        self.capture_window
    }
}

/// Replays a fixed list of estimates, repeating the last one forever.
#[derive(Debug, Clone)]
pub struct ScriptedTempoSource {
    samples: Vec<f32>,
    position: usize,
    period: Duration,
}

impl ScriptedTempoSource {
    /// `period` stands in for the capture latency of a real source.
    pub fn new(samples: Vec<f32>, period: Duration) -> Self {
        Self {
            samples,
            position: 0,
            period,
        }
    }
}

impl TempoSource for ScriptedTempoSource {
    fn sample(&mut self) -> Result<f32> {
        thread::sleep(self.period);
        let index = self.position.min(self.samples.len().saturating_sub(1));
        let bpm = *self
            .samples
            .get(index)
            .ok_or(HueTempoError::InvalidInput("scripted source has no samples"))?;
        self.position += 1;
        Ok(bpm)
    }

    fn retry_delay(&self) -> Duration {
        self.period
    }
}

/// Summary of an input device, as shown by the command line.
#[derive(Debug, Clone)]
pub struct InputDevice {
    pub index: usize,
    pub name: String,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
}

/// Returns every input device of the default host, in index order.
pub fn list_input_devices() -> Result<Vec<InputDevice>> {
    let host = cpal::default_host();
    let devices = host.input_devices().map_err(HueTempoError::audio)?;

    Ok(devices
        .enumerate()
        .map(|(index, device)| {
            let name = device
                .name()
                .unwrap_or_else(|_| "unknown device".to_string());
            let config = device.default_input_config().ok();
            InputDevice {
                index,
                name,
                sample_rate: config.as_ref().map(|config| config.sample_rate().0),
                channels: config.as_ref().map(|config| config.channels()),
            }
        })
        .collect())
}

fn select_device(index: Option<usize>) -> Result<Device> {
    let host = cpal::default_host();
    let device = match index {
        Some(index) => host
            .input_devices()
            .map_err(HueTempoError::audio)?
            .nth(index)
            .ok_or_else(|| HueTempoError::Audio(format!("input device index {index} not found")))?,
        None => host
            .default_input_device()
            .ok_or_else(|| HueTempoError::Audio("no default input device available".into()))?,
    };
    debug!(
        device = %device.name().unwrap_or_else(|_| "unknown device".to_string()),
        "using input device"
    );
    Ok(device)
}

/// Builds an input stream that downmixes every frame to mono into `buffer`.
fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    buffer: Arc<Mutex<Vec<f32>>>,
) -> Result<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = usize::from(config.channels.max(1));
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if let Ok(mut buffer) = buffer.lock() {
                    for frame in data.chunks_exact(channels) {
                        let sum: f32 = frame.iter().map(|sample| f32::from_sample(*sample)).sum();
                        buffer.push(sum / channels as f32);
                    }
                }
            },
            |err| error!(%err, "audio stream error"),
            None,
        )
        .map_err(HueTempoError::audio)
}
